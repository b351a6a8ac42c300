mod local;
mod object;

use std::sync::Arc;

pub use local::LocalBackend;
pub use object::{BucketProvider, InMemoryProvider, ObjectBackend};
#[cfg(feature = "aws")]
pub use object::S3Provider;
use tessera_error::TesseraResult;

use crate::uri::Uri;

/// Storage services a VFS instance can route to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FsKind {
    File,
    Hdfs,
    S3,
}

/// A resolved, cheaply cloneable reference to the backend serving a URI.
#[derive(Clone)]
pub(crate) enum Backend {
    Local(Arc<LocalBackend>),
    Object(Arc<ObjectBackend>),
}

impl Backend {
    pub fn create_dir(&self, uri: &Uri) -> TesseraResult<()> {
        match self {
            Backend::Local(b) => b.create_dir(uri),
            Backend::Object(b) => b.create_dir(uri),
        }
    }

    pub fn remove_dir(&self, uri: &Uri) -> TesseraResult<()> {
        match self {
            Backend::Local(b) => b.remove_dir(uri),
            Backend::Object(b) => b.remove_dir(uri),
        }
    }

    pub fn is_dir(&self, uri: &Uri) -> TesseraResult<bool> {
        match self {
            Backend::Local(b) => Ok(b.is_dir(uri)),
            Backend::Object(b) => b.is_dir(uri),
        }
    }

    pub fn ls(&self, uri: &Uri) -> TesseraResult<Vec<String>> {
        match self {
            Backend::Local(b) => b.ls(uri),
            Backend::Object(b) => b.ls(uri),
        }
    }

    pub fn touch(&self, uri: &Uri) -> TesseraResult<()> {
        match self {
            Backend::Local(b) => b.touch(uri),
            Backend::Object(b) => b.touch(uri),
        }
    }

    pub fn remove_file(&self, uri: &Uri) -> TesseraResult<()> {
        match self {
            Backend::Local(b) => b.remove_file(uri),
            Backend::Object(b) => b.remove_file(uri),
        }
    }

    pub fn is_file(&self, uri: &Uri) -> TesseraResult<bool> {
        match self {
            Backend::Local(b) => Ok(b.is_file(uri)),
            Backend::Object(b) => b.is_file(uri),
        }
    }

    pub fn file_size(&self, uri: &Uri) -> TesseraResult<u64> {
        match self {
            Backend::Local(b) => b.file_size(uri),
            Backend::Object(b) => b.file_size(uri),
        }
    }

    pub fn read(&self, uri: &Uri, offset: u64, buffer: &mut [u8]) -> TesseraResult<()> {
        match self {
            Backend::Local(b) => b.read(uri, offset, buffer),
            Backend::Object(b) => b.read(uri, offset, buffer),
        }
    }

    /// Append `buffer` to the file, creating it if needed.
    pub fn write(&self, uri: &Uri, buffer: &[u8]) -> TesseraResult<()> {
        match self {
            Backend::Local(b) => b.write(uri, buffer),
            Backend::Object(b) => b.write(uri, buffer),
        }
    }

    pub fn sync(&self, uri: &Uri) -> TesseraResult<()> {
        match self {
            Backend::Local(b) => b.sync(uri),
            Backend::Object(_) => Ok(()),
        }
    }

    pub fn move_file(&self, old_uri: &Uri, new_uri: &Uri) -> TesseraResult<()> {
        match self {
            Backend::Local(b) => b.move_path(old_uri, new_uri),
            Backend::Object(b) => b.move_file(old_uri, new_uri),
        }
    }

    pub fn move_dir(&self, old_uri: &Uri, new_uri: &Uri) -> TesseraResult<()> {
        match self {
            Backend::Local(b) => b.move_path(old_uri, new_uri),
            Backend::Object(b) => b.move_dir(old_uri, new_uri),
        }
    }
}
