use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use tessera_error::TesseraResult;

use crate::filelock::FilelockHandle;
use crate::uri::Uri;

/// Adapter for the local (POSIX) filesystem.
#[derive(Debug, Default)]
pub struct LocalBackend;

impl LocalBackend {
    fn path(uri: &Uri) -> PathBuf {
        PathBuf::from(uri.to_path())
    }

    pub fn create_dir(&self, uri: &Uri) -> TesseraResult<()> {
        fs::create_dir(Self::path(uri))?;
        Ok(())
    }

    pub fn remove_dir(&self, uri: &Uri) -> TesseraResult<()> {
        fs::remove_dir_all(Self::path(uri))?;
        Ok(())
    }

    pub fn is_dir(&self, uri: &Uri) -> bool {
        Self::path(uri).is_dir()
    }

    pub fn is_file(&self, uri: &Uri) -> bool {
        Self::path(uri).is_file()
    }

    /// Children of `uri` as `file://` URIs, in directory order.
    pub fn ls(&self, uri: &Uri) -> TesseraResult<Vec<String>> {
        let mut children = Vec::new();
        for entry in fs::read_dir(Self::path(uri))? {
            let entry = entry?;
            children.push(format!("file://{}", entry.path().display()));
        }
        Ok(children)
    }

    pub fn touch(&self, uri: &Uri) -> TesseraResult<()> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(Self::path(uri))?;
        Ok(())
    }

    pub fn remove_file(&self, uri: &Uri) -> TesseraResult<()> {
        fs::remove_file(Self::path(uri))?;
        Ok(())
    }

    pub fn file_size(&self, uri: &Uri) -> TesseraResult<u64> {
        Ok(fs::metadata(Self::path(uri))?.len())
    }

    /// Fill `buffer` from the byte range starting at `offset`. A range
    /// extending past the end of the file is an error.
    pub fn read(&self, uri: &Uri, offset: u64, buffer: &mut [u8]) -> TesseraResult<()> {
        let file = File::open(Self::path(uri))?;
        file.read_exact_at(buffer, offset)?;
        Ok(())
    }

    /// Append `buffer`, creating the file if needed.
    pub fn write(&self, uri: &Uri, buffer: &[u8]) -> TesseraResult<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(Self::path(uri))?;
        file.write_all(buffer)?;
        Ok(())
    }

    pub fn sync(&self, uri: &Uri) -> TesseraResult<()> {
        File::open(Self::path(uri))?.sync_all()?;
        Ok(())
    }

    pub fn move_path(&self, old_uri: &Uri, new_uri: &Uri) -> TesseraResult<()> {
        fs::rename(Self::path(old_uri), Self::path(new_uri))?;
        Ok(())
    }

    /// Acquire an advisory `flock(2)` on the file, blocking until granted.
    /// The file is created if it does not exist.
    pub fn filelock_lock(&self, uri: &Uri, shared: bool) -> TesseraResult<FilelockHandle> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(Self::path(uri))?;
        let operation = if shared { libc::LOCK_SH } else { libc::LOCK_EX };
        // The lock lives on the open file description held by the handle.
        let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(FilelockHandle::new(file))
    }

    /// Release a lock by dropping its handle; the kernel releases the
    /// `flock` when the last clone closes the descriptor.
    pub fn filelock_unlock(&self, handle: FilelockHandle) {
        drop(handle);
    }
}
