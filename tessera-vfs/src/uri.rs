use std::fmt::{Display, Formatter};

use tessera_error::TesseraExpect;

const FILE_SCHEME: &str = "file://";
const HDFS_SCHEME: &str = "hdfs://";
const S3_SCHEME: &str = "s3://";

/// A scheme-qualified resource path.
///
/// Recognized schemes are `file`, `hdfs` and `s3`; a bare path with no
/// scheme is treated as a local path. Construction never fails — an
/// unrecognized scheme surfaces as a scheme error when an operation
/// dispatches on the URI.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Uri(String);

impl Uri {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    /// The URI scheme, if any (`"file"`, `"hdfs"`, `"s3"`, ...).
    pub fn scheme(&self) -> Option<&str> {
        self.0.split_once("://").map(|(scheme, _)| scheme)
    }

    pub fn is_file(&self) -> bool {
        self.0.starts_with(FILE_SCHEME) || !self.0.contains("://")
    }

    pub fn is_hdfs(&self) -> bool {
        self.0.starts_with(HDFS_SCHEME)
    }

    pub fn is_s3(&self) -> bool {
        self.0.starts_with(S3_SCHEME)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The native path with the `file://` scheme stripped. Non-local URIs
    /// are returned unchanged.
    pub fn to_path(&self) -> &str {
        self.0.strip_prefix(FILE_SCHEME).unwrap_or(&self.0)
    }

    /// Append a path component.
    pub fn join(&self, child: &str) -> Uri {
        let base = self.0.trim_end_matches('/');
        Uri(format!("{base}/{child}"))
    }

    /// The final path component.
    pub fn last_path_part(&self) -> &str {
        self.0.trim_end_matches('/').rsplit('/').next().unwrap_or("")
    }
}

impl Display for Uri {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl From<&str> for Uri {
    fn from(uri: &str) -> Self {
        Self::new(uri)
    }
}

/// Normalize `path` to its canonical scheme-qualified form.
///
/// Local paths (bare or `file://`) become `file://<absolute>` with `.` and
/// `..` components resolved lexically; relative paths are resolved against
/// the current directory. URIs of any other scheme are returned verbatim.
/// The normalization is idempotent.
pub fn abs_path(path: &str) -> String {
    if let Some(local) = path.strip_prefix(FILE_SCHEME) {
        return format!("{FILE_SCHEME}{}", posix_abs_path(local));
    }
    if path.contains("://") {
        return path.to_string();
    }
    format!("{FILE_SCHEME}{}", posix_abs_path(path))
}

/// Lexically resolve a POSIX path to an absolute, dot-free form. The
/// filesystem is never consulted and symlinks are not followed.
fn posix_abs_path(path: &str) -> String {
    let absolute = if path.starts_with('/') {
        path.to_string()
    } else {
        let cwd = std::env::current_dir()
            .map_err(Into::into)
            .tessera_expect("current working directory");
        format!("{}/{}", cwd.display(), path)
    };

    let mut parts: Vec<&str> = Vec::new();
    for component in absolute.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}
