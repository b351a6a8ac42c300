use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tessera_error::{tessera_bail, tessera_err, TesseraResult};

/// Tuning options for a [`Vfs`][crate::Vfs] instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VfsConfig {
    /// Width of the internal worker pool.
    pub num_threads: usize,
    /// Minimum number of bytes each worker of a parallel read is
    /// responsible for.
    pub min_parallel_size: u64,
    /// A batch of coalesced read regions may grow up to this size.
    pub min_batch_size: u64,
    /// Two read regions whose gap is at most this many bytes are coalesced
    /// into one batch.
    pub min_batch_gap: u64,
    /// Whether advisory file locks are acquired at all.
    pub enable_filelocks: bool,
    /// Maximum parallel operations against the local filesystem.
    pub file_max_parallel_ops: u64,
    /// Maximum parallel operations against S3.
    pub s3_max_parallel_ops: u64,
}

impl Default for VfsConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            num_threads: cpus,
            min_parallel_size: 10 * 1024 * 1024,
            min_batch_size: 20 * 1024 * 1024,
            min_batch_gap: 500 * 1024,
            enable_filelocks: true,
            file_max_parallel_ops: cpus as u64,
            s3_max_parallel_ops: 8,
        }
    }
}

impl VfsConfig {
    /// Set an option from its string key/value form.
    ///
    /// Unrecognized keys and unparsable values are rejected with
    /// `InvalidArgument`.
    pub fn set(&mut self, key: &str, value: &str) -> TesseraResult<()> {
        match key {
            "sm.num_tbb_threads" => {
                let threads: usize = parse(key, value)?;
                if threads == 0 {
                    tessera_bail!("'{key}' must be at least 1");
                }
                self.num_threads = threads;
            }
            "vfs.min_parallel_size" => self.min_parallel_size = parse(key, value)?,
            "vfs.min_batch_size" => self.min_batch_size = parse(key, value)?,
            "vfs.min_batch_gap" => self.min_batch_gap = parse(key, value)?,
            "vfs.file.enable_filelocks" => self.enable_filelocks = parse(key, value)?,
            "vfs.file.max_parallel_ops" => self.file_max_parallel_ops = parse(key, value)?,
            "vfs.s3.max_parallel_ops" => self.s3_max_parallel_ops = parse(key, value)?,
            _ => tessera_bail!("unrecognized config option '{key}'"),
        }
        Ok(())
    }
}

fn parse<T>(key: &str, value: &str) -> TesseraResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .parse()
        .map_err(|e| tessera_err!("invalid value '{value}' for '{key}': {e}"))
}
