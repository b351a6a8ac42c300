//! Virtual filesystem for the Tessera storage engine.
//!
//! A [`Vfs`] routes file operations to per-scheme backends (`file://`,
//! `hdfs://`, `s3://`), parallelizes large reads across an internal worker
//! pool, coalesces scattered read regions into batched backend requests,
//! and coordinates process-wide, reference-counted advisory file locks.
//!
//! Object-store schemes are served through the [`object_store`] crate;
//! custom deployments plug in via [`BucketProvider`] (per-bucket clients)
//! or an injected store for the `hdfs` scheme.

pub use backend::{BucketProvider, FsKind, InMemoryProvider, LocalBackend, ObjectBackend};
#[cfg(feature = "aws")]
pub use backend::S3Provider;
pub use cancelable_tasks::CancelableTasks;
pub use config::*;
pub use filelock::FilelockHandle;
// Re-exported so providers can be implemented against the same version.
pub use object_store;
pub use thread_pool::{Task, ThreadPool};
pub use uri::*;
pub use vfs::*;

mod backend;
mod cancelable_tasks;
mod config;
mod filelock;
mod thread_pool;
mod uri;
mod vfs;
