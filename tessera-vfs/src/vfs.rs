use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use object_store::ObjectStore;
use tessera_error::{tessera_bail, tessera_err, TesseraResult};

use crate::backend::{Backend, BucketProvider, FsKind, LocalBackend, ObjectBackend};
#[cfg(feature = "aws")]
use crate::backend::S3Provider;
use crate::cancelable_tasks::CancelableTasks;
use crate::config::VfsConfig;
use crate::filelock::{FilelockHandle, FilelockRegistry};
use crate::thread_pool::{Task, ThreadPool};
use crate::uri::{abs_path, Uri};

/// Modes a file can be opened in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VfsMode {
    Read,
    Write,
    Append,
}

/// A byte region of a file requested through [`Vfs::read_all`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadRegion {
    pub offset: u64,
    pub nbytes: u64,
}

/// A contiguous backend read serving several coalesced regions.
#[derive(Clone, Debug, PartialEq, Eq)]
struct BatchedRead {
    offset: u64,
    nbytes: u64,
    /// `(region offset, region nbytes, slot in the caller's region list)`
    regions: Vec<(u64, u64, usize)>,
}

/// Routes file operations to per-scheme backends, parallelizes large reads
/// across an internal worker pool, and coalesces scattered read regions
/// into batched backend requests.
pub struct Vfs {
    config: VfsConfig,
    thread_pool: Arc<ThreadPool>,
    cancelable_tasks: Arc<CancelableTasks>,
    local: Arc<LocalBackend>,
    s3: Option<Arc<ObjectBackend>>,
    hdfs: Option<Arc<ObjectBackend>>,
}

/// The pieces of a [`Vfs`] a parallel read needs, detached from the facade
/// so worker tasks can own them.
#[derive(Clone)]
struct ParallelReader {
    backend: Backend,
    pool: Arc<ThreadPool>,
    cancelable: Arc<CancelableTasks>,
    min_parallel_size: u64,
    max_ops: u64,
}

impl Vfs {
    pub fn new(config: VfsConfig) -> TesseraResult<Self> {
        #[allow(unused_mut)]
        let mut vfs = Self {
            thread_pool: Arc::new(ThreadPool::new(config.num_threads)),
            cancelable_tasks: Arc::new(CancelableTasks::new()),
            local: Arc::new(LocalBackend),
            s3: None,
            hdfs: None,
            config,
        };
        #[cfg(feature = "aws")]
        {
            vfs.s3 = Some(Arc::new(ObjectBackend::with_buckets(
                "s3",
                Arc::new(S3Provider),
            )?));
        }
        Ok(vfs)
    }

    /// Serve `s3://` URIs through the given bucket provider.
    pub fn with_s3_provider(mut self, provider: Arc<dyn BucketProvider>) -> TesseraResult<Self> {
        self.s3 = Some(Arc::new(ObjectBackend::with_buckets("s3", provider)?));
        Ok(self)
    }

    /// Serve `hdfs://` URIs through the given store.
    pub fn with_hdfs_store(mut self, store: Arc<dyn ObjectStore>) -> TesseraResult<Self> {
        self.hdfs = Some(Arc::new(ObjectBackend::with_store("hdfs", store)?));
        Ok(self)
    }

    /// Flush pending object-store uploads. Call before dropping the VFS
    /// when object writes may be outstanding.
    pub fn terminate(&self) -> TesseraResult<()> {
        if let Some(s3) = &self.s3 {
            s3.disconnect()?;
        }
        if let Some(hdfs) = &self.hdfs {
            hdfs.disconnect()?;
        }
        Ok(())
    }

    pub fn config(&self) -> &VfsConfig {
        &self.config
    }

    /// See [`abs_path`].
    pub fn abs_path(&self, path: &str) -> String {
        abs_path(path)
    }

    pub fn supports_fs(&self, kind: FsKind) -> bool {
        match kind {
            FsKind::File => true,
            FsKind::S3 => self.s3.is_some(),
            FsKind::Hdfs => self.hdfs.is_some(),
        }
    }

    pub fn supports_uri_scheme(&self, uri: &Uri) -> bool {
        if uri.is_file() {
            true
        } else if uri.is_s3() {
            self.supports_fs(FsKind::S3)
        } else if uri.is_hdfs() {
            self.supports_fs(FsKind::Hdfs)
        } else {
            false
        }
    }

    /// The parallel-operation cap for the scheme of `uri`.
    pub fn max_parallel_ops(&self, uri: &Uri) -> u64 {
        if uri.is_file() {
            self.config.file_max_parallel_ops
        } else if uri.is_s3() {
            self.config.s3_max_parallel_ops
        } else {
            1
        }
    }

    fn backend_for(&self, uri: &Uri) -> TesseraResult<Backend> {
        if uri.is_file() {
            return Ok(Backend::Local(self.local.clone()));
        }
        if uri.is_s3() {
            return match &self.s3 {
                Some(backend) => Ok(Backend::Object(backend.clone())),
                None => Err(tessera_err!(SchemeUnsupported: "S3 support is not enabled")),
            };
        }
        if uri.is_hdfs() {
            return match &self.hdfs {
                Some(backend) => Ok(Backend::Object(backend.clone())),
                None => Err(tessera_err!(SchemeUnsupported: "HDFS support is not enabled")),
            };
        }
        Err(tessera_err!(SchemeUnsupported: "unrecognized scheme in '{uri}'"))
    }

    fn reader_for(&self, uri: &Uri) -> TesseraResult<ParallelReader> {
        Ok(ParallelReader {
            backend: self.backend_for(uri)?,
            pool: self.thread_pool.clone(),
            cancelable: self.cancelable_tasks.clone(),
            min_parallel_size: self.config.min_parallel_size,
            max_ops: self.max_parallel_ops(uri),
        })
    }

    pub fn create_dir(&self, uri: &Uri) -> TesseraResult<()> {
        if !uri.is_s3() && self.is_dir(uri)? {
            return Ok(());
        }
        self.backend_for(uri)?.create_dir(uri)
    }

    pub fn remove_dir(&self, uri: &Uri) -> TesseraResult<()> {
        self.backend_for(uri)?.remove_dir(uri)
    }

    pub fn is_dir(&self, uri: &Uri) -> TesseraResult<bool> {
        self.backend_for(uri)?.is_dir(uri)
    }

    pub fn touch(&self, uri: &Uri) -> TesseraResult<()> {
        self.backend_for(uri)?.touch(uri)
    }

    pub fn remove_file(&self, uri: &Uri) -> TesseraResult<()> {
        self.backend_for(uri)?.remove_file(uri)
    }

    pub fn is_file(&self, uri: &Uri) -> TesseraResult<bool> {
        self.backend_for(uri)?.is_file(uri)
    }

    pub fn file_size(&self, uri: &Uri) -> TesseraResult<u64> {
        self.backend_for(uri)?.file_size(uri)
    }

    /// The children of `uri`, sorted by name.
    pub fn ls(&self, uri: &Uri) -> TesseraResult<Vec<Uri>> {
        let mut children = self.backend_for(uri)?.ls(uri)?;
        children.sort();
        Ok(children.into_iter().map(Uri::new).collect())
    }

    /// Total size of the files in the tree rooted at `uri`.
    pub fn dir_size(&self, uri: &Uri) -> TesseraResult<u64> {
        if !self.is_dir(uri)? {
            tessera_bail!("cannot compute directory size; '{uri}' is not a directory");
        }
        let mut total = 0u64;
        let mut to_ls = VecDeque::from([uri.clone()]);
        while let Some(parent) = to_ls.pop_front() {
            for child in self.ls(&parent)? {
                if self.is_file(&child)? {
                    total += self.file_size(&child)?;
                } else {
                    to_ls.push_back(child);
                }
            }
        }
        Ok(total)
    }

    /// Rename a file. An existing destination file is replaced. Moves
    /// across schemes are not supported.
    pub fn move_file(&self, old_uri: &Uri, new_uri: &Uri) -> TesseraResult<()> {
        let backend = self.backend_for(old_uri)?;
        if !same_scheme(old_uri, new_uri) {
            tessera_bail!(CrossSchemeMove: "cannot move '{old_uri}' to '{new_uri}'");
        }
        if self.is_file(new_uri)? {
            self.remove_file(new_uri)?;
        }
        backend.move_file(old_uri, new_uri)
    }

    /// Rename a directory. Moves across schemes are not supported.
    pub fn move_dir(&self, old_uri: &Uri, new_uri: &Uri) -> TesseraResult<()> {
        let backend = self.backend_for(old_uri)?;
        if !same_scheme(old_uri, new_uri) {
            tessera_bail!(CrossSchemeMove: "cannot move '{old_uri}' to '{new_uri}'");
        }
        backend.move_dir(old_uri, new_uri)
    }

    /// Fill `buffer` from `uri` starting at `offset`.
    ///
    /// Reads larger than `min_parallel_size` are split into contiguous
    /// chunks read concurrently on the internal pool, up to the scheme's
    /// parallel-operation cap. The first worker error is returned after
    /// every worker has finished.
    pub fn read(&self, uri: &Uri, offset: u64, buffer: &mut [u8]) -> TesseraResult<()> {
        self.reader_for(uri)?.read(uri, offset, buffer)
    }

    /// Read many regions of one file through batched backend requests.
    ///
    /// Regions are sorted and coalesced into batches; each batch is read
    /// on a task submitted to `pool` (which must be distinct from the VFS
    /// internal pool — the batch tasks themselves fan out onto the internal
    /// pool, and sharing one pool could deadlock). Returns one [`Bytes`]
    /// per region, in the caller's order. Tasks already handed to `pool`
    /// are beyond the reach of [`Vfs::cancel_all_tasks`].
    pub fn read_all(
        &self,
        uri: &Uri,
        regions: &[ReadRegion],
        pool: &ThreadPool,
    ) -> TesseraResult<Vec<Bytes>> {
        if pool.id() == self.thread_pool.id() {
            tessera_bail!(
                "read_all requires an external thread pool distinct from the VFS internal pool"
            );
        }
        if regions.is_empty() {
            return Ok(Vec::new());
        }
        let reader = self.reader_for(uri)?;
        let batches =
            compute_read_batches(regions, self.config.min_batch_size, self.config.min_batch_gap);

        let mut tasks: Vec<Task<Vec<(usize, Bytes)>>> = Vec::with_capacity(batches.len());
        let mut submit_err = None;
        for batch in batches {
            let reader = reader.clone();
            let uri = uri.clone();
            let task = pool.execute(move || {
                let offset = batch.offset;
                let mut scratch = BytesMut::zeroed(batch.nbytes as usize);
                reader.read(&uri, offset, &mut scratch)?;
                let scratch = scratch.freeze();
                let mut filled = Vec::with_capacity(batch.regions.len());
                for (region_offset, region_nbytes, slot) in batch.regions {
                    let begin = (region_offset - offset) as usize;
                    filled.push((slot, scratch.slice(begin..begin + region_nbytes as usize)));
                }
                Ok(filled)
            });
            match task {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    submit_err = Some(e);
                    break;
                }
            }
        }

        let waited = pool.wait_all(tasks);
        if let Some(e) = submit_err {
            waited.ok();
            return Err(e);
        }

        let mut out = vec![Bytes::new(); regions.len()];
        for filled in waited? {
            for (slot, bytes) in filled {
                out[slot] = bytes;
            }
        }
        Ok(out)
    }

    /// Append `buffer` to `uri`.
    pub fn write(&self, uri: &Uri, buffer: &[u8]) -> TesseraResult<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        self.backend_for(uri)?.write(uri, buffer)
    }

    pub fn sync(&self, uri: &Uri) -> TesseraResult<()> {
        self.backend_for(uri)?.sync(uri)
    }

    pub fn open_file(&self, uri: &Uri, mode: VfsMode) -> TesseraResult<()> {
        match mode {
            VfsMode::Read => {
                if !self.is_file(uri)? {
                    tessera_bail!(NotFound: "cannot open '{uri}' for reading; it does not exist");
                }
            }
            VfsMode::Write => {
                if self.is_file(uri)? {
                    self.remove_file(uri)?;
                }
            }
            VfsMode::Append => {
                if uri.is_s3() {
                    tessera_bail!(AppendUnsupported: "S3 does not support appending to '{uri}'");
                }
            }
        }
        Ok(())
    }

    /// Flush `uri`: completes a pending object upload, or syncs a local
    /// file to disk.
    pub fn close_file(&self, uri: &Uri) -> TesseraResult<()> {
        match self.backend_for(uri)? {
            Backend::Local(backend) => {
                if backend.is_file(uri) {
                    backend.sync(uri)?;
                }
                Ok(())
            }
            Backend::Object(backend) => backend.flush(uri),
        }
    }

    pub fn create_bucket(&self, uri: &Uri) -> TesseraResult<()> {
        self.s3_backend(uri)?.create_bucket(uri)
    }

    pub fn remove_bucket(&self, uri: &Uri) -> TesseraResult<()> {
        self.s3_backend(uri)?.remove_bucket(uri)
    }

    pub fn empty_bucket(&self, uri: &Uri) -> TesseraResult<()> {
        self.s3_backend(uri)?.empty_bucket(uri)
    }

    pub fn is_bucket(&self, uri: &Uri) -> TesseraResult<bool> {
        self.s3_backend(uri)?.is_bucket(uri)
    }

    pub fn is_empty_bucket(&self, uri: &Uri) -> TesseraResult<bool> {
        self.s3_backend(uri)?.is_empty_bucket(uri)
    }

    fn s3_backend(&self, uri: &Uri) -> TesseraResult<&Arc<ObjectBackend>> {
        if !uri.is_s3() {
            tessera_bail!(SchemeUnsupported: "bucket operations require an s3 URI, got '{uri}'");
        }
        self.s3
            .as_ref()
            .ok_or_else(|| tessera_err!(SchemeUnsupported: "S3 support is not enabled"))
    }

    /// Acquire the process-wide advisory lock for `uri`.
    ///
    /// Returns `None` when filelocks are disabled or the scheme has no
    /// locks (remote backends); both cases are successes. The lock is held
    /// until the matching [`Vfs::filelock_unlock`] erases the registry
    /// entry and every returned handle clone has been dropped.
    pub fn filelock_lock(&self, uri: &Uri, shared: bool) -> TesseraResult<Option<FilelockHandle>> {
        if !self.config.enable_filelocks {
            return Ok(None);
        }
        if uri.is_file() {
            let local = self.local.clone();
            let target = uri.clone();
            let handle =
                FilelockRegistry::lock(uri.as_str(), move || local.filelock_lock(&target, shared))?;
            return Ok(Some(handle));
        }
        // Locks are a no-op on remote backends, but the scheme must still
        // dispatch.
        self.backend_for(uri)?;
        Ok(None)
    }

    /// Release one acquisition of the lock for `uri`.
    pub fn filelock_unlock(&self, uri: &Uri) -> TesseraResult<()> {
        if !self.config.enable_filelocks {
            return Ok(());
        }
        if uri.is_file() {
            return FilelockRegistry::unlock(uri.as_str());
        }
        self.backend_for(uri)?;
        Ok(())
    }

    /// Cooperatively cancel every outstanding task on the internal pool.
    pub fn cancel_all_tasks(&self) {
        self.cancelable_tasks.cancel_all();
    }
}

fn same_scheme(a: &Uri, b: &Uri) -> bool {
    (a.is_file() && b.is_file()) || (a.is_s3() && b.is_s3()) || (a.is_hdfs() && b.is_hdfs())
}

impl ParallelReader {
    fn read(&self, uri: &Uri, offset: u64, buffer: &mut [u8]) -> TesseraResult<()> {
        let nbytes = buffer.len() as u64;
        if nbytes == 0 {
            return Ok(());
        }
        let num_ops = parallel_ops(nbytes, self.min_parallel_size, self.max_ops);
        if num_ops == 1 {
            return self.backend.read(uri, offset, buffer);
        }

        let chunk_bytes = nbytes.div_ceil(num_ops) as usize;
        let mut tasks = Vec::with_capacity(num_ops as usize);
        let mut submit_err = None;
        for (i, chunk) in buffer.chunks_mut(chunk_bytes).enumerate() {
            let chunk_offset = offset + (i * chunk_bytes) as u64;
            // The chunks are disjoint and every task is awaited below before
            // this function returns, so the borrow cannot escape the
            // caller's frame.
            let chunk: &'static mut [u8] =
                unsafe { std::mem::transmute::<&mut [u8], &'static mut [u8]>(chunk) };
            let backend = self.backend.clone();
            let uri = uri.clone();
            let task = self
                .cancelable
                .enqueue(&self.pool, move || backend.read(&uri, chunk_offset, chunk));
            match task {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    submit_err = Some(e);
                    break;
                }
            }
        }

        let waited = self.pool.wait_all(tasks);
        if let Some(e) = submit_err {
            waited.ok();
            return Err(e);
        }
        waited.map(|_| ())
    }
}

/// `clamp(nbytes / min_parallel_size, 1, max_ops)`: each worker is
/// responsible for at least `min_parallel_size` bytes.
fn parallel_ops(nbytes: u64, min_parallel_size: u64, max_ops: u64) -> u64 {
    (nbytes / min_parallel_size.max(1)).clamp(1, max_ops.max(1))
}

/// Sort the regions by offset and greedily coalesce neighbors: a region
/// joins the current batch when the grown batch stays within
/// `min_batch_size` **or** the gap to the batch end is within
/// `min_batch_gap`.
fn compute_read_batches(
    regions: &[ReadRegion],
    min_batch_size: u64,
    min_batch_gap: u64,
) -> Vec<BatchedRead> {
    let mut order: Vec<usize> = (0..regions.len()).collect();
    order.sort_by_key(|&slot| regions[slot].offset);

    let first = order[0];
    let mut current = BatchedRead {
        offset: regions[first].offset,
        nbytes: regions[first].nbytes,
        regions: vec![(regions[first].offset, regions[first].nbytes, first)],
    };

    let mut batches = Vec::new();
    for &slot in &order[1..] {
        let region = regions[slot];
        let new_size = (region.offset + region.nbytes) - current.offset;
        let gap = region.offset.saturating_sub(current.offset + current.nbytes);
        if new_size <= min_batch_size || gap <= min_batch_gap {
            // A region can end inside the batch, so the size never shrinks.
            current.nbytes = current.nbytes.max(new_size);
            current.regions.push((region.offset, region.nbytes, slot));
        } else {
            batches.push(std::mem::replace(
                &mut current,
                BatchedRead {
                    offset: region.offset,
                    nbytes: region.nbytes,
                    regions: vec![(region.offset, region.nbytes, slot)],
                },
            ));
        }
    }
    batches.push(current);
    batches
}
