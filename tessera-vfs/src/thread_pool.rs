use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use tessera_error::{tessera_bail, tessera_err, tessera_panic, TesseraError, TesseraResult};

type Job = Box<dyn FnOnce() + Send + 'static>;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(0);

/// A fixed-width pool of worker threads executing blocking jobs.
///
/// Jobs are submitted over an unbounded channel and consumed by a set of
/// named worker threads. Dropping the pool closes the channel, drains the
/// queued jobs and joins every worker.
#[derive(Debug)]
pub struct ThreadPool {
    id: u64,
    submitter: Option<flume::Sender<Job>>,
    threads: Vec<JoinHandle<()>>,
}

/// Handle to a submitted job's result.
#[derive(Debug)]
pub struct Task<T = ()> {
    receiver: flume::Receiver<TesseraResult<T>>,
}

impl<T> Task<T> {
    /// Block until the job completes.
    pub fn wait(self) -> TesseraResult<T> {
        self.receiver
            .recv()
            .map_err(|_| tessera_err!(Backend: "worker dropped the task result"))?
    }
}

impl ThreadPool {
    pub fn new(num_threads: usize) -> Self {
        let (submitter, rx) = flume::unbounded::<Job>();
        let threads = (0..num_threads.max(1))
            .map(|tid| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("tessera-vfs-{tid}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .unwrap_or_else(|e| tessera_panic!("vfs worker thread spawn: {e}"))
            })
            .collect();
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            submitter: Some(submitter),
            threads,
        }
    }

    /// Process-unique identity of this pool.
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub fn concurrency(&self) -> usize {
        self.threads.len()
    }

    /// Submit a job, returning a [`Task`] resolving to its result.
    pub fn execute<T, F>(&self, job: F) -> TesseraResult<Task<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> TesseraResult<T> + Send + 'static,
    {
        let (tx, rx) = flume::bounded(1);
        let boxed: Job = Box::new(move || {
            // The receiver may already be gone; the result is then dropped.
            tx.send(job()).ok();
        });
        let Some(submitter) = &self.submitter else {
            tessera_bail!(Backend: "the thread pool is shut down");
        };
        if submitter.send(boxed).is_err() {
            tessera_bail!(Backend: "the thread pool is shut down");
        }
        Ok(Task { receiver: rx })
    }

    /// Block until every task completes, returning the results in
    /// submission order.
    ///
    /// The first error encountered is returned after all tasks have been
    /// awaited; later errors are logged and discarded.
    pub fn wait_all<T>(&self, tasks: Vec<Task<T>>) -> TesseraResult<Vec<T>> {
        let mut results = Vec::with_capacity(tasks.len());
        let mut first_err: Option<TesseraError> = None;
        for task in tasks {
            match task.wait() {
                Ok(value) => results.push(value),
                Err(e) if first_err.is_none() => first_err = Some(e),
                Err(e) => log::error!("discarding secondary task error: {e}"),
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Disconnecting the channel lets the workers drain and exit.
        drop(self.submitter.take());
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::error!("vfs worker thread panicked");
            }
        }
    }
}
