use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tessera_error::{tessera_err, TesseraResult};

use crate::thread_pool::{Task, ThreadPool};

/// Tracks pool submissions that may be cancelled as a group.
///
/// Cancellation is cooperative: each submission carries a flag that the
/// wrapped job checks before it starts running, completing with a
/// `Cancelled` error if it was set. A job already inside a backend call
/// runs to completion.
#[derive(Debug, Default)]
pub struct CancelableTasks {
    outstanding: Mutex<Vec<Weak<AtomicBool>>>,
}

impl CancelableTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit `job` to `pool` under a fresh cancellation flag.
    pub fn enqueue<T, F>(&self, pool: &ThreadPool, job: F) -> TesseraResult<Task<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> TesseraResult<T> + Send + 'static,
    {
        let flag = Arc::new(AtomicBool::new(false));
        {
            let mut outstanding = self.outstanding.lock();
            outstanding.retain(|weak| weak.strong_count() > 0);
            outstanding.push(Arc::downgrade(&flag));
        }
        pool.execute(move || {
            if flag.load(Ordering::SeqCst) {
                return Err(tessera_err!(Cancelled: "task cancelled before execution"));
            }
            job()
        })
    }

    /// Set the cancellation flag of every outstanding task.
    pub fn cancel_all(&self) {
        let mut outstanding = self.outstanding.lock();
        outstanding.retain(|weak| match weak.upgrade() {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use tessera_error::TesseraError;

    use super::*;

    #[test]
    fn cancelled_tasks_complete_with_cancelled() {
        let pool = ThreadPool::new(1);
        let registry = CancelableTasks::new();

        // Park the single worker so that the next submissions stay queued.
        let (gate_tx, gate_rx) = flume::bounded::<()>(1);
        let gate = pool
            .execute(move || {
                gate_rx.recv().ok();
                Ok(())
            })
            .unwrap();

        let queued: Vec<Task<u32>> = (0..4)
            .map(|i| registry.enqueue(&pool, move || Ok(i)).unwrap())
            .collect();

        registry.cancel_all();
        gate_tx.send(()).unwrap();
        gate.wait().unwrap();

        for task in queued {
            assert!(matches!(task.wait(), Err(TesseraError::Cancelled(_))));
        }
    }

    #[test]
    fn uncancelled_tasks_run_normally() {
        let pool = ThreadPool::new(2);
        let registry = CancelableTasks::new();
        let task = registry.enqueue(&pool, || Ok(11u32)).unwrap();
        assert_eq!(task.wait().unwrap(), 11);
        // Completed tasks are pruned from the registry on the next enqueue.
        registry.cancel_all();
        let after = registry.enqueue(&pool, || Ok(12u32)).unwrap();
        assert_eq!(after.wait().unwrap(), 12);
    }
}
