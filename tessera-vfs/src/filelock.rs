use std::collections::HashMap;
use std::fs::File;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tessera_error::{tessera_bail, TesseraResult};

/// Handle to a held advisory file lock.
///
/// Handles are cheap to clone; the underlying descriptor closes, and the
/// kernel releases the lock, once the registry entry is erased and every
/// clone held by callers has been dropped.
#[derive(Clone, Debug)]
pub struct FilelockHandle(Arc<File>);

impl FilelockHandle {
    pub(crate) fn new(file: File) -> Self {
        Self(Arc::new(file))
    }
}

#[derive(Debug)]
struct FilelockEntry {
    refcount: u64,
    handle: FilelockHandle,
}

/// Map of URI -> held lock, shared across the entire process.
fn process_filelocks() -> &'static Mutex<HashMap<String, FilelockEntry>> {
    static MAP: OnceLock<Mutex<HashMap<String, FilelockEntry>>> = OnceLock::new();
    MAP.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Reference-counted registry of process-wide file locks.
///
/// The registry guarantees that the backend lock for a given path is
/// acquired exactly once per process, no matter how many concurrent callers
/// request it.
pub(crate) struct FilelockRegistry;

impl FilelockRegistry {
    /// Acquire the lock for `key`, calling `acquire` only on the first
    /// acquisition.
    ///
    /// The registry mutex is held across the backend acquire so that a
    /// second caller for the same key cannot race into a duplicate
    /// acquisition. A slow acquire therefore briefly blocks lock traffic on
    /// unrelated keys; lock operations are rare enough for this not to
    /// matter.
    pub fn lock(
        key: &str,
        acquire: impl FnOnce() -> TesseraResult<FilelockHandle>,
    ) -> TesseraResult<FilelockHandle> {
        let mut map = process_filelocks().lock();
        if let Some(entry) = map.get_mut(key) {
            entry.refcount += 1;
            return Ok(entry.handle.clone());
        }
        let handle = acquire()?;
        map.insert(
            key.to_string(),
            FilelockEntry {
                refcount: 1,
                handle: handle.clone(),
            },
        );
        Ok(handle)
    }

    /// Release one reference for `key`, erasing the entry and dropping the
    /// backend lock when the count reaches zero.
    pub fn unlock(key: &str) -> TesseraResult<()> {
        let mut map = process_filelocks().lock();
        let Some(entry) = map.get_mut(key) else {
            tessera_bail!(LockConsistency: "no lock held for '{key}'");
        };
        if entry.refcount == 0 {
            tessera_bail!(LockConsistency: "invalid lock count for '{key}'");
        }
        entry.refcount -= 1;
        if entry.refcount == 0 {
            map.remove(key);
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn refcount(key: &str) -> Option<u64> {
        process_filelocks().lock().get(key).map(|e| e.refcount)
    }
}

#[cfg(test)]
mod tests {
    use tessera_error::TesseraError;

    use super::*;

    fn open_handle() -> FilelockHandle {
        FilelockHandle::new(tempfile::tempfile().unwrap())
    }

    #[test]
    fn refcounts_per_key() {
        let key = "file:///tmp/tessera-registry-refcount";
        let first = FilelockRegistry::lock(key, || Ok(open_handle())).unwrap();
        let second = FilelockRegistry::lock(key, || {
            panic!("the backend must only be asked once per key")
        })
        .unwrap();
        assert_eq!(FilelockRegistry::refcount(key), Some(2));

        FilelockRegistry::unlock(key).unwrap();
        assert_eq!(FilelockRegistry::refcount(key), Some(1));
        FilelockRegistry::unlock(key).unwrap();
        assert_eq!(FilelockRegistry::refcount(key), None);

        drop(first);
        drop(second);
    }

    #[test]
    fn unlock_without_lock_is_a_consistency_error() {
        let err = FilelockRegistry::unlock("file:///tmp/tessera-registry-unheld").unwrap_err();
        assert!(matches!(err, TesseraError::LockConsistency(_)));
    }

    #[test]
    fn failed_acquire_leaves_no_entry() {
        let key = "file:///tmp/tessera-registry-failed";
        let result = FilelockRegistry::lock(key, || {
            Err(tessera_error::tessera_err!(Backend: "flock failed"))
        });
        assert!(result.is_err());
        assert_eq!(FilelockRegistry::refcount(key), None);
    }
}
