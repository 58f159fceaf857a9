//! The `malloc` stevedore (§4.4): storage backed directly by heap
//! allocations, bounded by a configured byte ceiling.
//!
//! Grounded in `bin/varnishd/storage/storage_malloc.c`'s `sma_alloc`/
//! `sma_free`/`sma_trim`, which track `sma_alloc` under a single mutex and
//! elide a trim below a small delta to avoid realloc churn.

use crate::error::StorageError;
use crate::lock::{Lock, LockRank};
use crate::storage::{Storage, StevedoreOps};

/// Below this many bytes of slack, `trim` is a no-op (§4.4: "trim via
/// realloc (elided below a 256-byte delta)").
const TRIM_THRESHOLD: usize = 256;

struct Inner {
    used: usize,
    max: usize,
}

pub struct MallocStevedore {
    inner: Lock<Inner>,
}

impl MallocStevedore {
    pub fn new(max_bytes: usize) -> Self {
        Self { inner: Lock::new(Inner { used: 0, max: max_bytes }, LockRank::Stevedore) }
    }
}

impl StevedoreOps for MallocStevedore {
    fn name(&self) -> &'static str {
        "malloc"
    }

    fn alloc(&self, size: usize) -> Result<Storage, StorageError> {
        let mut inner = self.inner.lock();
        if inner.used.saturating_add(size) > inner.max {
            return Err(StorageError::OutOfSpace);
        }
        inner.used += size;
        Ok(Storage { bytes: vec![0u8; size] })
    }

    fn trim(&self, storage: &mut Storage, new_size: usize) {
        debug_assert!(new_size <= storage.bytes.len());
        let delta = storage.bytes.len() - new_size;
        if delta < TRIM_THRESHOLD {
            return;
        }
        let mut inner = self.inner.lock();
        inner.used = inner.used.saturating_sub(delta);
        storage.bytes.truncate(new_size);
        storage.bytes.shrink_to_fit();
    }

    fn free(&self, storage: Storage) {
        let mut inner = self.inner.lock();
        inner.used = inner.used.saturating_sub(storage.bytes.len());
    }

    fn bytes_used(&self) -> usize {
        self.inner.lock().used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_respects_ceiling() {
        let s = MallocStevedore::new(10);
        assert!(s.alloc(10).is_ok());
        assert_eq!(s.bytes_used(), 10);
        assert!(matches!(s.alloc(1), Err(StorageError::OutOfSpace)));
    }

    #[test]
    fn free_returns_bytes() {
        let s = MallocStevedore::new(10);
        let storage = s.alloc(5).unwrap();
        s.free(storage);
        assert_eq!(s.bytes_used(), 0);
        assert!(s.alloc(10).is_ok());
    }

    #[test]
    fn small_trim_deltas_are_elided() {
        let s = MallocStevedore::new(1000);
        let mut storage = s.alloc(100).unwrap();
        s.trim(&mut storage, 90); // delta 10 < TRIM_THRESHOLD
        assert_eq!(s.bytes_used(), 100, "small trim deltas should not shrink the accounted total");
    }
}
