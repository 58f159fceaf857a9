//! The Transient stevedore (§3, §4.4): the always-present singleton used
//! for short-lived objects (effective TTL below `shortlived`) and for
//! salvage allocations when the preferred stevedore and one round of LRU
//! nuking both fail (§4.4's allocation policy, §7's storage-failure path).
//!
//! It is never considered for persistence (§1 Non-goals: "persistence
//! across restarts (Transient storage only is required)" — i.e. Transient
//! is the one stevedore explicitly exempt from any future persistence
//! story). Backed by plain heap allocation like `malloc`, but with no
//! ceiling. `storage_transient.c` is not present in this tree; grounded
//! instead on `bin/varnishd/storage_umem.c` (a plain, unbounded
//! malloc-backed stevedore with no persistence) and `stevedore.c`'s generic
//! registration/dispatch shape — Transient grows unbounded by design since
//! it exists precisely to be the allocator of last resort.

use crate::error::StorageError;
use crate::lock::{Lock, LockRank};
use crate::storage::{Storage, StevedoreOps};

pub struct TransientStevedore {
    used: Lock<usize>,
}

impl TransientStevedore {
    pub fn new() -> Self {
        Self { used: Lock::new(0, LockRank::Stevedore) }
    }
}

impl Default for TransientStevedore {
    fn default() -> Self {
        Self::new()
    }
}

impl StevedoreOps for TransientStevedore {
    fn name(&self) -> &'static str {
        "Transient"
    }

    fn alloc(&self, size: usize) -> Result<Storage, StorageError> {
        *self.used.lock() += size;
        Ok(Storage { bytes: vec![0u8; size] })
    }

    fn trim(&self, storage: &mut Storage, new_size: usize) {
        debug_assert!(new_size <= storage.bytes.len());
        let delta = storage.bytes.len() - new_size;
        *self.used.lock() -= delta;
        storage.bytes.truncate(new_size);
    }

    fn free(&self, storage: Storage) {
        *self.used.lock() -= storage.bytes.len();
    }

    fn bytes_used(&self) -> usize {
        *self.used.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_refuses_allocation() {
        let t = TransientStevedore::new();
        assert!(t.alloc(1 << 30).is_ok());
    }
}
