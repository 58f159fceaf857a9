//! The `synth` stevedore (§4.4): storage for synthesized bodies — error
//! objects produced by the ERROR state (§4.1, §7) and similar one-shot
//! generated content. One storage item per object, no reuse pooling,
//! matching `bin/varnishd/storage/storage_synth.c`'s "just a growable
//! buffer" simplicity.

use crate::error::StorageError;
use crate::lock::{Lock, LockRank};
use crate::storage::{Storage, StevedoreOps};

pub struct SynthStevedore {
    used: Lock<usize>,
}

impl SynthStevedore {
    pub fn new() -> Self {
        Self { used: Lock::new(0, LockRank::Stevedore) }
    }
}

impl Default for SynthStevedore {
    fn default() -> Self {
        Self::new()
    }
}

impl StevedoreOps for SynthStevedore {
    fn name(&self) -> &'static str {
        "synth"
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
    fn grows_and_shrinks_as_expected() {
        let s = SynthStevedore::new();
        let mut storage = s.alloc(128).unwrap();
        assert_eq!(s.bytes_used(), 128);
        s.trim(&mut storage, 32);
        assert_eq!(s.bytes_used(), 32);
        s.free(storage);
        assert_eq!(s.bytes_used(), 0);
    }
}
