//! Component C: pluggable byte storage.
//!
//! Grounded in `bin/varnishd/stevedore.h`/`stevedore.c`: every stevedore
//! implements alloc/trim/free plus a default `allocobj` that carves a slab
//! into header+workspace+body. Modeled in Rust as a closed `enum`-of-variants
//! per §9 ("avoid dynamic open-ended plugin loading; the set is closed at
//! build time") rather than `dyn Stevedore`, since the four concrete kinds
//! (malloc/file/synth/Transient) are exhaustively known.

pub mod file;
pub mod lru;
pub mod malloc;
pub mod synth;
pub mod transient;

use crate::error::StorageError;

/// A contiguous byte segment owned by a stevedore (§3 `Storage`).
#[derive(Debug)]
pub struct Storage {
    pub bytes: Vec<u8>,
}

impl Storage {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Capability set a storage backend must implement (§4.4).
pub trait StevedoreOps: Send + Sync {
    fn name(&self) -> &'static str;

    /// Allocates `size` bytes, or `Err` if the stevedore has no room.
    fn alloc(&self, size: usize) -> Result<Storage, StorageError>;

    /// Shrinks a just-finalized allocation down to its true length. Elided
    /// below a small delta to avoid realloc churn (malloc stevedore: a
    /// 256-byte threshold per §4.4).
    fn trim(&self, storage: &mut Storage, new_size: usize);

    /// Releases a storage segment back to the stevedore's free pool.
    fn free(&self, storage: Storage);

    /// Bytes currently allocated, for `storage.list` (§6 CLI surface).
    fn bytes_used(&self) -> usize;
}

/// The four stevedore kinds, closed at build time.
pub enum Stevedore {
    Malloc(malloc::MallocStevedore),
    File(file::FileStevedore),
    Synth(synth::SynthStevedore),
    Transient(transient::TransientStevedore),
}

impl Stevedore {
    fn ops(&self) -> &dyn StevedoreOps {
        match self {
            Self::Malloc(s) => s,
            Self::File(s) => s,
            Self::Synth(s) => s,
            Self::Transient(s) => s,
        }
    }
}

impl StevedoreOps for Stevedore {
    fn name(&self) -> &'static str {
        self.ops().name()
    }

    fn alloc(&self, size: usize) -> Result<Storage, StorageError> {
        self.ops().alloc(size)
    }

    fn trim(&self, storage: &mut Storage, new_size: usize) {
        self.ops().trim(storage, new_size)
    }

    fn free(&self, storage: Storage) {
        self.ops().free(storage)
    }

    fn bytes_used(&self) -> usize {
        self.ops().bytes_used()
    }
}

/// A stevedore paired with its own LRU list (§4.4: "Per-stevedore LRU: each
/// stevedore owns an LRU list of its objcores").
pub struct ManagedStevedore {
    pub stevedore: Stevedore,
    pub lru: crate::lock::Lock<lru::LruList>,
}

impl ManagedStevedore {
    pub fn new(stevedore: Stevedore) -> Self {
        Self { stevedore, lru: crate::lock::Lock::new(lru::LruList::new(), crate::lock::LockRank::Stevedore) }
    }

    /// §4.4 `EXP_NukeOne`: walks this stevedore's LRU from the tail (oldest)
    /// looking for a candidate `evict` accepts (the caller checks BUSY/
    /// LRUDONTMOVE and performs the actual rearm-to-immediate-expiry/deref,
    /// since only the cache owns objcore state). Returns whether one was
    /// nuked.
    pub fn nuke_one(&self, mut evict: impl FnMut(crate::cache::ObjCoreId) -> bool) -> bool {
        let candidates: Vec<_> = self.lru.lock().iter_from_lru().collect();
        for id in candidates {
            if evict(id) {
                self.lru.lock().remove(id);
                return true;
            }
        }
        false
    }
}
