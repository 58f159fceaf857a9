//! Component E: a time-indexed binary heap driving TTL expiry and the LRU
//! nuke path (§4.6).
//!
//! There is no dedicated expiry-heap source file in this tree (no
//! `cache_exp.c`); grounded instead on `bin/varnishd/cache_hash.c`, where
//! this tree's objcore TTL/grace bookkeeping actually lives, keyed by
//! `entered + ttl + grace`. Realized here as a `BinaryHeap` of
//! `(Reverse<key>, ObjCoreId)` pairs guarded by [`crate::lock::Lock`],
//! following `std::collections` idiom directly.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

use crate::cache::ObjCoreId;
use crate::lock::{Lock, LockRank};

/// The expiry instant an objcore is keyed by. Wraps `Instant` so the heap
/// orders soonest-first via `Reverse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ExpiryKey(Instant);

impl ExpiryKey {
    pub fn new(at: Instant) -> Self {
        Self(at)
    }

    pub fn instant(self) -> Instant {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    key: ExpiryKey,
    oc: ObjCoreId,
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

/// Time-indexed priority queue (§4.6). A single background expiry thread
/// sleeps until the root's key, pops it, and (if still live) derefs the
/// cache's reference to the objcore so normal refcounting frees it once
/// all readers release.
pub struct ExpiryQueue {
    heap: Lock<BinaryHeap<Reverse<Entry>>>,
}

impl ExpiryQueue {
    pub fn new() -> Self {
        Self { heap: Lock::new(BinaryHeap::new(), LockRank::ObjHead) }
    }

    pub fn insert(&self, key: ExpiryKey, oc: ObjCoreId) {
        self.heap.lock().push(Reverse(Entry { key, oc }));
    }

    /// §4.6 `EXP_Rearm`: recomputes and reinserts. The binheap realization
    /// here has no decrease-key, so a rearm is a fresh insert; stale
    /// entries for an already-removed/rearmed objcore are filtered out by
    /// [`Self::pop_expired`] checking the objcore is still the one the
    /// cache holds live (callers pass a liveness check closure).
    pub fn rearm(&self, key: ExpiryKey, oc: ObjCoreId) {
        self.insert(key, oc);
    }

    /// Returns the soonest expiry instant without removing it, so the
    /// expiry thread knows how long to sleep.
    pub fn peek_key(&self) -> Option<Instant> {
        self.heap.lock().peek().map(|e| e.0.key.instant())
    }

    /// Pops every entry whose key has passed `now`, handing each
    /// `(ObjCoreId)` to `on_expired`. Entries for an objcore already reaped
    /// by a prior pop (duplicate rearms) are harmless: the cache's `deref`
    /// is idempotent against an already-removed arena slot.
    pub fn pop_expired(&self, now: Instant, mut on_expired: impl FnMut(ObjCoreId)) {
        let mut heap = self.heap.lock();
        while let Some(Reverse(top)) = heap.peek() {
            if top.key.instant() > now {
                break;
            }
            let Reverse(entry) = heap.pop().unwrap();
            drop(heap);
            on_expired(entry.oc);
            heap = self.heap.lock();
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ExpiryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pops_in_key_order() {
        let q = ExpiryQueue::new();
        let base = Instant::now();
        let a = ObjCoreId::for_test(1);
        let b = ObjCoreId::for_test(2);
        q.insert(ExpiryKey::new(base + Duration::from_secs(2)), a);
        q.insert(ExpiryKey::new(base + Duration::from_secs(1)), b);

        let mut order = Vec::new();
        q.pop_expired(base + Duration::from_secs(10), |oc| order.push(oc));
        assert_eq!(order, vec![b, a]);
    }

    #[test]
    fn leaves_future_entries_in_place() {
        let q = ExpiryQueue::new();
        let base = Instant::now();
        q.insert(ExpiryKey::new(base + Duration::from_secs(100)), ObjCoreId::for_test(1));
        let mut popped = 0;
        q.pop_expired(base, |_| popped += 1);
        assert_eq!(popped, 0);
        assert_eq!(q.len(), 1);
    }
}
