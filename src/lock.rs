//! Component B: an instrumented mutex wrapper.
//!
//! Every lock acquisition in the cache (objhead, stevedore, ban list, stats)
//! goes through [`Lock`] so contention can be observed without threading a
//! separate counter through each call site, and so that debug builds can
//! assert the locking order from §5 ("session -> objhead -> stevedore ->
//! stats. Violation is a programming error").

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};

/// Position in the global lock order (§5). Debug builds assert a thread
/// never acquires a lower-ranked lock while already holding a higher one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockRank {
    Session = 0,
    ObjHead = 1,
    Stevedore = 2,
    Stats = 3,
}

#[cfg(debug_assertions)]
thread_local! {
    static HELD: std::cell::RefCell<Vec<LockRank>> = std::cell::RefCell::new(Vec::new());
}

/// An instrumented `Mutex<T>` that counts acquisitions and contended waits,
/// and (in debug builds) asserts lock-order discipline.
pub struct Lock<T> {
    inner: Mutex<T>,
    rank: LockRank,
    acquires: AtomicU64,
    contended: AtomicU64,
}

impl<T> Lock<T> {
    pub fn new(value: T, rank: LockRank) -> Self {
        Self { inner: Mutex::new(value), rank, acquires: AtomicU64::new(0), contended: AtomicU64::new(0) }
    }

    pub fn acquires(&self) -> u64 {
        self.acquires.load(Ordering::Relaxed)
    }

    pub fn contended(&self) -> u64 {
        self.contended.load(Ordering::Relaxed)
    }

    /// Acquires the lock, recording whether it was immediately available.
    pub fn lock(&self) -> LockGuard<'_, T> {
        self.assert_order();
        self.acquires.fetch_add(1, Ordering::Relaxed);
        let guard = match self.inner.try_lock() {
            Some(g) => g,
            None => {
                self.contended.fetch_add(1, Ordering::Relaxed);
                self.inner.lock()
            },
        };
        self.push_held();
        LockGuard { guard, rank: self.rank }
    }

    /// Non-blocking acquisition, used for the global stats mutex per §4.3's
    /// "worker sum-stat uses trylock... to avoid contention".
    pub fn try_lock(&self) -> Option<LockGuard<'_, T>> {
        self.assert_order();
        let guard = self.inner.try_lock()?;
        self.acquires.fetch_add(1, Ordering::Relaxed);
        self.push_held();
        Some(LockGuard { guard, rank: self.rank })
    }

    #[cfg(debug_assertions)]
    fn assert_order(&self) {
        HELD.with(|h| {
            let held = h.borrow();
            if let Some(&top) = held.last() {
                assert!(
                    top <= self.rank,
                    "lock order violation: held {top:?}, acquiring {:?}",
                    self.rank
                );
            }
        });
    }

    #[cfg(not(debug_assertions))]
    fn assert_order(&self) {}

    #[cfg(debug_assertions)]
    fn push_held(&self) {
        HELD.with(|h| h.borrow_mut().push(self.rank));
    }

    #[cfg(not(debug_assertions))]
    fn push_held(&self) {}
}

pub struct LockGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    #[allow(dead_code)]
    rank: LockRank,
}

impl<'a, T> std::ops::Deref for LockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> std::ops::DerefMut for LockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<'a, T> Drop for LockGuard<'a, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        HELD.with(|h| {
            let mut held = h.borrow_mut();
            if let Some(pos) = held.iter().rposition(|&r| r == self.rank) {
                held.remove(pos);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_acquisitions() {
        let l = Lock::new(0u32, LockRank::Stats);
        {
            let mut g = l.lock();
            *g += 1;
        }
        assert_eq!(l.acquires(), 1);
        assert_eq!(*l.lock(), 1);
    }

    #[test]
    fn order_session_then_objhead_is_fine() {
        let s = Lock::new((), LockRank::Session);
        let o = Lock::new((), LockRank::ObjHead);
        let _g1 = s.lock();
        let _g2 = o.lock();
    }

    #[test]
    #[cfg_attr(not(debug_assertions), ignore)]
    #[should_panic(expected = "lock order violation")]
    fn order_violation_panics_in_debug() {
        let o = Lock::new((), LockRank::ObjHead);
        let s = Lock::new((), LockRank::Session);
        let _g1 = o.lock();
        let _g2 = s.lock();
    }
}
