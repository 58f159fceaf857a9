//! Global and per-worker statistics counters (§4.3, §6 `stats`/`stats-job`
//! style CLI surface). Per-worker counters are plain (thread-owned, no
//! atomics needed); aggregation into the global counter uses
//! [`crate::lock::Lock::try_lock`] so a busy hot path never blocks on it.

use serde::Serialize;

use crate::lock::{Lock, LockRank};

macro_rules! counters {
    ($name:ident { $($field:ident),+ $(,)? }) => {
        #[derive(Debug, Default, Clone, Copy, Serialize)]
        pub struct $name {
            $(pub $field: u64,)+
        }

        impl $name {
            /// Adds `other` into `self` field-by-field, used both to fold a
            /// worker's local counters into the global total and to zero a
            /// worker's counters back out once folded.
            pub fn merge(&mut self, other: &Self) {
                $(self.$field = self.$field.saturating_add(other.$field);)+
            }
        }
    };
}

counters!(Counters {
    sess_conn,
    sess_drop,
    sess_herd,
    client_req,
    cache_hit,
    cache_miss,
    cache_hitpass,
    cache_hit_grace,
    fetch_failed,
    backend_conn,
    backend_reuse,
    backend_fail,
    esi_errors,
    n_object,
    n_objectcore,
    n_expired,
    n_lru_nuked,
    n_ban,
    n_ban_gone,
    thread_pool_failed,
    sess_queued,
    sess_dropped_late,
});

/// The process-wide stats aggregate, protected by a trylock-only mutex
/// (§4.3, §5: "stats mutex... tryonly").
pub struct GlobalStats {
    inner: Lock<Counters>,
}

impl GlobalStats {
    pub fn new() -> Self {
        Self { inner: Lock::new(Counters::default(), LockRank::Stats) }
    }

    pub fn snapshot(&self) -> Counters {
        // A blocking read is fine off the hot path (e.g. a CLI `stats` call).
        *self.inner.lock()
    }

    /// Attempts to fold `local` into the global total; on failure the caller
    /// keeps `local` accumulating and retries on its next opportunity.
    pub fn try_merge(&self, local: &mut Counters) -> bool {
        match self.inner.try_lock() {
            Some(mut g) => {
                g.merge(local);
                *local = Counters::default();
                true
            },
            None => false,
        }
    }
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-worker-thread local counters (component K, §4.3's "stats are
/// per-worker; aggregation is trylock").
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub local: Counters,
}

impl WorkerStats {
    /// Tries to push this worker's accumulated counters into `global`.
    /// Called by the herdtimer thread on its periodic sweep (§4.3).
    pub fn flush(&mut self, global: &GlobalStats) {
        global.try_merge(&mut self.local);
    }
}
