//! Component G: the object cache — the objhead/objcore/object graph (§3),
//! and the Lookup/Unbusy/Rush/Deref/Purge operations of §4.2.
//!
//! This tree has no separate `cache_obj.c`/`cache_objhead.c`; grounded
//! instead on `bin/varnishd/cache_hash.c`, which folds objhead/objcore
//! lookup, refcounting, and the busy/waiting-list dance directly into the
//! hash slinger's own file. Realized in Rust per §9's REDESIGN FLAGS as a
//! generational arena (`Arena<T>`) addressed by index rather than an
//! intrusive pointer graph, with slot reuse since objcores/objects churn
//! heavily.

pub mod ban;
pub mod expiry;
pub mod hash;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use tokio::sync::oneshot;
use tracing::{debug, instrument, trace, warn};

use crate::error::StorageError;
use crate::http::HeaderTable;
use crate::lock::{Lock, LockRank};
use crate::storage::{Storage, Stevedore};
use self::ban::{BanId, BanList};
use self::expiry::{ExpiryKey, ExpiryQueue};
use self::hash::HashSlinger;

/// A generational slot index, reused across `ObjHead`/`ObjCore`/`Object`
/// arenas (§9: "map to an arena of objheads/objcores addressed by index").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Idx {
    index: u32,
    gen: u32,
}

struct Slot<T> {
    gen: u32,
    value: Option<T>,
}

/// A simple generational arena: stable indices survive insert/remove cycles
/// without the ABA problems of reusing a raw `Vec` index.
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self { slots: Vec::new(), free: Vec::new() }
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, value: T) -> Idx {
        if let Some(i) = self.free.pop() {
            let slot = &mut self.slots[i as usize];
            slot.value = Some(value);
            Idx { index: i, gen: slot.gen }
        } else {
            let gen = 0;
            self.slots.push(Slot { gen, value: Some(value) });
            Idx { index: (self.slots.len() - 1) as u32, gen }
        }
    }

    pub fn get(&self, id: Idx) -> Option<&T> {
        self.slots.get(id.index as usize).filter(|s| s.gen == id.gen).and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, id: Idx) -> Option<&mut T> {
        self.slots.get_mut(id.index as usize).filter(|s| s.gen == id.gen).and_then(|s| s.value.as_mut())
    }

    /// Number of live entries, for `hcb.dump`/`storage.list`-style CLI
    /// introspection (§6).
    pub fn count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Removes and returns the value at `id`, bumping its generation so any
    /// stale `Idx` still floating around fails to resolve (§4.2's "destroyed
    /// only after removal from all lists" — a double-free shows up here as
    /// a `None` return rather than UB).
    pub fn remove(&mut self, id: Idx) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        let v = slot.value.take();
        if v.is_some() {
            slot.gen = slot.gen.wrapping_add(1);
            self.free.push(id.index);
        }
        v
    }
}

macro_rules! arena_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(Idx);

        impl $name {
            #[cfg(test)]
            pub fn for_test(n: u32) -> Self {
                Self(Idx { index: n, gen: 0 })
            }
        }
    };
}

arena_id!(ObjHeadId);
arena_id!(ObjCoreId);
arena_id!(ObjectId);

bitflags! {
    /// §3 Objcore flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjFlags: u8 {
        const BUSY = 0b0000_0001;
        const PASS = 0b0000_0010;
        const ONLRU = 0b0000_0100;
        const LRUDONTMOVE = 0b0000_1000;
        const PRIV = 0b0001_0000;
    }
}

/// A session parked on an objhead's waiting list (§4.2, §4.3, §5). Woken by
/// sending on `wake`; the session retains exactly one objhead refcount
/// across the park, per §5's ordering guarantee.
pub struct Parked {
    pub objhead: ObjHeadId,
    pub wake: oneshot::Receiver<()>,
}

struct ObjHeadInner {
    digest: [u8; 32],
    refcnt: u32,
    /// non-busy-live entries toward the front, BUSY entries at the tail
    /// (§4.2's ordering invariant).
    objcores: Vec<ObjCoreId>,
    waiting: VecDeque<oneshot::Sender<()>>,
}

pub struct ObjHead {
    inner: Lock<ObjHeadInner>,
}

pub struct ObjCore {
    pub objhead: ObjHeadId,
    pub flags: ObjFlags,
    pub refcnt: u32,
    pub object: Option<ObjectId>,
    pub ban: Option<BanId>,
    pub exp_key: Option<ExpiryKey>,
}

/// §3 Object: the user-visible cached content.
pub struct Object {
    pub xid: u64,
    pub objcore: ObjCoreId,
    pub headers: HeaderTable,
    pub header_storage: Storage,
    pub body: Vec<Storage>,
    pub ttl: Duration,
    pub grace: Duration,
    pub entered: Instant,
    pub last_use: Instant,
    pub last_lru: Instant,
    pub vary: Vec<u8>,
    pub esi: Option<crate::fetch::esi::EsiProgram>,
    pub hits: u64,
    pub ban_t: Instant,
    pub gzipped: bool,
    /// the originating request's URL and headers, kept for §4.7's lazy ban
    /// evaluation ("bans are evaluated against the object's stored request
    /// metadata"); not otherwise used by delivery.
    pub req_url: Vec<u8>,
    pub req_headers: HeaderTable,
}

impl Object {
    pub fn expiry_instant(&self) -> Instant {
        self.entered + self.ttl + self.grace
    }

    pub fn is_live(&self, now: Instant) -> bool {
        now < self.entered + self.ttl
    }

    pub fn is_in_grace(&self, now: Instant) -> bool {
        let live_end = self.entered + self.ttl;
        now >= live_end && now < live_end + self.grace
    }

    pub fn content_length(&self) -> usize {
        self.body.iter().map(Storage::len).sum()
    }
}

/// Outcome of [`Cache::lookup`] (§4.2).
pub enum LookupResult {
    /// a live, Vary-matched object — refcount already incremented.
    Hit(ObjCoreId),
    /// a freshly inserted BUSY objcore; caller must fetch and call
    /// [`Cache::unbusy`] (or [`Cache::deref`] on failure).
    Miss(ObjCoreId),
    /// the session was queued on the objhead waiting list; it must not
    /// touch anything else until `wake` fires.
    Parked(Parked),
}

pub struct Cache {
    objheads: Lock<Arena<ObjHead>>,
    objcores: Lock<Arena<ObjCore>>,
    objects: Lock<Arena<Object>>,
    hash: HashSlinger,
    pub bans: BanList,
    pub expiry: ExpiryQueue,
}

impl Cache {
    pub fn new() -> Self {
        Self {
            objheads: Lock::new(Arena::new(), LockRank::ObjHead),
            objcores: Lock::new(Arena::new(), LockRank::ObjHead),
            objects: Lock::new(Arena::new(), LockRank::ObjHead),
            hash: HashSlinger::new(),
            bans: BanList::new(),
            expiry: ExpiryQueue::new(),
        }
    }

    fn ref_objhead(&self, digest: [u8; 32]) -> ObjHeadId {
        if let Some(id) = self.hash.lookup(&digest) {
            self.objheads.lock().get_mut(id.0).unwrap().inner.lock().refcnt += 1;
            return id;
        }
        let mut arena = self.objheads.lock();
        let id = ObjHeadId(arena.insert(ObjHead {
            inner: Lock::new(
                ObjHeadInner { digest, refcnt: 1, objcores: Vec::new(), waiting: VecDeque::new() },
                LockRank::ObjHead,
            ),
        }));
        drop(arena);
        self.hash.insert(digest, id)
    }

    /// §4.2 Lookup. `esi_nested` is true when this lookup is for a nested
    /// ESI include (§4.2 step 5: "if a busy objcore exists and esi-nesting
    /// level is zero" — at nonzero nesting we never park, to avoid a
    /// deadlock where the parent fetch that would unbusy us is itself
    /// blocked on delivering this very include).
    #[instrument(skip(self, vary_match), fields(digest = %hex(&digest)))]
    #[allow(clippy::fn_params_excessive_bools)]
    #[allow(clippy::too_many_arguments)]
    pub fn lookup(
        &self,
        digest: [u8; 32],
        now: Instant,
        esi_nested: bool,
        hash_always_miss: bool,
        backend_healthy: bool,
        vary_match: impl Fn(&Object) -> bool,
    ) -> LookupResult {
        let objhead_id = self.ref_objhead(digest);
        let objheads = self.objheads.lock();
        let objhead = objheads.get(objhead_id.0).unwrap();
        let mut inner = objhead.inner.lock();

        let mut objcores = self.objcores.lock();
        let mut objects = self.objects.lock();

        let mut busy_oc: Option<ObjCoreId> = None;
        let mut live_oc: Option<ObjCoreId> = None;
        let mut grace_oc: Option<(ObjCoreId, Instant)> = None;

        for &oc_id in &inner.objcores {
            let oc = objcores.get(oc_id).unwrap();
            if oc.flags.contains(ObjFlags::BUSY) {
                busy_oc.get_or_insert(oc_id);
                continue;
            }
            let Some(obj_id) = oc.object else { continue };
            let held_ban = oc.ban;
            let obj = objects.get(obj_id).unwrap();
            if !self.bans.evaluate(held_ban, &obj.req_headers, &obj.req_url) {
                continue;
            }
            if !vary_match(obj) {
                continue;
            }
            // §4.7 amortization: this object just passed every ban newer
            // than its held one, so advance its held ban to the current
            // head rather than re-testing the same predicates next time.
            if let Some(new_head) = self.bans.head() {
                if held_ban != Some(new_head) {
                    self.bans.reference(new_head);
                    if let Some(oc_mut) = objcores.get_mut(oc_id) {
                        oc_mut.ban = Some(new_head);
                    }
                    if let Some(old) = held_ban {
                        self.bans.deref(old);
                    }
                }
            }
            if obj.is_live(now) {
                live_oc = Some(oc_id);
                break;
            } else if obj.is_in_grace(now) {
                let entered = obj.entered;
                if grace_oc.map_or(true, |(_, best)| entered > best) {
                    grace_oc = Some((oc_id, entered));
                }
            }
        }

        let selected = if live_oc.is_some() {
            live_oc
        } else if let Some((oc, _)) = grace_oc {
            if busy_oc.is_some() || !backend_healthy { Some(oc) } else { None }
        } else {
            None
        };

        if let Some(oc_id) = selected {
            if !hash_always_miss {
                // objcores and objects are already both held here (in that
                // order, matching every other call site); mutate the hit
                // counter through them directly rather than dropping and
                // re-locking, which would only invite the re-lock-ordering
                // mistake fixed in `purge` above.
                let obj_id = {
                    let oc = objcores.get_mut(oc_id).unwrap();
                    oc.refcnt += 1;
                    oc.object
                };
                if let Some(obj_id) = obj_id {
                    if let Some(obj) = objects.get_mut(obj_id) {
                        obj.hits = obj.hits.saturating_add(1);
                    }
                }
                drop(objects);
                drop(objcores);
                drop(inner);
                return LookupResult::Hit(oc_id);
            }
        }

        if let Some(_busy) = busy_oc {
            if !esi_nested {
                let (tx, rx) = oneshot::channel();
                inner.waiting.push_back(tx);
                drop(objcores);
                drop(objects);
                drop(inner);
                return LookupResult::Parked(Parked { objhead: objhead_id, wake: rx });
            }
        }

        // MISS: insert a new BUSY objcore at the tail, inheriting the
        // objhead reference we already hold.
        let oc_id = ObjCoreId(objcores.insert(ObjCore {
            objhead: objhead_id,
            flags: ObjFlags::BUSY,
            refcnt: 1,
            object: None,
            ban: None,
            exp_key: None,
        }));
        inner.objcores.push(oc_id);
        drop(objcores);
        drop(objects);
        drop(inner);
        LookupResult::Miss(oc_id)
    }

    /// §4.2 Unbusy: move `oc_id` to the head of its objhead's list, clear
    /// BUSY, then rush the waiting list.
    #[instrument(skip(self))]
    pub fn unbusy(&self, oc_id: ObjCoreId, rush_exponent: usize, requeue: impl Fn(oneshot::Sender<()>)) {
        let objhead_id = {
            let mut objcores = self.objcores.lock();
            let oc = objcores.get_mut(oc_id).unwrap();
            assert!(oc.flags.contains(ObjFlags::BUSY), "Unbusy on a non-busy objcore is a programming error");
            oc.flags.remove(ObjFlags::BUSY);
            oc.objhead
        };

        let objheads = self.objheads.lock();
        let objhead = objheads.get(objhead_id.0).unwrap();
        let mut inner = objhead.inner.lock();
        inner.objcores.retain(|&id| id != oc_id);
        inner.objcores.insert(0, oc_id);
        self.rush_locked(&mut inner, rush_exponent, requeue);
    }

    fn rush_locked(
        &self,
        inner: &mut ObjHeadInner,
        rush_exponent: usize,
        requeue: impl Fn(oneshot::Sender<()>),
    ) {
        let mut n = 0;
        while n < rush_exponent {
            let Some(tx) = inner.waiting.pop_front() else { break };
            requeue(tx);
            n += 1;
        }
    }

    /// §4.2 Deref: release one reference to `oc_id`; frees the objcore
    /// (and its object) when the count reaches zero, then derefs the
    /// owning objhead.
    #[instrument(skip(self, stevedore))]
    pub fn deref(&self, oc_id: ObjCoreId, stevedore: &Stevedore) {
        let (objhead_id, freed_object) = {
            let mut objcores = self.objcores.lock();
            let oc = objcores.get_mut(oc_id).unwrap();
            oc.refcnt -= 1;
            if oc.refcnt > 0 {
                return;
            }
            let objhead_id = oc.objhead;
            let obj_id = oc.object;
            let ban = oc.ban.take();
            if let Some(b) = ban {
                self.bans.deref(b);
            }
            objcores.remove(oc_id);
            (objhead_id, obj_id)
        };

        if let Some(obj_id) = freed_object {
            let mut objects = self.objects.lock();
            if let Some(obj) = objects.remove(obj_id) {
                for chunk in obj.body {
                    stevedore.free(chunk);
                }
                stevedore.free(obj.header_storage);
            }
        }

        let objheads = self.objheads.lock();
        let objhead = objheads.get(objhead_id.0).unwrap();
        let mut inner = objhead.inner.lock();
        inner.objcores.retain(|&id| id != oc_id);
        inner.refcnt -= 1;
        let destroy = inner.refcnt == 0 && inner.objcores.is_empty() && inner.waiting.is_empty();
        drop(inner);
        drop(objheads);
        if destroy {
            self.hash.remove(objhead_id);
            self.objheads.lock().remove(objhead_id.0);
        }
    }

    /// Completes a fetch: installs `object` into `oc_id`, hands it to the
    /// expiry queue, then unbusies it.
    pub fn install_and_unbusy(
        &self,
        oc_id: ObjCoreId,
        object: Object,
        rush_exponent: usize,
        requeue: impl Fn(oneshot::Sender<()>),
    ) -> ObjectId {
        let key = ExpiryKey::new(object.expiry_instant());
        // §4.7: a freshly fetched object already postdates every existing
        // ban, so it starts out holding a reference to the current head
        // (if any) rather than being tested against the full ban history.
        let initial_ban = self.bans.head();
        if let Some(b) = initial_ban {
            self.bans.reference(b);
        }
        let obj_id = ObjectId(self.objects.lock().insert(object));
        {
            let mut objcores = self.objcores.lock();
            let oc = objcores.get_mut(oc_id).unwrap();
            oc.object = Some(obj_id);
            oc.exp_key = Some(key);
            oc.ban = initial_ban;
            oc.flags.insert(ObjFlags::ONLRU);
        }
        self.expiry.insert(key, oc_id);
        self.unbusy(oc_id, rush_exponent, requeue);
        obj_id
    }

    /// §4.2 Purge: snapshot non-busy objcores under an objhead for `digest`
    /// (incrementing each's refcount), then outside the objhead lock
    /// rewrite TTL/grace to the purge values, rearm expiry for each, and
    /// deref each — releasing the refcount the snapshot took, per §4.2's
    /// "rewrite TTL and grace to the purge values and rearm expiry for
    /// each; deref each". `stevedore` is needed because `deref` may free
    /// the object's storage if this was the last reference.
    pub fn purge(&self, digest: [u8; 32], ttl: Duration, grace: Duration, now: Instant, stevedore: &Stevedore) -> usize {
        let Some(objhead_id) = self.hash.lookup(&digest) else { return 0 };
        let snapshot: Vec<ObjCoreId> = {
            let objheads = self.objheads.lock();
            let objhead = objheads.get(objhead_id.0).unwrap();
            let inner = objhead.inner.lock();
            let mut objcores = self.objcores.lock();
            inner
                .objcores
                .iter()
                .copied()
                .filter(|&id| {
                    let oc = objcores.get_mut(id).unwrap();
                    if oc.flags.contains(ObjFlags::BUSY) {
                        false
                    } else {
                        oc.refcnt += 1;
                        true
                    }
                })
                .collect()
        };

        for oc_id in &snapshot {
            // objcores locked before objects, matching `lookup`'s order —
            // taking them the other way round here would invert the lock
            // order against a concurrent `lookup` and risk deadlock.
            let objcores = self.objcores.lock();
            let mut objects = self.objects.lock();
            let rearm = if let Some(oc) = objcores.get(*oc_id) {
                if let Some(obj_id) = oc.object {
                    objects.get_mut(obj_id).map(|obj| {
                        obj.entered = now - obj.ttl; // force immediate expiry baseline
                        obj.ttl = ttl;
                        obj.grace = grace;
                        ExpiryKey::new(obj.expiry_instant())
                    })
                } else {
                    None
                }
            } else {
                None
            };
            drop(objects);
            drop(objcores);
            if let Some(key) = rearm {
                self.expiry.rearm(key, *oc_id);
            }
            self.deref(*oc_id, stevedore);
        }
        snapshot.len()
    }

    /// Runs `f` with a read reference to the object behind `obj_id`, under
    /// the objects-arena lock. Kept as a closure-taking accessor (rather
    /// than returning a guard) since `Lock<T>`'s guard does not support
    /// projecting into an `Arena` entry by reference across an `Option`.
    pub fn with_object<R>(&self, obj_id: ObjectId, f: impl FnOnce(&Object) -> R) -> Option<R> {
        let objects = self.objects.lock();
        objects.get(obj_id).map(f)
    }

    pub fn with_object_mut<R>(&self, obj_id: ObjectId, f: impl FnOnce(&mut Object) -> R) -> Option<R> {
        let mut objects = self.objects.lock();
        objects.get_mut(obj_id).map(f)
    }

    pub fn objcore_object(&self, oc_id: ObjCoreId) -> Option<ObjectId> {
        self.objcores.lock().get(oc_id).and_then(|oc| oc.object)
    }

    /// §4.6 `EXP_Touch`: advances `last_lru`, gated by the caller on the
    /// `lru_interval` elapsed-time check.
    pub fn touch(&self, obj_id: ObjectId, now: Instant) {
        self.with_object_mut(obj_id, |o| o.last_use = now);
    }

    /// Live objhead/objcore/object counts, for the `hcb.dump` CLI command
    /// (§6: "a small in-process command table so the core's side of that
    /// interface is real and testable").
    pub fn hcb_counts(&self) -> (usize, usize, usize) {
        (self.objheads.lock().count(), self.objcores.lock().count(), self.objects.lock().count())
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

fn hex(d: &[u8; 32]) -> String {
    d.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(n: u8) -> [u8; 32] {
        let mut d = [0u8; 32];
        d[0] = n;
        d
    }

    #[test]
    fn miss_then_hit() {
        let cache = Cache::new();
        let now = Instant::now();
        let oc = match cache.lookup(digest(1), now, false, false, true, |_| true) {
            LookupResult::Miss(oc) => oc,
            _ => panic!("expected miss"),
        };
        let object = Object {
            xid: 1,
            objcore: oc,
            headers: HeaderTable::new(),
            header_storage: Storage { bytes: Vec::new() },
            body: Vec::new(),
            ttl: Duration::from_secs(60),
            grace: Duration::from_secs(10),
            entered: now,
            last_use: now,
            last_lru: now,
            vary: Vec::new(),
            esi: None,
            hits: 0,
            ban_t: now,
            gzipped: false,
            req_url: Vec::new(),
            req_headers: HeaderTable::new(),
        };
        cache.install_and_unbusy(oc, object, 3, |_| {});

        match cache.lookup(digest(1), now, false, false, true, |_| true) {
            LookupResult::Hit(hit_oc) => assert_eq!(hit_oc, oc),
            _ => panic!("expected hit after unbusy"),
        }
    }

    #[test]
    fn concurrent_miss_parks_second_request() {
        let cache = Cache::new();
        let now = Instant::now();
        let _first = match cache.lookup(digest(2), now, false, false, true, |_| true) {
            LookupResult::Miss(oc) => oc,
            _ => panic!("expected miss"),
        };
        match cache.lookup(digest(2), now, false, false, true, |_| true) {
            LookupResult::Parked(_) => {},
            _ => panic!("second concurrent lookup should park on the waiting list"),
        }
    }
}
