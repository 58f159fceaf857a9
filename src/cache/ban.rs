//! Component F: the ban list (§4.7) — an ordered, append-only list of
//! invalidation predicates, lazily evaluated against each object on lookup.
//!
//! No ban source file exists in this tree at all (no `cache_ban.c`, no
//! ban-check file); grounded directly on spec.md §4.7's prose description
//! of the append-only list and lazy per-object test, with the "test the
//! object's held ban against the current head, advance on no match"
//! amortization slotted into `cache_hash.c`'s object lookup loop, the
//! natural place such a check would run in this tree.

use std::time::Instant;

use crate::http::HeaderTable;
use crate::lock::{Lock, LockRank};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanOp {
    Equal,
    NotEqual,
    Match,
    NotMatch,
}

/// One ban predicate: `req.<field> <op> <value>`. `field` names the
/// request-header or pseudo-field (`req.url`, `req.http.<name>`) the
/// original ban-lang grammar would compile; the DSL compiler itself is out
/// of scope per §1, so predicates are constructed programmatically (by the
/// CLI surface's `ban` command, §6) rather than parsed from ban-lang text.
#[derive(Debug, Clone)]
pub struct BanTest {
    pub field: String,
    pub op: BanOp,
    pub value: String,
}

impl BanTest {
    /// Evaluates this predicate against an object's stored request
    /// metadata (its header table, with `req.url` addressed specially).
    pub fn matches(&self, headers: &HeaderTable, url: &[u8]) -> bool {
        let actual: Vec<u8> = if self.field == "req.url" {
            url.to_vec()
        } else if let Some(name) = self.field.strip_prefix("req.http.") {
            headers.get(name).map(|b| b.to_vec()).unwrap_or_default()
        } else {
            Vec::new()
        };
        match self.op {
            BanOp::Equal => actual == self.value.as_bytes(),
            BanOp::NotEqual => actual != self.value.as_bytes(),
            BanOp::Match => {
                regex::bytes::Regex::new(&self.value).map(|re| re.is_match(&actual)).unwrap_or(false)
            },
            BanOp::NotMatch => {
                regex::bytes::Regex::new(&self.value).map(|re| !re.is_match(&actual)).unwrap_or(true)
            },
        }
    }
}

/// A stable handle into the ban list, held by every objcore whose object
/// was inserted after this ban existed (§3 `Ban`, §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BanId(usize);

struct Entry {
    test: BanTest,
    created: Instant,
    refcnt: u32,
    /// `true` once refcnt reached zero; the retirement thread actually
    /// removes tombstoned entries from the tail in creation order so the
    /// `Vec`'s indices (and every live `BanId`) stay valid.
    tombstoned: bool,
}

struct Inner {
    entries: Vec<Entry>,
}

/// §3/§4.7 Ban list: append-only, oldest-first `Vec`. A `BanId` is a stable
/// index; entries are only ever tombstoned (never removed by index) until
/// the tail-trimming retirement pass, which only trims a contiguous run of
/// tombstoned entries starting at index 0 so no live `BanId` is invalidated.
pub struct BanList {
    inner: Lock<Inner>,
}

impl BanList {
    pub fn new() -> Self {
        Self { inner: Lock::new(Inner { entries: Vec::new() }, LockRank::ObjHead) }
    }

    /// Appends a new ban, returning its id and creation timestamp.
    pub fn add(&self, test: BanTest, now: Instant) -> (BanId, Instant) {
        let mut inner = self.inner.lock();
        let id = BanId(inner.entries.len());
        inner.entries.push(Entry { test, created: now, refcnt: 0, tombstoned: false });
        (id, now)
    }

    /// The current head (newest ban), used by lookup's amortized check.
    pub fn head(&self) -> Option<BanId> {
        let inner = self.inner.lock();
        (0..inner.entries.len()).rev().find(|&i| !inner.entries[i].tombstoned).map(BanId)
    }

    /// Takes a reference on `id`, called when an object adopts it as its
    /// held ban.
    pub fn reference(&self, id: BanId) {
        let mut inner = self.inner.lock();
        if let Some(e) = inner.entries.get_mut(id.0) {
            e.refcnt += 1;
        }
    }

    pub fn deref(&self, id: BanId) {
        let mut inner = self.inner.lock();
        if let Some(e) = inner.entries.get_mut(id.0) {
            e.refcnt = e.refcnt.saturating_sub(1);
        }
    }

    /// §4.7's per-lookup evaluation: given an object's held ban (`held`,
    /// possibly `None` for an object older than any ban) and its
    /// request metadata, walks every ban newer than `held` in
    /// newest-to-oldest order. Returns `false` (banned) if any matches,
    /// `true` (still live) otherwise. On a clean pass the caller should
    /// advance the object's held ban to the current head to amortize the
    /// next check — that bookkeeping lives in the object, not here.
    pub fn evaluate(&self, held: Option<BanId>, headers: &HeaderTable, url: &[u8]) -> bool {
        let inner = self.inner.lock();
        let start = held.map_or(0, |h| h.0 + 1);
        for i in (start..inner.entries.len()).rev() {
            let e = &inner.entries[i];
            if e.tombstoned {
                continue;
            }
            if e.test.matches(headers, url) {
                return false;
            }
        }
        true
    }

    /// Background retirement pass (§4.7's "a background thread retires
    /// bans whose refcount reaches zero from the tail"). Only trims a
    /// contiguous prefix of zero-refcount entries so surviving `BanId`
    /// indices remain valid.
    pub fn retire(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut trimmed = 0;
        while let Some(first) = inner.entries.first() {
            if first.refcnt > 0 || first.tombstoned {
                break;
            }
            inner.entries.remove(0);
            trimmed += 1;
        }
        trimmed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BanList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_ban_invalidates() {
        let bans = BanList::new();
        let now = Instant::now();
        let (id, _) = bans.add(BanTest { field: "req.url".into(), op: BanOp::Equal, value: "/a".into() }, now);
        bans.reference(id);
        let headers = HeaderTable::new();
        assert!(!bans.evaluate(None, &headers, b"/a"));
        assert!(bans.evaluate(None, &headers, b"/b"));
    }

    #[test]
    fn held_ban_skips_already_tested_entries() {
        let bans = BanList::new();
        let now = Instant::now();
        let (id1, _) = bans.add(BanTest { field: "req.url".into(), op: BanOp::Equal, value: "/old".into() }, now);
        let headers = HeaderTable::new();
        assert!(bans.evaluate(Some(id1), &headers, b"/old"), "already-held ban is not retested");
    }

    #[test]
    fn retire_only_trims_zero_refcount_prefix() {
        let bans = BanList::new();
        let now = Instant::now();
        let (id1, _) = bans.add(BanTest { field: "req.url".into(), op: BanOp::Equal, value: "/a".into() }, now);
        bans.add(BanTest { field: "req.url".into(), op: BanOp::Equal, value: "/b".into() }, now);
        bans.reference(id1);
        assert_eq!(bans.retire(), 0, "referenced head-of-list entry blocks trimming");
        bans.deref(id1);
        assert_eq!(bans.retire(), 2);
        assert!(bans.is_empty());
    }
}
