//! §4.8 / (ADDED) 4.2a: the policy hook interface — a closed trait standing
//! in for the compiled configuration-language policy the source compiles
//! from VCL. Per §9 REDESIGN FLAGS ("pluggable X... model as a capability
//! set... trait/interface, avoid dynamic open-ended plugin loading"),
//! `Policy` is one method per hook (`recv`/`hash`/`pipe`/`pass`/`hit`/
//! `miss`/`fetch`/`deliver`/`error`), each returning the hook's action enum.
//!
//! Grounded in a single trait boundary per externally pluggable concern;
//! `arc-swap` (pulled in for this exact need, noted in DESIGN.md) gives the
//! "compiled policy set is refcounted; background refresh installs a new
//! set while old sessions drain against their held references" contract
//! without a reader ever blocking.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::http::{HeaderTable, Method};

/// The action an individual hook is allowed to request. Not every variant is
/// legal from every hook — [`crate::state`] validates the return against a
/// per-hook allowlist and panics on an illegal combination (§7: "Policy
/// error... fatal abort; programmer error").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyAction {
    Lookup,
    Pipe,
    Pass,
    Fetch,
    Deliver,
    HitForPass,
    Restart,
    Error { status: u16, reason: String },
}

impl PolicyAction {
    pub fn error(status: u16, reason: impl Into<String>) -> Self {
        Self::Error { status, reason: reason.into() }
    }
}

/// Request-side context handed to `recv`/`hash`/`pipe`/`pass`/`miss`/`fetch`.
/// Carries only what a hook needs to decide, not the live session, so
/// `policy.rs` has no dependency on [`crate::session`].
pub struct RecvCtx<'a> {
    pub method: Method,
    pub url: &'a [u8],
    pub headers: &'a HeaderTable,
}

/// Object-side context handed to `hit`/`deliver`.
pub struct ObjCtx<'a> {
    pub status: u16,
    pub headers: &'a HeaderTable,
    pub is_live: bool,
    pub is_grace: bool,
}

/// Context handed to `error`: the failing stage's proposed status/reason,
/// which the hook may override.
pub struct ErrorCtx<'a> {
    pub status: u16,
    pub reason: &'a str,
}

/// The closed hook set (§4.8). Every hook has a sensible default in
/// [`DefaultPolicy`] so the core runs without an external DSL compiler.
pub trait Policy: Send + Sync {
    fn recv(&self, ctx: &RecvCtx<'_>) -> PolicyAction;
    fn hash(&self, ctx: &RecvCtx<'_>) -> [u8; 32];
    fn pipe(&self, ctx: &RecvCtx<'_>) -> PolicyAction;
    fn pass(&self, ctx: &RecvCtx<'_>) -> PolicyAction;
    fn hit(&self, ctx: &RecvCtx<'_>, obj: &ObjCtx<'_>) -> PolicyAction;
    fn miss(&self, ctx: &RecvCtx<'_>) -> PolicyAction;
    fn fetch(&self, ctx: &RecvCtx<'_>, obj: &ObjCtx<'_>) -> PolicyAction;
    fn deliver(&self, ctx: &RecvCtx<'_>, obj: &ObjCtx<'_>) -> PolicyAction;
    fn error(&self, ctx: &RecvCtx<'_>, err: &ErrorCtx<'_>) -> PolicyAction;
}

/// The allowlist of actions legal from a given hook (§4.8: "validates
/// against a per-hook allowlist; illegal returns are a fatal abort").
pub fn allowed_for(hook: &'static str, action: &PolicyAction) -> bool {
    use PolicyAction::*;
    match (hook, action) {
        ("recv", Lookup | Pipe | Pass | Error { .. }) => true,
        ("hash", _) => false, // hash returns a digest directly, never an action
        ("pipe", Pipe | Error { .. }) => true,
        ("pass", Fetch | Error { .. }) => true,
        ("hit", Deliver | Pass | Error { .. } | Restart) => true,
        ("miss", Fetch | Pass | Error { .. }) => true,
        ("fetch", Deliver | Error { .. }) => true,
        ("deliver", Deliver | Restart) => true,
        ("error", Deliver | Restart) => true,
        _ => false,
    }
}

fn join_host_url(headers: &HeaderTable, url: &[u8]) -> Vec<u8> {
    let host = headers.get("host").map(|b| b.as_ref()).unwrap_or(b"");
    let mut out = Vec::with_capacity(host.len() + 1 + url.len());
    out.extend_from_slice(host);
    out.push(b'#');
    out.extend_from_slice(url);
    out
}

/// The built-in default policy, matching conventional VCL defaults: pass on
/// `Cookie`/`Authorization` for non-GET/HEAD traffic; hash on Host+URL.
pub struct DefaultPolicy {
    pub gzip_enabled: bool,
}

impl Policy for DefaultPolicy {
    fn recv(&self, ctx: &RecvCtx<'_>) -> PolicyAction {
        if !ctx.method.is_cacheable() {
            return PolicyAction::Pass;
        }
        if ctx.headers.contains("authorization") {
            return PolicyAction::Pass;
        }
        if ctx.headers.contains("cookie") {
            return PolicyAction::Pass;
        }
        PolicyAction::Lookup
    }

    fn hash(&self, ctx: &RecvCtx<'_>) -> [u8; 32] {
        use sha2::{Digest, Sha256};
        let material = join_host_url(ctx.headers, ctx.url);
        let digest = Sha256::digest(&material);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        out
    }

    fn pipe(&self, _ctx: &RecvCtx<'_>) -> PolicyAction {
        PolicyAction::Pipe
    }

    fn pass(&self, _ctx: &RecvCtx<'_>) -> PolicyAction {
        PolicyAction::Fetch
    }

    fn hit(&self, _ctx: &RecvCtx<'_>, obj: &ObjCtx<'_>) -> PolicyAction {
        if obj.is_live || obj.is_grace {
            PolicyAction::Deliver
        } else {
            PolicyAction::Pass
        }
    }

    fn miss(&self, _ctx: &RecvCtx<'_>) -> PolicyAction {
        PolicyAction::Fetch
    }

    fn fetch(&self, _ctx: &RecvCtx<'_>, _obj: &ObjCtx<'_>) -> PolicyAction {
        PolicyAction::Deliver
    }

    fn deliver(&self, _ctx: &RecvCtx<'_>, _obj: &ObjCtx<'_>) -> PolicyAction {
        PolicyAction::Deliver
    }

    fn error(&self, _ctx: &RecvCtx<'_>, _err: &ErrorCtx<'_>) -> PolicyAction {
        PolicyAction::Deliver
    }
}

/// The hot-swappable handle sessions hold (§4.8: "compiled policy set is
/// refcounted; background refresh installs a new set while old sessions
/// drain against their held references"). A session clones the `Arc` once
/// per request via [`PolicySet::current`], so an in-flight request is
/// unaffected by a later `store`.
pub struct PolicySet {
    current: ArcSwap<dyn Policy>,
}

impl PolicySet {
    pub fn new(policy: Arc<dyn Policy>) -> Self {
        Self { current: ArcSwap::from(policy) }
    }

    pub fn current(&self) -> Arc<dyn Policy> {
        self.current.load_full()
    }

    pub fn store(&self, policy: Arc<dyn Policy>) {
        self.current.store(policy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn ctx<'a>(headers: &'a HeaderTable, url: &'a [u8]) -> RecvCtx<'a> {
        RecvCtx { method: Method::Get, url, headers }
    }

    #[test]
    fn passes_requests_carrying_a_cookie() {
        let policy = DefaultPolicy { gzip_enabled: true };
        let mut headers = HeaderTable::new();
        headers.push(Bytes::from_static(b"Cookie"), Bytes::from_static(b"foo=bar"));
        assert_eq!(policy.recv(&ctx(&headers, b"/a")), PolicyAction::Pass);
    }

    #[test]
    fn looks_up_plain_get() {
        let policy = DefaultPolicy { gzip_enabled: true };
        let headers = HeaderTable::new();
        assert_eq!(policy.recv(&ctx(&headers, b"/a")), PolicyAction::Lookup);
    }

    #[test]
    fn hash_is_stable_for_same_host_and_url() {
        let policy = DefaultPolicy { gzip_enabled: true };
        let mut headers = HeaderTable::new();
        headers.push(Bytes::from_static(b"Host"), Bytes::from_static(b"example.com"));
        let a = policy.hash(&ctx(&headers, b"/a"));
        let b = policy.hash(&ctx(&headers, b"/a"));
        let c = policy.hash(&ctx(&headers, b"/b"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn recv_action_is_not_allowed_from_hit_hook() {
        assert!(!allowed_for("hit", &PolicyAction::Lookup));
        assert!(allowed_for("hit", &PolicyAction::Deliver));
    }

    #[test]
    fn policy_set_swap_is_visible_to_new_loads() {
        let set = PolicySet::new(Arc::new(DefaultPolicy { gzip_enabled: true }));
        let _first = set.current();
        set.store(Arc::new(DefaultPolicy { gzip_enabled: false }));
        assert!(!set.current().recv(&ctx(&HeaderTable::new(), b"/x")).eq(&PolicyAction::Restart));
    }
}
