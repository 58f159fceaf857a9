//! Component Q: the per-request session — the state machine's working set.
//!
//! Generalized from "one connection, one job" per-connection state to "one
//! HTTP session that may outlive many requests", with ESI recursion
//! expressed as an explicit stack of suspended parent-session snapshots
//! held in the session struct rather than recursion on the host stack.

use std::net::SocketAddr;
use std::time::Instant;

use tokio::net::TcpStream;

use crate::cache::{ObjCoreId, ObjectId};
use crate::deliver::DeliverPlan;
use crate::fetch::{FetchedBody, FetchedHead};
use crate::http::{HeaderTable, HttpConn, Method, Request, Response, Version};
use crate::workspace::Workspace;

/// Whether the in-flight fetch (FETCH/FETCHBODY) will be installed into the
/// cache on completion, set when MISS/PASS hands off to FETCH (§4.1: "PASS
/// fetches are never installed").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchIntent {
    Cacheable,
    PassThrough,
}

/// §4.1's state labels. `Done` is terminal; the dispatcher loop in
/// [`crate::state`] stops when it is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    First,
    Wait,
    Start,
    Recv,
    Lookup,
    Hit,
    Miss,
    Pass,
    Pipe,
    Fetch,
    FetchBody,
    StreamBody,
    PrepResp,
    Deliver,
    Error,
    Done,
}

/// A parsed request plus its computed hash digest, held across a Lookup.
#[derive(Debug, Clone)]
pub struct ReqState {
    pub method: Method,
    pub url: Vec<u8>,
    pub version: Version,
    pub headers: HeaderTable,
    pub digest: Option<[u8; 32]>,
    pub hash_always_miss: bool,
}

impl ReqState {
    pub fn from_request(req: &Request) -> Self {
        Self {
            method: req.method,
            url: req.target.to_vec(),
            version: req.version,
            headers: req.headers.clone(),
            digest: None,
            hash_always_miss: false,
        }
    }
}

/// Snapshot of a session's HTTP state, pushed/popped across an ESI include
/// re-entry (§4.5 "saves the parent session's HTTP state... rewrites the
/// session's URL/Host to the include target... On return it restores the
/// parent HTTP state").
#[derive(Debug, Clone)]
pub struct EsiFrame {
    pub req: ReqState,
    pub step: Step,
}

/// What the response-side handlers are operating on: either a cache hit's
/// object, a freshly-fetched object pending install, or a synthesized error.
pub enum ObjTarget {
    Cached(ObjCoreId, ObjectId),
    /// a BUSY objcore owned by this session, mid-fetch.
    Busy(ObjCoreId),
    None,
}

pub struct Session {
    pub peer: SocketAddr,
    pub step: Step,
    pub xid: u64,
    pub t_start: Instant,
    pub req: Option<ReqState>,
    pub obj: ObjTarget,
    pub restarts: u32,
    pub esi_level: u32,
    pub esi_stack: Vec<EsiFrame>,
    pub doclose: bool,
    pub workspace: Workspace,
    /// the last response head built, so DELIVER/ERROR can finish writing it.
    pub resp: Option<Response>,
    /// whether the FETCH/FETCHBODY currently in flight will be installed.
    pub fetch_intent: FetchIntent,
    /// the backend connection held open between FETCH and FETCHBODY.
    pub fetch_conn: Option<HttpConn<TcpStream>>,
    pub fetched_head: Option<FetchedHead>,
    pub fetched_body: Option<FetchedBody>,
    /// the delivery plan computed in PREPRESP, consumed in DELIVER.
    pub deliver_plan: Option<DeliverPlan>,
}

impl Session {
    pub fn new(peer: SocketAddr, xid: u64, workspace_size: usize) -> Self {
        Self {
            peer,
            step: Step::First,
            xid,
            t_start: Instant::now(),
            req: None,
            obj: ObjTarget::None,
            restarts: 0,
            esi_level: 0,
            esi_stack: Vec::new(),
            doclose: false,
            workspace: Workspace::new(workspace_size),
            resp: None,
            fetch_intent: FetchIntent::Cacheable,
            fetch_conn: None,
            fetched_head: None,
            fetched_body: None,
            deliver_plan: None,
        }
    }

    /// Begins an ESI include re-entry (§4.5): pushes the current request
    /// state and step, rewrites the URL, and resets to RECV.
    pub fn push_esi_include(&mut self, include_url: Vec<u8>) {
        let current_req = self.req.clone().expect("esi include requires a current request");
        let current_step = self.step;
        self.esi_stack.push(EsiFrame { req: current_req.clone(), step: current_step });
        self.esi_level += 1;
        let mut next = current_req;
        next.url = include_url;
        next.digest = None;
        self.req = Some(next);
        self.step = Step::Recv;
    }

    /// Restores the parent's HTTP state after an ESI include's sub-request
    /// reaches DONE.
    pub fn pop_esi_include(&mut self) {
        if let Some(frame) = self.esi_stack.pop() {
            self.req = Some(frame.req);
            self.esi_level = self.esi_level.saturating_sub(1);
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.t_start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn sample_request() -> Request {
        Request {
            method: Method::Get,
            method_raw: Bytes::from_static(b"GET"),
            target: Bytes::from_static(b"/a"),
            version: Version::Http11,
            headers: HeaderTable::new(),
        }
    }

    #[test]
    fn esi_include_push_and_pop_restores_parent_url() {
        let mut sess = Session::new("127.0.0.1:0".parse().unwrap(), 1, 4096);
        sess.req = Some(ReqState::from_request(&sample_request()));
        sess.step = Step::Deliver;

        sess.push_esi_include(b"/child".to_vec());
        assert_eq!(sess.esi_level, 1);
        assert_eq!(sess.req.as_ref().unwrap().url, b"/child");
        assert_eq!(sess.step, Step::Recv);

        sess.pop_esi_include();
        assert_eq!(sess.esi_level, 0);
        assert_eq!(sess.req.as_ref().unwrap().url, b"/a");
    }
}
