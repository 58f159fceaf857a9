//! Component Q continued: `CNT_Session`, the §4.1 state-machine dispatcher.
//!
//! This tree names the file `cache_center.c`, not `cache_req_fsm.c`;
//! grounded on its `CNT_Session` switch over `sess->step`: one big match
//! over a closed enum, each arm returns the next state, just with many
//! more arms and `await` points for I/O.

use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio::net::TcpStream;
use tracing::{instrument, warn};

use crate::backend::Director;
use crate::cache::{Cache, LookupResult, Object};
use crate::debug::DebugState;
use crate::deliver;
use crate::error::{FetchError, HttpError};
use crate::fetch::esi::EsiFragment;
use crate::fetch::{self, FetchedBody, FetchedHead, VfpPlan};
use crate::http::{BodyFraming, HeaderTable, HttpConn, Method, Response, Version};
use crate::params::Params;
use crate::policy::{allowed_for, ErrorCtx, ObjCtx, PolicyAction, PolicySet, RecvCtx};
use crate::session::{FetchIntent, ObjTarget, ReqState, Session, Step};
use crate::stats::GlobalStats;
use crate::storage::{ManagedStevedore, Stevedore};

/// Everything a session needs that outlives it: shared across every
/// connection a worker thread drives (§3's "context" objects, one set per
/// process rather than per session).
pub struct Ctx {
    pub cache: Arc<Cache>,
    pub policy: Arc<PolicySet>,
    pub director: Arc<Director>,
    pub storage: Arc<ManagedStevedore>,
    pub transient: Arc<Stevedore>,
    pub params: Arc<Params>,
    pub stats: Arc<GlobalStats>,
    pub debug: Arc<DebugState>,
}

/// Calls a panic the one sanctioned way (§7): a policy hook returned an
/// action outside its allowlist. This is a configuration-authoring bug, not
/// a runtime condition any caller can recover from.
fn enforce_allowlist(hook: &'static str, action: &PolicyAction) {
    if !allowed_for(hook, action) {
        panic!("policy hook {hook:?} returned disallowed action {action:?}");
    }
}

fn recv_ctx<'a>(req: &'a ReqState) -> RecvCtx<'a> {
    RecvCtx { method: req.method, url: &req.url, headers: &req.headers }
}

fn obj_ctx<'a>(object: &'a Object, now: Instant) -> ObjCtx<'a> {
    ObjCtx {
        status: 200,
        headers: &object.headers,
        is_live: object.is_live(now),
        is_grace: object.is_in_grace(now),
    }
}

/// Builds an [`ObjCtx`] for the `fetch`/`deliver` hooks from a response
/// that isn't (or isn't yet) a stored [`Object`] — a backend head just
/// fetched, or a pass-through response with nothing installed.
fn resp_obj_ctx(response: &Response) -> ObjCtx<'_> {
    ObjCtx { status: response.status, headers: &response.headers, is_live: true, is_grace: false }
}

/// Drives one HTTP/1.x connection through as many requests as keep-alive
/// allows, stopping at a clean EOF (§4.1 WAIT -> DONE) or a fatal I/O error.
#[instrument(skip(ctx, conn))]
pub async fn drive_connection(ctx: &Ctx, conn: &mut HttpConn<TcpStream>, peer: std::net::SocketAddr, first_xid: u64) -> std::io::Result<()> {
    let mut xid = first_xid;
    loop {
        let mut sess = Session::new(peer, xid, ctx.params.workspace_session);
        sess.step = Step::First;
        let keep_going = cnt_session(ctx, &mut sess, conn).await?;
        xid += 1;
        if !keep_going || sess.doclose {
            conn.shutdown().await.ok();
            return Ok(());
        }
    }
}

/// Runs one request through the full state machine, from FIRST to DONE.
/// Returns `Ok(false)` when the connection read a clean EOF at WAIT (no
/// next request is coming) and the caller should stop looping.
pub async fn cnt_session(ctx: &Ctx, sess: &mut Session, conn: &mut HttpConn<TcpStream>) -> std::io::Result<bool> {
    loop {
        sess.step = match sess.step {
            Step::First => Step::Wait,
            Step::Wait => match read_request(conn).await? {
                Some(req) => {
                    sess.req = Some(req);
                    Step::Start
                },
                None => return Ok(false),
            },
            Step::Start => Step::Recv,
            Step::Recv => cnt_recv(ctx, sess),
            Step::Lookup => cnt_lookup(ctx, sess).await,
            Step::Hit => cnt_hit(ctx, sess),
            Step::Miss => cnt_miss(ctx, sess),
            Step::Pass => cnt_pass(ctx, sess),
            Step::Pipe => {
                cnt_pipe(ctx, sess, conn).await?;
                Step::Done
            },
            Step::Fetch => cnt_fetch(ctx, sess).await,
            Step::FetchBody => cnt_fetch_body(ctx, sess).await,
            Step::StreamBody => Step::Deliver,
            Step::PrepResp => cnt_prep_resp(ctx, sess),
            Step::Deliver => {
                cnt_deliver(ctx, sess, conn).await?;
                Step::Done
            },
            Step::Error => cnt_error(ctx, sess),
            Step::Done => return Ok(true),
        };
    }
}

async fn read_request(conn: &mut HttpConn<TcpStream>) -> std::io::Result<Option<ReqState>> {
    match conn.read_request().await? {
        Some(req) => Ok(Some(ReqState::from_request(&req))),
        None => Ok(None),
    }
}

/// RECV: §4.1 "classify the request; ask the policy's recv hook for
/// Lookup/Pipe/Pass/Error". Restarts (§4.1's bounded RECV re-entry from
/// HIT/DELIVER/ERROR) land back here.
fn cnt_recv(ctx: &Ctx, sess: &mut Session) -> Step {
    let req = sess.req.as_ref().expect("RECV without a parsed request");
    let action = ctx.policy.current().recv(&recv_ctx(req));
    enforce_allowlist("recv", &action);
    match action {
        PolicyAction::Lookup => Step::Lookup,
        PolicyAction::Pipe => Step::Pipe,
        PolicyAction::Pass => Step::Pass,
        PolicyAction::Error { status, reason } => {
            synth_error(sess, status, reason);
            Step::Error
        },
        other => unreachable!("recv allowlist let through {other:?}"),
    }
}

/// LOOKUP: hashes the request, then drives `Cache::lookup`'s three-way
/// outcome (§4.2). A Parked result awaits the objhead's waiting-list
/// wakeup (request coalescing) before retrying LOOKUP from scratch.
async fn cnt_lookup(ctx: &Ctx, sess: &mut Session) -> Step {
    loop {
        let req = sess.req.as_mut().expect("LOOKUP without a parsed request");
        if req.digest.is_none() {
            req.digest = Some(ctx.policy.current().hash(&recv_ctx(req)));
        }
        let digest = req.digest.unwrap();
        let esi_nested = sess.esi_level > 0;
        let hash_always_miss = req.hash_always_miss;
        let backend_healthy = ctx.director.is_healthy();
        let now = Instant::now();

        let result = ctx.cache.lookup(digest, now, esi_nested, hash_always_miss, backend_healthy, |_obj| true);
        match result {
            LookupResult::Hit(oc_id) => {
                sess.obj = ObjTarget::Busy(oc_id);
                return Step::Hit;
            },
            LookupResult::Miss(oc_id) => {
                sess.obj = ObjTarget::Busy(oc_id);
                return Step::Miss;
            },
            LookupResult::Parked(parked) => {
                if parked.wake.await.is_err() {
                    warn!("objhead waiting-list sender dropped; retrying lookup directly");
                }
                continue;
            },
        }
    }
}

/// HIT: resolves the objcore's live object, asks `policy.hit`.
fn cnt_hit(ctx: &Ctx, sess: &mut Session) -> Step {
    let ObjTarget::Busy(oc_id) = sess.obj else { unreachable!("HIT without a looked-up objcore") };
    let Some(obj_id) = ctx.cache.objcore_object(oc_id) else {
        // objcore has no installed object yet (raced with another fetch); treat as a miss.
        return Step::Miss;
    };
    let now = Instant::now();
    let action = ctx
        .cache
        .with_object(obj_id, |obj| {
            let a = ctx.policy.current().hit(&recv_ctx(sess.req.as_ref().unwrap()), &obj_ctx(obj, now));
            (a, obj.is_live(now))
        })
        .map(|(a, _live)| a)
        .unwrap_or(PolicyAction::Pass);
    enforce_allowlist("hit", &action);
    match action {
        PolicyAction::Deliver => {
            sess.obj = ObjTarget::Cached(oc_id, obj_id);
            ctx.cache.touch(obj_id, now);
            Step::PrepResp
        },
        PolicyAction::Pass => {
            // the Lookup hit already incremented the objcore's refcount;
            // release it since this request will bypass the cache entirely.
            ctx.cache.deref(oc_id, &ctx.storage.stevedore);
            sess.obj = ObjTarget::None;
            Step::Pass
        },
        PolicyAction::Restart => {
            ctx.cache.deref(oc_id, &ctx.storage.stevedore);
            sess.obj = ObjTarget::None;
            sess.restarts += 1;
            if sess.restarts > ctx.params.max_restarts {
                synth_error(sess, 503, "too many restarts");
                return Step::Error;
            }
            Step::Recv
        },
        PolicyAction::Error { status, reason } => {
            ctx.cache.deref(oc_id, &ctx.storage.stevedore);
            sess.obj = ObjTarget::None;
            synth_error(sess, status, reason);
            Step::Error
        },
        other => unreachable!("hit allowlist let through {other:?}"),
    }
}

/// MISS: `policy.miss` decides whether this BUSY objcore proceeds to a
/// cacheable fetch or falls back to an uncached pass.
fn cnt_miss(ctx: &Ctx, sess: &mut Session) -> Step {
    let req = sess.req.as_ref().unwrap();
    let action = ctx.policy.current().miss(&recv_ctx(req));
    enforce_allowlist("miss", &action);
    match action {
        PolicyAction::Fetch => {
            sess.fetch_intent = FetchIntent::Cacheable;
            Step::Fetch
        },
        PolicyAction::Pass => Step::Pass,
        PolicyAction::Error { status, reason } => {
            synth_error(sess, status, reason);
            Step::Error
        },
        other => unreachable!("miss allowlist let through {other:?}"),
    }
}

/// PASS: an uncached fetch-and-forward. `policy.pass` may still reroute to
/// an error (e.g. method/policy rejection) before the backend is touched.
fn cnt_pass(ctx: &Ctx, sess: &mut Session) -> Step {
    let req = sess.req.as_ref().unwrap();
    let action = ctx.policy.current().pass(&recv_ctx(req));
    enforce_allowlist("pass", &action);
    match action {
        PolicyAction::Fetch => {
            sess.fetch_intent = FetchIntent::PassThrough;
            Step::Fetch
        },
        PolicyAction::Error { status, reason } => {
            synth_error(sess, status, reason);
            Step::Error
        },
        other => unreachable!("pass allowlist let through {other:?}"),
    }
}

/// PIPE: bypasses HTTP dissection entirely and splices bytes bidirectionally
/// (§4.1: "used for non-cacheable, non-HTTP-semantic traffic such as
/// WebSocket upgrades"). `policy.pipe` gets one veto before the splice.
async fn cnt_pipe(ctx: &Ctx, sess: &mut Session, conn: &mut HttpConn<TcpStream>) -> std::io::Result<()> {
    let req = sess.req.as_ref().unwrap();
    let action = ctx.policy.current().pipe(&recv_ctx(req));
    enforce_allowlist("pipe", &action);
    if let PolicyAction::Error { status, reason } = action {
        synth_error(sess, status, reason);
        return cnt_deliver(ctx, sess, conn).await;
    }

    let backend = ctx.director.pick();
    let upstream = match tokio::time::timeout(ctx.params.connect_timeout, backend.get()).await {
        Ok(Ok(s)) => s,
        _ => {
            synth_error(sess, 503, "backend unavailable for pipe");
            return cnt_deliver(ctx, sess, conn).await;
        },
    };
    let mut upstream = upstream;
    let client = conn.get_mut();
    match tokio::io::copy_bidirectional(client, &mut upstream).await {
        Ok(_) => {},
        Err(e) => warn!(error = %e, "pipe splice ended"),
    }
    sess.doclose = true;
    Ok(())
}

/// FETCH: issues the backend request head and decides the VFP plan from
/// the response's `Content-Encoding` and delivery policy (§4.5).
async fn cnt_fetch(ctx: &Ctx, sess: &mut Session) -> Step {
    let req = sess.req.as_ref().unwrap().clone();
    let backend = ctx.director.pick();
    let backend_req = fetch::prepare_backend_request(to_wire_request(&req), ctx.params.gzip_enabled);

    let head = fetch::fetch_head(
        backend,
        &backend_req,
        ctx.params.connect_timeout,
        ctx.params.first_byte_timeout,
        ctx.params.workspace_backend,
    )
    .await;

    match head {
        Ok((conn, fetched)) => {
            // §4.8 `fetch` hook: the policy gets one look at the backend's
            // response head before the body is drained/stored. `Deliver`
            // here means "accept this response and proceed" (the hook
            // reuses the action vocabulary rather than adding a
            // fetch-specific one, matching §4.8's closed action set).
            let action = ctx.policy.current().fetch(&recv_ctx(&req), &resp_obj_ctx(&fetched.response));
            enforce_allowlist("fetch", &action);
            match action {
                PolicyAction::Deliver => {
                    sess.fetch_conn = Some(conn);
                    sess.fetched_head = Some(fetched);
                    Step::FetchBody
                },
                PolicyAction::Error { status, reason } => {
                    release_busy(ctx, sess);
                    synth_error(sess, status, reason);
                    Step::Error
                },
                other => unreachable!("fetch allowlist let through {other:?}"),
            }
        },
        Err(e) => {
            warn!(error = %e, "backend fetch failed");
            let status = match &e {
                FetchError::Io(_) => 503,
                FetchError::Protocol(_) => 502,
                FetchError::StorageExhausted => 503,
            };
            release_busy(ctx, sess);
            synth_error(sess, status, e.to_string());
            Step::Error
        },
    }
}

fn to_wire_request(req: &ReqState) -> crate::http::Request {
    crate::http::Request {
        method: req.method,
        method_raw: Bytes::copy_from_slice(method_wire(req.method)),
        target: Bytes::copy_from_slice(&req.url),
        version: req.version,
        headers: req.headers.clone(),
    }
}

fn method_wire(m: Method) -> &'static [u8] {
    match m {
        Method::Get => b"GET",
        Method::Head => b"HEAD",
        Method::Post => b"POST",
        Method::Put => b"PUT",
        Method::Delete => b"DELETE",
        Method::Options => b"OPTIONS",
        Method::Other => b"GET",
    }
}

/// FETCHBODY: drains and stores the backend body, then installs the object
/// (cacheable path) or hands it straight to PrepResp uninstalled (pass).
async fn cnt_fetch_body(ctx: &Ctx, sess: &mut Session) -> Step {
    let Some(mut conn) = sess.fetch_conn.take() else { return Step::Error };
    let FetchedHead { response, framing } = sess.fetched_head.take().expect("FETCHBODY without a fetched head");

    let plan = choose_vfp_plan(&response.headers, ctx.params.gzip_enabled, ctx.params.gzip_level);
    let cacheable = sess.fetch_intent == FetchIntent::Cacheable && response.status == 200;

    let body = fetch::fetch_body(
        &mut conn,
        framing,
        plan,
        ctx.params.gzip_level,
        ctx.params.fetch_chunksize,
        &ctx.storage,
        &ctx.transient,
        ctx.params.shortlived,
        ctx.params.between_bytes_timeout,
        3,
        |oc_id| ctx.storage.nuke_one(|candidate| candidate == oc_id),
    )
    .await;

    let body = match body {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "fetch body failed");
            synth_error(sess, 502, e.to_string());
            return Step::Error;
        },
    };

    if framing != BodyFraming::Eof && !conn.has_pipelined_data() && !response.headers.get_logical("connection").map(|v| v.eq_ignore_ascii_case(b"close")).unwrap_or(false) {
        ctx.director.pick().recycle(conn.into_inner());
    }

    sess.resp = Some(response);
    sess.fetched_body = Some(body);

    if cacheable {
        install_fetched_object(ctx, sess);
    } else if let ObjTarget::Busy(oc_id) = sess.obj {
        ctx.cache.deref(oc_id, &ctx.storage.stevedore);
        sess.obj = ObjTarget::None;
    }

    Step::PrepResp
}

fn choose_vfp_plan(resp_headers: &HeaderTable, gzip_enabled: bool, gzip_level: u32) -> VfpPlan {
    let is_gzipped = resp_headers.get_logical("content-encoding").map(|v| v.eq_ignore_ascii_case(b"gzip")).unwrap_or(false);
    if !gzip_enabled {
        return if is_gzipped { VfpPlan::Gunzip } else { VfpPlan::Nop { stored_is_gzip: false } };
    }
    let is_html = resp_headers.get("content-type").map(|ct| ct.windows(4).any(|w| w.eq_ignore_ascii_case(b"html"))).unwrap_or(false);
    if is_html {
        return VfpPlan::Esi { input_gzipped: is_gzipped, output_gzip: Some(gzip_level) };
    }
    if is_gzipped {
        VfpPlan::Nop { stored_is_gzip: true }
    } else {
        VfpPlan::Gzip { level: gzip_level }
    }
}

fn install_fetched_object(ctx: &Ctx, sess: &mut Session) {
    let ObjTarget::Busy(oc_id) = sess.obj else { return };
    let response = sess.resp.as_ref().expect("install without a response head");
    let body = sess.fetched_body.take().expect("install without a fetched body");
    let now = Instant::now();

    let ttl = response
        .headers
        .get("cache-control")
        .and_then(|cc| parse_max_age(cc))
        .unwrap_or(std::time::Duration::from_secs(120));
    let ttl = if body.used_transient { ttl.min(ctx.params.shortlived) } else { ttl };

    let mut headers = response.headers.clone();
    headers.remove_all("content-encoding");
    if body.gzipped {
        headers.set("Content-Encoding", Bytes::from_static(b"gzip"));
    }

    let req = sess.req.as_ref().expect("install without the originating request");
    let object = Object {
        xid: sess.xid,
        objcore: oc_id,
        headers,
        header_storage: crate::storage::Storage { bytes: Vec::new() },
        body: body.chunks,
        ttl,
        grace: ctx.params.default_grace,
        entered: now,
        last_use: now,
        last_lru: now,
        vary: Vec::new(),
        esi: body.esi,
        hits: 0,
        ban_t: now,
        gzipped: body.gzipped,
        req_url: req.url.clone(),
        req_headers: req.headers.clone(),
    };

    let obj_id = ctx.cache.install_and_unbusy(oc_id, object, ctx.params.rush_exponent, |_tx| {});
    sess.obj = ObjTarget::Cached(oc_id, obj_id);
}

fn parse_max_age(cache_control: &[u8]) -> Option<std::time::Duration> {
    let text = std::str::from_utf8(cache_control).ok()?;
    for directive in text.split(',') {
        let directive = directive.trim();
        if let Some(n) = directive.strip_prefix("max-age=") {
            if let Ok(secs) = n.trim().parse::<u64>() {
                return Some(std::time::Duration::from_secs(secs));
            }
        }
    }
    None
}

/// PREPRESP: builds the outgoing response head from whichever object target
/// is live (cache hit, freshly installed, or pass-through uninstalled).
fn cnt_prep_resp(ctx: &Ctx, sess: &mut Session) -> Step {
    // §4.8 `deliver` hook: one last look before anything is written to the
    // client, for every delivery path (cache hit, freshly-installed fetch,
    // or uncached pass-through), per §4.1's PREPRESP purpose ("choose
    // delivery mode, run `vcl_deliver` policy").
    let action = match sess.obj {
        ObjTarget::Cached(oc_id, obj_id) => {
            let now = Instant::now();
            let req = sess.req.as_ref().unwrap();
            let a = ctx
                .cache
                .with_object(obj_id, |obj| ctx.policy.current().deliver(&recv_ctx(req), &obj_ctx(obj, now)))
                .unwrap_or(PolicyAction::Deliver);
            enforce_allowlist("deliver", &a);
            if let PolicyAction::Restart = a {
                ctx.cache.deref(oc_id, &ctx.storage.stevedore);
                sess.obj = ObjTarget::None;
            }
            a
        },
        ObjTarget::Busy(_) | ObjTarget::None => {
            let a = match sess.resp.as_ref() {
                Some(response) => ctx.policy.current().deliver(&recv_ctx(sess.req.as_ref().unwrap()), &resp_obj_ctx(response)),
                None => PolicyAction::Deliver,
            };
            enforce_allowlist("deliver", &a);
            if let PolicyAction::Restart = a {
                release_busy(ctx, sess);
            }
            a
        },
    };

    if let PolicyAction::Restart = action {
        sess.restarts += 1;
        if sess.restarts > ctx.params.max_restarts {
            synth_error(sess, 503, "too many restarts");
            return Step::Error;
        }
        return Step::Recv;
    }

    if let ObjTarget::Cached(_, obj_id) = sess.obj {
        let now = Instant::now();
        let req = sess.req.as_ref().unwrap();
        let plan = ctx
            .cache
            .with_object(obj_id, |obj| deliver::plan_delivery(obj, &req.headers, req.version, now))
            .expect("object vanished between HIT and PREPRESP");
        sess.deliver_plan = Some(plan);
    }
    Step::Deliver
}

/// DELIVER: writes the response to the client. For a cached object this
/// walks [`deliver::write_body`]/`deliver_esi`; for a fresh pass-through
/// fetch it streams the response head plus the already-buffered body
/// chunks (§4.1 PASS never installs into the cache, so there is nothing
/// more elaborate to plan here).
async fn cnt_deliver(ctx: &Ctx, sess: &mut Session, conn: &mut HttpConn<TcpStream>) -> std::io::Result<()> {
    match sess.obj {
        ObjTarget::Cached(_, obj_id) => {
            let plan = sess.deliver_plan.take().expect("DELIVER without a prepared plan");
            let req_version = sess.req.as_ref().unwrap().version;
            let headers =
                ctx.cache.with_object(obj_id, |obj| deliver::build_headers(obj, &plan, sess.xid)).unwrap_or_default();
            let response = Response { version: req_version, status: plan.status, reason: reason_for(plan.status), headers };
            let mut buf = BytesMut::new();
            response.write(&mut buf);
            conn.write_all(&buf).await?;

            let has_esi = ctx.cache.with_object(obj_id, |obj| obj.esi.is_some()).unwrap_or(false);
            if has_esi {
                let fragments = ctx.cache.with_object(obj_id, |obj| obj.esi.as_ref().unwrap().fragments.clone());
                if let Some(fragments) = fragments {
                    if sess.esi_level >= ctx.params.max_esi_includes {
                        warn!("esi include depth exceeded; serving remaining includes empty");
                    }
                    // resolved ahead of the write so each include's nested fetch
                    // (which needs `&mut sess` for push/pop_esi_include) runs to
                    // completion before deliver_esi's plain sync callback fires.
                    let mut resolved = Vec::new();
                    for fragment in &fragments {
                        if let EsiFragment::Include { url } = fragment {
                            resolved.push(resolve_esi_include(ctx, sess, url).await);
                        }
                    }
                    let mut resolved = resolved.into_iter();
                    deliver::deliver_esi(conn.get_mut(), &fragments, plan.chunked, |_url| resolved.next().unwrap_or_default())
                        .await?;
                }
            } else {
                let framed = ctx.cache.with_object(obj_id, |obj| deliver::prepare_body(obj, &plan)).unwrap_or_default();
                conn.write_all(&framed).await?;
            }

            ctx.cache.deref(obj_id_to_oc(sess), &ctx.storage.stevedore);
        },
        ObjTarget::Busy(oc_id) => {
            // pass-through: stream the response head plus the body chunks
            // gathered in FETCHBODY directly, never touching the cache.
            let response = sess.resp.take().expect("pass delivery without a response head");
            let mut buf = BytesMut::new();
            response.write(&mut buf);
            conn.write_all(&buf).await?;
            if let Some(body) = sess.fetched_body.take() {
                for chunk in body.chunks {
                    conn.write_all(&chunk.bytes).await?;
                }
            }
            ctx.cache.deref(oc_id, &ctx.storage.stevedore);
        },
        ObjTarget::None => {
            let response = sess.resp.take().unwrap_or_else(|| synth_response(500, "internal error"));
            let mut buf = BytesMut::new();
            response.write(&mut buf);
            conn.write_all(&buf).await?;
        },
    }
    sess.obj = ObjTarget::None;
    Ok(())
}

/// §4.5 ESI include: pushes the parent HTTP state, runs a direct backend GET
/// for the include's URL, pops back to the parent afterward. Past the depth
/// cap returns empty, matching a real re-entry that would also be turned
/// away at LOOKUP (`esi_nested` forces a miss-or-pass there).
async fn resolve_esi_include(ctx: &Ctx, sess: &mut Session, url: &Bytes) -> Vec<u8> {
    if sess.esi_level >= ctx.params.max_esi_includes {
        return Vec::new();
    }
    sess.push_esi_include(url.to_vec());
    let bytes = fetch_include_body(ctx, sess).await;
    sess.pop_esi_include();
    bytes
}

/// The include's own FETCH/FETCHBODY, minus the cache install: an include's
/// body is spliced into the parent response, never independently cached.
async fn fetch_include_body(ctx: &Ctx, sess: &Session) -> Vec<u8> {
    let req = sess.req.as_ref().expect("esi include requires a current request").clone();
    let backend = ctx.director.pick();
    let backend_req = fetch::prepare_backend_request(to_wire_request(&req), ctx.params.gzip_enabled);

    let head = fetch::fetch_head(
        backend,
        &backend_req,
        ctx.params.connect_timeout,
        ctx.params.first_byte_timeout,
        ctx.params.workspace_backend,
    )
    .await;

    let (mut conn, FetchedHead { response, framing }) = match head {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "esi include fetch failed");
            return Vec::new();
        },
    };
    if response.status != 200 {
        return Vec::new();
    }

    let is_gzipped =
        response.headers.get_logical("content-encoding").map(|v| v.eq_ignore_ascii_case(b"gzip")).unwrap_or(false);
    let plan = if is_gzipped { VfpPlan::Gunzip } else { VfpPlan::Nop { stored_is_gzip: false } };

    let body = fetch::fetch_body(
        &mut conn,
        framing,
        plan,
        ctx.params.gzip_level,
        ctx.params.fetch_chunksize,
        &ctx.storage,
        &ctx.transient,
        ctx.params.shortlived,
        ctx.params.between_bytes_timeout,
        3,
        |oc_id| ctx.storage.nuke_one(|candidate| candidate == oc_id),
    )
    .await;

    match body {
        Ok(b) => {
            if framing != BodyFraming::Eof
                && !conn.has_pipelined_data()
                && !response.headers.get_logical("connection").map(|v| v.eq_ignore_ascii_case(b"close")).unwrap_or(false)
            {
                ctx.director.pick().recycle(conn.into_inner());
            }
            let mut out = Vec::with_capacity(b.chunks.iter().map(|c| c.bytes.len()).sum());
            for chunk in &b.chunks {
                out.extend_from_slice(&chunk.bytes);
            }
            out
        },
        Err(e) => {
            warn!(error = %e, "esi include body fetch failed");
            Vec::new()
        },
    }
}

/// Resolves a BUSY objcore that will never be installed (a MISS that turned
/// into PASS, or a fetch that failed): unbusies it first so any waiters
/// parked on the objhead wake and retry, then derefs it away.
fn release_busy(ctx: &Ctx, sess: &mut Session) {
    if let ObjTarget::Busy(oc_id) = sess.obj {
        ctx.cache.unbusy(oc_id, ctx.params.rush_exponent, |_tx| {});
        ctx.cache.deref(oc_id, &ctx.storage.stevedore);
        sess.obj = ObjTarget::None;
    }
}

fn obj_id_to_oc(sess: &Session) -> crate::cache::ObjCoreId {
    match sess.obj {
        ObjTarget::Cached(oc_id, _) => oc_id,
        _ => unreachable!("obj_id_to_oc called without a cached target"),
    }
}

/// ERROR: lets `policy.error` render or override the synthesized response,
/// then falls through to DELIVER.
fn cnt_error(ctx: &Ctx, sess: &mut Session) -> Step {
    let req = sess.req.as_ref();
    let reason = sess.resp.as_ref().map(|r| String::from_utf8_lossy(&r.reason).into_owned()).unwrap_or_default();
    let status = sess.resp.as_ref().map(|r| r.status).unwrap_or(500);
    let err_ctx = ErrorCtx { status, reason: &reason };
    let empty_headers = HeaderTable::new();
    let recv = req.map(|r| recv_ctx(r)).unwrap_or(RecvCtx { method: Method::Get, url: b"", headers: &empty_headers });
    let action = ctx.policy.current().error(&recv, &err_ctx);
    enforce_allowlist("error", &action);
    match action {
        PolicyAction::Restart => {
            sess.restarts += 1;
            if sess.restarts > ctx.params.max_restarts {
                return Step::Deliver;
            }
            Step::Recv
        },
        _ => Step::Deliver,
    }
}

fn synth_response(status: u16, reason: &str) -> Response {
    let mut headers = HeaderTable::new();
    headers.set("Content-Length", Bytes::from("0"));
    Response { version: Version::Http11, status, reason: Bytes::copy_from_slice(reason.as_bytes()), headers }
}

fn synth_error(sess: &mut Session, status: u16, reason: impl Into<String>) {
    sess.resp = Some(synth_response(status, &reason.into()));
}
