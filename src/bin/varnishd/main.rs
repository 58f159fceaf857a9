mod args;

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};

use varnish_core_rs::backend::{Backend, Director};
use varnish_core_rs::cache::Cache;
use varnish_core_rs::debug::DebugState;
use varnish_core_rs::http::HttpConn;
use varnish_core_rs::params::Params;
use varnish_core_rs::policy::{DefaultPolicy, PolicySet};
use varnish_core_rs::state::{self, Ctx};
use varnish_core_rs::stats::GlobalStats;
use varnish_core_rs::storage::{malloc::MallocStevedore, transient::TransientStevedore, ManagedStevedore, Stevedore};
use varnish_core_rs::worker::{waiter, WorkerPool};

use crate::args::Args;

fn params_from_args(args: &Args) -> Params {
    Params {
        listen: args.listen,
        port: args.port,
        backend_addr: args.backend_addr,
        backend_port: args.backend_port,
        pool_count: args.pool_count,
        thread_pool_min: args.thread_pool_min,
        thread_pool_max: args.thread_pool_max,
        queue_max: args.queue_max,
        thread_pool_timeout: Duration::from_secs(300),
        thread_pool_add_delay: Duration::from_millis(20),
        workspace_session: args.workspace_session,
        workspace_backend: args.workspace_backend,
        max_restarts: args.max_restarts,
        max_esi_includes: args.max_esi_includes,
        fetch_chunksize: args.fetch_chunksize,
        gzip_level: args.gzip_level,
        gzip_enabled: !args.no_gzip,
        shortlived: Duration::from_secs(args.shortlived_secs),
        default_grace: Duration::from_secs(args.default_grace_secs),
        lru_interval: Duration::from_secs(2),
        rush_exponent: args.rush_exponent,
        connect_timeout: Duration::from_secs(args.connect_timeout_secs),
        first_byte_timeout: Duration::from_secs(args.first_byte_timeout_secs),
        between_bytes_timeout: Duration::from_secs(args.between_bytes_timeout_secs),
        client_recv_timeout: Duration::from_secs(300),
        client_send_timeout: Duration::from_secs(600),
        session_linger: Duration::from_secs(args.session_linger_secs),
        storage_malloc_max: args.storage_malloc_max,
    }
}

fn build_ctx(params: Params) -> Arc<Ctx> {
    let backend_addr = SocketAddr::new(params.backend_addr, params.backend_port);
    Arc::new(Ctx {
        cache: Arc::new(Cache::new()),
        policy: Arc::new(PolicySet::new(Arc::new(DefaultPolicy { gzip_enabled: params.gzip_enabled }))),
        director: Arc::new(Director::new(Backend::new(backend_addr, params.connect_timeout, params.pool_count * params.thread_pool_max))),
        storage: Arc::new(ManagedStevedore::new(Stevedore::Malloc(MallocStevedore::new(params.storage_malloc_max)))),
        transient: Arc::new(Stevedore::Transient(TransientStevedore::new())),
        stats: Arc::new(GlobalStats::new()),
        debug: Arc::new(DebugState::new()),
        params: Arc::new(params),
    })
}

/// §4.6: a single background thread sleeping until the expiry binheap's
/// root key, then dereferencing every objcore whose TTL+grace has passed.
fn spawn_expiry_thread(ctx: Arc<Ctx>, cancel: CancellationToken) {
    tokio::spawn(async move {
        loop {
            let now = std::time::Instant::now();
            let sleep_until = ctx.cache.expiry.peek_key();
            let sleep_for = match sleep_until {
                Some(at) if at > now => at - now,
                Some(_) => Duration::ZERO,
                None => Duration::from_secs(1),
            };
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {},
                _ = cancel.cancelled() => return,
            }
            let now = std::time::Instant::now();
            let mut expired = Vec::new();
            ctx.cache.expiry.pop_expired(now, |oc| expired.push(oc));
            for oc in expired {
                debug!(?oc, "expiry thread reaping objcore past ttl+grace");
                ctx.cache.deref(oc, &ctx.storage.stevedore);
            }
        }
    });
}

/// §4.7: retires bans whose refcount has reached zero from the tail of the
/// append-only list.
fn spawn_ban_retirement_thread(ctx: Arc<Ctx>, cancel: CancellationToken) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {},
                _ = cancel.cancelled() => return,
            }
            let retired = ctx.cache.bans.retire();
            if retired > 0 {
                debug!(retired, "retired fully-dereferenced bans");
            }
        }
    });
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.debug {
        tracing_subscriber::fmt().with_max_level(Level::TRACE).init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    let params = params_from_args(&args);
    let listen_addr = (params.listen, params.port);
    let ctx = build_ctx(params);

    let listener = match tokio::net::TcpListener::bind(listen_addr).await {
        Ok(l) => l,
        Err(error) => {
            error!(%error, "failed to listen for client connections");
            return ExitCode::from(111);
        },
    };
    info!(addr = %listener.local_addr().unwrap(), "listening");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    let pool = WorkerPool::new(&ctx.params, ctx.stats.clone());
    pool.spawn_herder();
    pool.spawn_herdtimer(Duration::from_secs(1));

    spawn_expiry_thread(ctx.clone(), cancel.clone());
    spawn_ban_retirement_thread(ctx.clone(), cancel.clone());

    // Keep-alive readiness between requests on the same connection is
    // handled inline by `state::drive_connection`'s own read loop (it holds
    // its worker thread for the connection's lifetime rather than parking
    // on `worker::waiter`, a deliberate simplification recorded in
    // DESIGN.md); `worker::waiter`'s acceptor half is still the real L
    // component driving new connections in below.
    let accept_ctx = ctx.clone();
    let accept_pool = pool.clone();
    let accept_cancel = cancel.clone();
    let accept_result = waiter::accept_loop(listener, accept_cancel, move |stream, peer| {
        queue_connection(&accept_ctx, &accept_pool, stream, peer);
    })
    .await;

    match accept_result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "accept loop terminated with an error");
            ExitCode::FAILURE
        },
    }
}

/// Hands a freshly accepted connection to the worker
/// pool (§4.3 `Queue`). The job itself runs on a `spawn_blocking` thread
/// (component K, SPEC_FULL §4.3a) and drives the connection to completion
/// via `Handle::block_on`, matching §5's "one thread per in-flight session".
fn queue_connection(ctx: &Arc<Ctx>, pool: &Arc<WorkerPool>, stream: tokio::net::TcpStream, peer: SocketAddr) {
    let ctx = ctx.clone();
    let xid = ctx.debug.take_xid();
    let handle = tokio::runtime::Handle::current();
    let job: varnish_core_rs::worker::Job = Box::new(move |_worker| {
        let mut conn = HttpConn::new(stream, ctx.params.workspace_session);
        let result = handle.block_on(state::drive_connection(&ctx, &mut conn, peer, xid));
        if let Err(error) = result {
            debug!(%error, "session ended with an i/o error");
        }
    });
    if pool.queue(job).is_err() {
        debug!("worker pool at capacity; connection dropped (sess_dropped_late)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_from_args_carries_listen_port_through() {
        let args = Args::parse_from(["varnishd", "--listen", "127.0.0.1", "--port", "9000"]);
        let params = params_from_args(&args);
        assert_eq!(params.port, 9000);
        assert_eq!(params.listen.to_string(), "127.0.0.1");
    }

    #[test]
    fn no_gzip_flag_disables_gzip() {
        let args = Args::parse_from(["varnishd", "--no-gzip"]);
        let params = params_from_args(&args);
        assert!(!params.gzip_enabled);
    }
}
