//! §6 "CLI surface": the management process itself is out of scope (§1),
//! but the admin command set it would issue is implemented here as a small
//! in-process command table. There is no `mgt_cli.c` in this tree (the
//! management process is out of scope, per §1); grounded directly on
//! spec.md §6's named command set and return-shape description instead.

use std::sync::Arc;
use std::time::Instant;

use crate::cache::ban::{BanOp, BanTest};
use crate::state::Ctx;

/// One CLI command's outcome: a CLI status code (200-class success, 400/500
/// otherwise, matching the varnish CLI's own convention) and response text.
pub type CliReply = (u32, String);

/// Dispatches one command line (already split on whitespace, as the real
/// CLI protocol's argv-like framing would have done) against the core's
/// command table.
pub fn dispatch(ctx: &Arc<Ctx>, argv: &[&str]) -> CliReply {
    let Some((&name, args)) = argv.split_first() else {
        return (100, String::new());
    };
    match name {
        "start" => (200, "already running".into()),
        "storage.list" => storage_list(ctx),
        "debug.xid" => debug_xid(ctx, args),
        "debug.srandom" => debug_srandom(ctx, args),
        "debug.fragfetch" => debug_fragfetch(ctx, args),
        "debug.listen_address" => debug_listen_address(ctx),
        "hcb.dump" => hcb_dump(ctx),
        "ban" => ban(ctx, args),
        "ban.list" => ban_list(ctx),
        _ => (500, format!("unknown command {name:?}")),
    }
}

fn storage_list(ctx: &Ctx) -> CliReply {
    let name = ctx.storage.stevedore.name();
    let bytes_used = ctx.storage.stevedore.bytes_used();
    let transient_used = ctx.transient.bytes_used();
    (200, format!("{name}: {bytes_used} bytes used\nTransient: {transient_used} bytes used\n"))
}

fn debug_xid(ctx: &Ctx, args: &[&str]) -> CliReply {
    match args.first() {
        None => (200, ctx.debug.peek_xid().to_string()),
        Some(raw) => match raw.parse::<u64>() {
            Ok(v) => {
                ctx.debug.set_xid(v);
                (200, format!("XID is {v}"))
            },
            Err(_) => (104, "invalid xid".into()),
        },
    }
}

fn debug_srandom(ctx: &Ctx, args: &[&str]) -> CliReply {
    let seed = args.first().and_then(|s| s.parse::<u64>().ok()).unwrap_or(42);
    ctx.debug.reseed(seed);
    (200, format!("Random(3) seeded with {seed}"))
}

fn debug_fragfetch(ctx: &Ctx, args: &[&str]) -> CliReply {
    match args.first() {
        None => (200, ctx.debug.fragfetch().to_string()),
        Some(raw) => match raw.parse::<usize>() {
            Ok(v) => {
                ctx.debug.set_fragfetch(v);
                (200, format!("fragfetch set to {v}"))
            },
            Err(_) => (104, "invalid byte count".into()),
        },
    }
}

fn debug_listen_address(ctx: &Ctx) -> CliReply {
    (200, format!("{}:{}", ctx.params.listen, ctx.params.port))
}

fn hcb_dump(ctx: &Ctx) -> CliReply {
    let (objheads, objcores, objects) = ctx.cache.hcb_counts();
    (200, format!("objheads {objheads}\nobjcores {objcores}\nobjects {objects}\n"))
}

/// `ban <field> <op> <value>`, e.g. `ban req.url == /foo/bar`. The ban-lang
/// parser/compiler itself is out of scope (§1); this accepts a single
/// already-tokenized predicate rather than arbitrary ban-lang text.
fn ban(ctx: &Ctx, args: &[&str]) -> CliReply {
    let [field, op, value] = args else {
        return (104, "usage: ban <field> <==|!=|~|!~> <value>".into());
    };
    let op = match *op {
        "==" => BanOp::Equal,
        "!=" => BanOp::NotEqual,
        "~" => BanOp::Match,
        "!~" => BanOp::NotMatch,
        other => return (104, format!("unknown ban operator {other:?}")),
    };
    if matches!(op, BanOp::Match | BanOp::NotMatch) {
        if let Err(e) = regex::bytes::Regex::new(value) {
            return (104, format!("invalid regex: {e}"));
        }
    }
    let test = BanTest { field: field.to_string(), op, value: value.to_string() };
    let (id, _created) = ctx.cache.bans.add(test, Instant::now());
    (200, format!("ban {id:?} added"))
}

fn ban_list(ctx: &Ctx) -> CliReply {
    (200, format!("{} active bans\n", ctx.cache.bans.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, Director};
    use crate::cache::Cache;
    use crate::debug::DebugState;
    use crate::params::Params;
    use crate::policy::{DefaultPolicy, PolicySet};
    use crate::stats::GlobalStats;
    use crate::storage::{malloc::MallocStevedore, transient::TransientStevedore, ManagedStevedore, Stevedore};

    fn test_ctx() -> Arc<Ctx> {
        let params = Params::default();
        Arc::new(Ctx {
            cache: Arc::new(Cache::new()),
            policy: Arc::new(PolicySet::new(Arc::new(DefaultPolicy { gzip_enabled: true }))),
            director: Arc::new(Director::new(Backend::new(
                std::net::SocketAddr::new(params.backend_addr, params.backend_port),
                params.connect_timeout,
                4,
            ))),
            storage: Arc::new(ManagedStevedore::new(Stevedore::Malloc(MallocStevedore::new(params.storage_malloc_max)))),
            transient: Arc::new(Stevedore::Transient(TransientStevedore::new())),
            stats: Arc::new(GlobalStats::new()),
            debug: Arc::new(DebugState::new()),
            params: Arc::new(params),
        })
    }

    #[test]
    fn debug_xid_gets_and_sets() {
        let ctx = test_ctx();
        ctx.debug.set_xid(12345);
        assert_eq!(dispatch(&ctx, &["debug.xid"]), (200, "12345".into()));
        dispatch(&ctx, &["debug.xid", "777"]);
        assert_eq!(dispatch(&ctx, &["debug.xid"]), (200, "777".into()));
    }

    #[test]
    fn hcb_dump_reports_zero_on_an_empty_cache() {
        let ctx = test_ctx();
        assert_eq!(dispatch(&ctx, &["hcb.dump"]), (200, "objheads 0\nobjcores 0\nobjects 0\n".into()));
    }

    #[test]
    fn unknown_command_is_rejected() {
        let ctx = test_ctx();
        let (status, _) = dispatch(&ctx, &["no.such.command"]);
        assert_eq!(status, 500);
    }

    #[test]
    fn storage_list_reports_the_configured_stevedore_name() {
        let ctx = test_ctx();
        let (status, text) = dispatch(&ctx, &["storage.list"]);
        assert_eq!(status, 200);
        assert!(text.contains("malloc"));
    }

    #[test]
    fn ban_adds_a_predicate_and_is_reflected_in_ban_list() {
        let ctx = test_ctx();
        assert_eq!(dispatch(&ctx, &["ban.list"]), (200, "0 active bans\n".into()));
        let (status, _) = dispatch(&ctx, &["ban", "req.url", "==", "/foo"]);
        assert_eq!(status, 200);
        assert_eq!(dispatch(&ctx, &["ban.list"]), (200, "1 active bans\n".into()));
    }

    #[test]
    fn ban_rejects_bad_operator_and_wrong_arity() {
        let ctx = test_ctx();
        assert_eq!(dispatch(&ctx, &["ban", "req.url", "==", "/foo", "extra"]).0, 104);
        assert_eq!(dispatch(&ctx, &["ban", "req.url", "nope", "/foo"]).0, 104);
        assert_eq!(dispatch(&ctx, &["ban", "req.url", "~", "("]).0, 104);
    }
}
