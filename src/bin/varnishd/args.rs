use std::net::{IpAddr, Ipv4Addr};

use clap::Parser;

/// Runtime-tunable parameters (§6), parsed once at startup into an
/// immutable [`varnish_core_rs::params::Params`] and never touched again by
/// the hot path.
#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub struct Args {
    /// Address to listen for client connections on.
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)))]
    pub listen: IpAddr,
    /// Port to listen for client connections on.
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    /// Backend origin address to fetch misses from.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)))]
    pub backend_addr: IpAddr,
    /// Backend origin port.
    #[arg(long, default_value_t = 8081)]
    pub backend_port: u16,

    /// Number of independent worker pools (§4.3).
    #[arg(long, default_value_t = 2)]
    pub pool_count: usize,
    /// Minimum warm worker threads per pool.
    #[arg(long, default_value_t = 5)]
    pub thread_pool_min: usize,
    /// Maximum aggregate worker threads across all pools.
    #[arg(long, default_value_t = 500)]
    pub thread_pool_max: usize,
    /// Queued sessions per pool before `Queue` reports "dropped".
    #[arg(long, default_value_t = 20)]
    pub queue_max: usize,

    /// Per-session scratch workspace size, in bytes (component A).
    #[arg(long, default_value_t = 64 * 1024)]
    pub workspace_session: usize,
    /// Per-fetch (backend request/response + ESI) workspace size, in bytes.
    #[arg(long, default_value_t = 256 * 1024)]
    pub workspace_backend: usize,

    /// Cap on RECV restarts (§4.1) before a forced error response.
    #[arg(long, default_value_t = 4)]
    pub max_restarts: u32,
    /// Cap on ESI inclusion nesting depth (§4.5).
    #[arg(long, default_value_t = 5)]
    pub max_esi_includes: u32,

    /// Bytes per storage chunk allocated while a fetch body streams in.
    #[arg(long, default_value_t = 128 * 1024)]
    pub fetch_chunksize: usize,
    /// gzip compression level (1-9) used by the gzip VFP.
    #[arg(long, default_value_t = 6)]
    pub gzip_level: u32,
    /// Disables requesting/accepting gzip from backends entirely.
    #[arg(long, default_value_t)]
    pub no_gzip: bool,

    /// Objects whose effective TTL is below this many seconds are
    /// redirected to the Transient stevedore.
    #[arg(long, default_value_t = 10)]
    pub shortlived_secs: u64,
    /// Default grace window appended to an object's TTL, in seconds.
    #[arg(long, default_value_t = 10)]
    pub default_grace_secs: u64,
    /// Malloc stevedore ceiling in bytes.
    #[arg(long, default_value_t = 256 * 1024 * 1024)]
    pub storage_malloc_max: usize,
    /// Number of waiting-list sessions woken per `Unbusy` rush (§4.2).
    #[arg(long, default_value_t = 3)]
    pub rush_exponent: usize,

    /// Backend connect timeout, in seconds.
    #[arg(long, default_value_t = 5)]
    pub connect_timeout_secs: u64,
    /// Backend first-byte timeout, in seconds.
    #[arg(long, default_value_t = 60)]
    pub first_byte_timeout_secs: u64,
    /// Backend between-bytes timeout, in seconds.
    #[arg(long, default_value_t = 60)]
    pub between_bytes_timeout_secs: u64,
    /// How long a keep-alive connection may sit idle on the waiter.
    #[arg(long, default_value_t = 5)]
    pub session_linger_secs: u64,

    /// Enables human-friendly (non-JSON) trace-level logging.
    #[arg(short, long, default_value_t)]
    pub debug: bool,
}
