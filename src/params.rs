use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Runtime-tunable parameters (§6), read (never written) by every hot-path
/// thread after startup. Built once from [`crate::bin::varnishd::args::Args`]
/// (see `src/bin/varnishd/args.rs`) and shared as `Arc<Params>`.
#[derive(Debug, Clone)]
pub struct Params {
    pub listen: IpAddr,
    pub port: u16,

    /// backend to fetch from on a miss.
    pub backend_addr: IpAddr,
    pub backend_port: u16,

    /// number of worker pools (§4.3); each owns its own queue and threads to
    /// reduce lock contention.
    pub pool_count: usize,
    /// minimum worker threads per pool, kept warm by the herder.
    pub thread_pool_min: usize,
    /// maximum aggregate worker threads across all pools.
    pub thread_pool_max: usize,
    /// queued sessions per pool before `Queue` reports "dropped".
    pub queue_max: usize,
    /// idle duration after which the herder retires a worker thread.
    pub thread_pool_timeout: Duration,
    /// herder tick interval.
    pub thread_pool_add_delay: Duration,

    /// per-session scratch workspace size (component A).
    pub workspace_session: usize,
    /// per-fetch (backend request/response + ESI) workspace size.
    pub workspace_backend: usize,

    /// cap on RECV restarts (§4.1) before forcing an error response.
    pub max_restarts: u32,
    /// cap on ESI inclusion nesting depth (§4.5).
    pub max_esi_includes: u32,

    /// bytes per storage chunk allocated during a fetch body.
    pub fetch_chunksize: usize,
    /// gzip compression level (1-9) used by the gzip VFP.
    pub gzip_level: u32,
    /// whether the proxy requests/accepts gzip from backends at all.
    pub gzip_enabled: bool,

    /// objects with effective TTL below this are redirected to Transient.
    pub shortlived: Duration,
    /// default grace window appended to an object's TTL (§8 property 7).
    pub default_grace: Duration,
    /// sessions re-homed to LRU MRU only if this much time elapsed since
    /// last touch, amortizing lock traffic (§4.6 `EXP_Touch`).
    pub lru_interval: Duration,
    /// number of waiting-list sessions woken per `Unbusy` rush (§4.2).
    pub rush_exponent: usize,

    /// connect/read/write timeouts to the backend (§5, §7).
    pub connect_timeout: Duration,
    pub first_byte_timeout: Duration,
    pub between_bytes_timeout: Duration,
    /// client-facing socket timeouts (SO_RCVTIMEO/SO_SNDTIMEO, §5).
    pub client_recv_timeout: Duration,
    pub client_send_timeout: Duration,
    /// how long a keep-alive connection may sit idle on the waiter (§4.1 WAIT).
    pub session_linger: Duration,

    /// malloc stevedore ceiling in bytes.
    pub storage_malloc_max: usize,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            listen: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 8080,
            backend_addr: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            backend_port: 8081,
            pool_count: 2,
            thread_pool_min: 5,
            thread_pool_max: 500,
            queue_max: 20,
            thread_pool_timeout: Duration::from_secs(300),
            thread_pool_add_delay: Duration::from_millis(20),
            workspace_session: 64 * 1024,
            workspace_backend: 256 * 1024,
            max_restarts: 4,
            max_esi_includes: 5,
            fetch_chunksize: 128 * 1024,
            gzip_level: 6,
            gzip_enabled: true,
            shortlived: Duration::from_secs(10),
            default_grace: Duration::from_secs(10),
            lru_interval: Duration::from_secs(2),
            rush_exponent: 3,
            connect_timeout: Duration::from_secs(5),
            first_byte_timeout: Duration::from_secs(60),
            between_bytes_timeout: Duration::from_secs(60),
            client_recv_timeout: Duration::from_secs(300),
            client_send_timeout: Duration::from_secs(600),
            session_linger: Duration::from_secs(5),
            storage_malloc_max: 256 * 1024 * 1024,
        }
    }
}
