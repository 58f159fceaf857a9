//! Component R: the backend director and connection pool.
//!
//! Neither `cache_backend.c` nor `cache_director.c` exist in this tree;
//! grounded instead on `bin/varnishd/cache_fetch.c`'s `VDI_GetFd`/
//! `VDI_CloseFd`/`VDI_RecycleFd` call sites, the connection-checkout/
//! recycle protocol a director ultimately bottoms out on. §1 scopes out the
//! full director language (round-robin/random/hash directors are
//! config-language constructs); this core exposes the single-backend case
//! directly and a connection pool per backend.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::lock::{Lock, LockRank};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Sick,
}

struct PooledConn {
    stream: TcpStream,
    last_used: Instant,
}

struct Inner {
    idle: VecDeque<PooledConn>,
    health: Health,
}

/// One backend's connection pool (§4.3's "recycle connections" and §5's
/// "Backend connections are pooled per-backend and recycled on clean
/// completion").
pub struct Backend {
    pub addr: SocketAddr,
    inner: Lock<Inner>,
    connect_timeout: Duration,
    max_idle: usize,
}

impl Backend {
    pub fn new(addr: SocketAddr, connect_timeout: Duration, max_idle: usize) -> Self {
        Self {
            addr,
            inner: Lock::new(Inner { idle: VecDeque::new(), health: Health::Healthy }, LockRank::Stevedore),
            connect_timeout,
            max_idle,
        }
    }

    pub fn health(&self) -> Health {
        self.inner.lock().health
    }

    pub fn mark_sick(&self) {
        self.inner.lock().health = Health::Sick;
    }

    pub fn mark_healthy(&self) {
        self.inner.lock().health = Health::Healthy;
    }

    /// Takes a pooled connection if one is idle, else dials a fresh one
    /// within `connect_timeout` (§5, §7: connect timeout -> backend I/O
    /// error -> 503).
    pub async fn get(&self) -> std::io::Result<TcpStream> {
        if let Some(pooled) = self.inner.lock().idle.pop_front() {
            debug!(addr = %self.addr, "reusing pooled backend connection");
            return Ok(pooled.stream);
        }
        let stream = timeout(self.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "backend connect_timeout"))??;
        let _ = stream.set_nodelay(true);
        self.mark_healthy();
        Ok(stream)
    }

    /// Returns a connection to the pool after a clean response completion.
    /// A connection that experienced any error is simply dropped by the
    /// caller instead of calling this.
    pub fn recycle(&self, stream: TcpStream) {
        let mut inner = self.inner.lock();
        if inner.idle.len() < self.max_idle {
            inner.idle.push_back(PooledConn { stream, last_used: Instant::now() });
        }
    }

    pub fn idle_count(&self) -> usize {
        self.inner.lock().idle.len()
    }
}

/// The director: picks a backend for a request. §1 scopes the
/// multi-backend director language out; this is the single-backend
/// director every richer policy would delegate to.
pub struct Director {
    backend: Backend,
}

impl Director {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    pub fn pick(&self) -> &Backend {
        &self.backend
    }

    pub fn is_healthy(&self) -> bool {
        self.backend.health() == Health::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_timeout_surfaces_as_io_error() {
        // 192.0.2.0/24 is TEST-NET-1 (RFC 5737): guaranteed unroutable, so
        // the connect attempt stalls until our timeout fires rather than
        // racing a real network path.
        let backend = Backend::new("192.0.2.1:81".parse().unwrap(), Duration::from_millis(50), 4);
        let err = backend.get().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }

    #[test]
    fn health_defaults_healthy_and_can_be_marked_sick() {
        let backend = Backend::new("127.0.0.1:1".parse().unwrap(), Duration::from_secs(1), 4);
        assert_eq!(backend.health(), Health::Healthy);
        backend.mark_sick();
        assert_eq!(backend.health(), Health::Sick);
    }
}
