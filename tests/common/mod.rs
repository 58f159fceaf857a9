//! Shared scaffolding for the end-to-end scenarios: a canned fake backend
//! speaking plain HTTP/1.1 over a real loopback socket, a proxy harness that
//! drives `varnish_core_rs::state::drive_connection` against it, and a
//! minimal HTTP/1.1 response reader for the test client side. Everything
//! here talks real TCP — no mocked traits — so these tests exercise the
//! same code paths `src/bin/varnishd/main.rs` does.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use varnish_core_rs::backend::{Backend, Director};
use varnish_core_rs::cache::Cache;
use varnish_core_rs::debug::DebugState;
use varnish_core_rs::http::HttpConn;
use varnish_core_rs::params::Params;
use varnish_core_rs::policy::{DefaultPolicy, PolicySet};
use varnish_core_rs::state::{self, Ctx};
use varnish_core_rs::stats::GlobalStats;
use varnish_core_rs::storage::malloc::MallocStevedore;
use varnish_core_rs::storage::transient::TransientStevedore;
use varnish_core_rs::storage::{ManagedStevedore, Stevedore};

pub fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
}

/// A response a [`FakeBackend`] handler hands back for one request.
pub struct FakeResponse {
    pub status: u16,
    pub reason: &'static str,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl FakeResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        let body = body.into();
        let headers = vec![("Content-Length".to_string(), body.len().to_string())];
        Self { status: 200, reason: "OK", headers, body }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

type Handler = Arc<dyn Fn(&str) -> FakeResponse + Send + Sync>;

/// A tiny origin server: accepts loopback connections, parses just enough of
/// the request line to dispatch by path, and replies through a
/// caller-supplied handler. Keeps each connection open across requests so
/// the proxy's backend connection pool (component R) gets exercised.
pub struct FakeBackend {
    pub addr: SocketAddr,
    connects: Arc<AtomicUsize>,
}

impl FakeBackend {
    pub async fn start(handler: impl Fn(&str) -> FakeResponse + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake backend");
        let addr = listener.local_addr().unwrap();
        let connects = Arc::new(AtomicUsize::new(0));
        let handler: Handler = Arc::new(handler);
        let connects_task = connects.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _peer)) = listener.accept().await else { return };
                connects_task.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_one_connection(stream, handler.clone()));
            }
        });
        Self { addr, connects }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

async fn serve_one_connection(mut stream: TcpStream, handler: Handler) {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        let head_end = match read_until(&mut stream, &mut buf, b"\r\n\r\n").await {
            Some(pos) => pos,
            None => return,
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let path = request_line.split_whitespace().nth(1).unwrap_or("/").to_string();
        let content_length: usize = lines
            .find_map(|l| {
                let (name, value) = l.split_once(':')?;
                if name.eq_ignore_ascii_case("content-length") {
                    value.trim().parse().ok()
                } else {
                    None
                }
            })
            .unwrap_or(0);
        buf.drain(..head_end + 4);

        while buf.len() < content_length {
            let mut tmp = [0u8; 4096];
            match stream.read(&mut tmp).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&tmp[..n]),
            }
        }
        buf.drain(..content_length);

        let response = handler(&path);
        let mut out = format!("HTTP/1.1 {} {}\r\n", response.status, response.reason).into_bytes();
        for (name, value) in &response.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&response.body);
        if stream.write_all(&out).await.is_err() {
            return;
        }
    }
}

async fn read_until(stream: &mut TcpStream, buf: &mut Vec<u8>, needle: &[u8]) -> Option<usize> {
    loop {
        if let Some(pos) = find_subsequence(buf, needle) {
            return Some(pos);
        }
        let mut tmp = [0u8; 4096];
        match stream.read(&mut tmp).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
        }
    }
}

/// Builds a [`Ctx`] wired to `backend_addr`, otherwise matching
/// [`Params::default`]. One `Ctx` per test keeps the object cache isolated.
pub fn make_ctx(backend_addr: SocketAddr) -> Arc<Ctx> {
    make_ctx_with(backend_addr, |_| {})
}

/// Like [`make_ctx`], but lets the caller tweak [`Params`] first (e.g. to
/// shrink `max_esi_includes` for a depth-cap test).
pub fn make_ctx_with(backend_addr: SocketAddr, customize: impl FnOnce(&mut Params)) -> Arc<Ctx> {
    let mut params =
        Params { backend_addr: backend_addr.ip(), backend_port: backend_addr.port(), ..Params::default() };
    customize(&mut params);
    Arc::new(Ctx {
        cache: Arc::new(Cache::new()),
        policy: Arc::new(PolicySet::new(Arc::new(DefaultPolicy { gzip_enabled: params.gzip_enabled }))),
        director: Arc::new(Director::new(Backend::new(backend_addr, params.connect_timeout, 16))),
        storage: Arc::new(ManagedStevedore::new(Stevedore::Malloc(MallocStevedore::new(params.storage_malloc_max)))),
        transient: Arc::new(Stevedore::Transient(TransientStevedore::new())),
        stats: Arc::new(GlobalStats::new()),
        debug: Arc::new(DebugState::new()),
        params: Arc::new(params),
    })
}

/// A proxy frontend listening on loopback and driving every accepted
/// connection through `state::drive_connection`, exactly as
/// `src/bin/varnishd/main.rs`'s `queue_connection` does (minus the worker
/// pool, which is orthogonal to the state machine itself).
pub struct ProxyHarness {
    pub addr: SocketAddr,
}

impl ProxyHarness {
    pub async fn start(ctx: Arc<Ctx>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy frontend");
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else { return };
                let ctx = ctx.clone();
                let xid = ctx.debug.take_xid();
                tokio::spawn(async move {
                    let mut conn = HttpConn::new(stream, ctx.params.workspace_session);
                    let _ = state::drive_connection(&ctx, &mut conn, peer, xid).await;
                });
            }
        });
        Self { addr }
    }

    /// Opens a fresh connection, writes `raw` verbatim, and reads back one
    /// full HTTP/1.1 response.
    pub async fn request(&self, raw: &[u8]) -> RawResponse {
        let mut stream = TcpStream::connect(self.addr).await.expect("connect to proxy");
        stream.write_all(raw).await.expect("write request");
        read_http_response(&mut stream).await
    }
}

pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

async fn read_http_response(stream: &mut TcpStream) -> RawResponse {
    let mut buf: Vec<u8> = Vec::new();
    let head_end = read_until(stream, &mut buf, b"\r\n\r\n").await.expect("response head before eof");
    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let status: u16 = status_line.split_whitespace().nth(1).and_then(|s| s.parse().ok()).unwrap_or(0);
    let mut headers = Vec::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    let mut rest = buf[head_end + 4..].to_vec();

    let chunked = find_header(&headers, "transfer-encoding").map(|v| v.eq_ignore_ascii_case("chunked")).unwrap_or(false);
    let content_length = find_header(&headers, "content-length").and_then(|v| v.parse::<usize>().ok());

    let body = if chunked {
        read_chunked_body(stream, rest).await
    } else if let Some(len) = content_length {
        while rest.len() < len {
            let mut tmp = [0u8; 4096];
            match stream.read(&mut tmp).await {
                Ok(0) | Err(_) => break,
                Ok(n) => rest.extend_from_slice(&tmp[..n]),
            }
        }
        rest.truncate(len);
        rest
    } else {
        loop {
            let mut tmp = [0u8; 4096];
            match stream.read(&mut tmp).await {
                Ok(0) | Err(_) => break,
                Ok(n) => rest.extend_from_slice(&tmp[..n]),
            }
        }
        rest
    };

    RawResponse { status, headers, body }
}

async fn read_chunked_body(stream: &mut TcpStream, mut buf: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let line_end = read_until(stream, &mut buf, b"\r\n").await.expect("chunk size line before eof");
        let size_line = String::from_utf8_lossy(&buf[..line_end]).into_owned();
        let size = usize::from_str_radix(size_line.trim(), 16).expect("valid chunk size");
        buf.drain(..line_end + 2);
        if size == 0 {
            break;
        }
        while buf.len() < size + 2 {
            let mut tmp = [0u8; 4096];
            match stream.read(&mut tmp).await {
                Ok(0) | Err(_) => panic!("eof mid chunk body"),
                Ok(n) => buf.extend_from_slice(&tmp[..n]),
            }
        }
        out.extend_from_slice(&buf[..size]);
        buf.drain(..size + 2);
    }
    out
}
