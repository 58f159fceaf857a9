//! End-to-end scenarios against a real loopback backend and proxy: simple
//! hit, pass-through, range delivery, and request coalescing.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{make_ctx, FakeBackend, FakeResponse, ProxyHarness};

#[tokio::test]
async fn s1_simple_hit_caches_across_requests() {
    let backend = FakeBackend::start(|_path| FakeResponse::ok(*b"abc")).await;
    let ctx = make_ctx(backend.addr);
    let proxy = ProxyHarness::start(ctx).await;

    let first = proxy.request(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n").await;
    assert_eq!(first.status, 200);
    assert_eq!(first.body, b"abc");
    let first_xvarnish = first.header("x-varnish").expect("x-varnish present on first response").to_string();
    assert_eq!(first_xvarnish.split_whitespace().count(), 1, "a first fetch carries exactly one xid");

    let second = proxy.request(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n").await;
    assert_eq!(second.status, 200);
    assert_eq!(second.body, b"abc");
    let second_xvarnish = second.header("x-varnish").expect("x-varnish present on second response");
    assert_eq!(second_xvarnish.split_whitespace().count(), 2, "a hit carries the request's xid and the object's own");
    let age: u64 = second.header("age").expect("age present on a hit").parse().expect("age is numeric");
    let _ = age; // any non-negative value satisfies Age >= 0; u64 cannot be negative.

    assert_eq!(backend.connect_count(), 1, "the second request must be served from cache, not a fresh backend connect");
}

#[tokio::test]
async fn s2_pass_never_populates_the_cache() {
    let backend = FakeBackend::start(|_path| FakeResponse::ok(*b"uncacheable")).await;
    let ctx = make_ctx(backend.addr);
    let proxy = ProxyHarness::start(ctx).await;

    let req = b"GET /a HTTP/1.1\r\nHost: h\r\nCookie: foo=bar\r\n\r\n";
    let first = proxy.request(req).await;
    assert_eq!(first.body, b"uncacheable");
    let second = proxy.request(req).await;
    assert_eq!(second.body, b"uncacheable");

    // a pass never shares an objcore, so each request triggers its own
    // backend round trip even over a recycled connection.
    assert_eq!(backend.connect_count(), 1, "connections are pooled even though objects are not cached");
    assert!(first.header("x-varnish").is_none(), "a passed response was never installed, so it has no object xid");
}

#[tokio::test]
async fn s3_range_request_serves_the_requested_span() {
    let body: Vec<u8> = (0..100u8).collect();
    let backend = FakeBackend::start(move |_path| FakeResponse::ok(body.clone())).await;
    let ctx = make_ctx(backend.addr);
    let proxy = ProxyHarness::start(ctx).await;

    // warm the cache first so the range request is served from a HIT.
    let _ = proxy.request(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n").await;

    let ranged = proxy.request(b"GET /a HTTP/1.1\r\nHost: h\r\nRange: bytes=10-19\r\n\r\n").await;
    assert_eq!(ranged.status, 206);
    assert_eq!(ranged.header("content-range"), Some("bytes 10-19/100"));
    assert_eq!(ranged.header("content-length"), Some("10"));
    assert_eq!(ranged.body, (10u8..20).collect::<Vec<u8>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn s6_concurrent_requests_for_a_slow_url_coalesce_into_one_fetch() {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_handler = hits.clone();
    let backend = FakeBackend::start(move |_path| {
        hits_handler.fetch_add(1, Ordering::SeqCst);
        // a real blocking sleep, on its own OS thread under the
        // multi-threaded test runtime: long enough that every concurrent
        // request is guaranteed to have reached LOOKUP before this one
        // fetch completes and unbusies the shared objcore.
        std::thread::sleep(Duration::from_millis(200));
        FakeResponse::ok(*b"slow-body")
    })
    .await;
    let ctx = make_ctx(backend.addr);
    let proxy = Arc::new(ProxyHarness::start(ctx).await);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let proxy = proxy.clone();
        tasks.push(tokio::spawn(async move {
            proxy.request(b"GET /slow HTTP/1.1\r\nHost: h\r\n\r\n").await.body
        }));
    }

    for task in tasks {
        let body = task.await.unwrap();
        assert_eq!(body, b"slow-body");
    }

    assert_eq!(hits.load(Ordering::SeqCst), 1, "request coalescing must fold all N lookups into a single backend fetch");
    assert_eq!(backend.connect_count(), 1);
}
