//! Scenario S4: a gzip'd backend body served verbatim to a gzip-aware
//! client and decompressed on the fly for one that sent no
//! `Accept-Encoding`.

mod common;

use std::io::Write as _;

use flate2::write::GzEncoder;
use flate2::Compression;

use common::{make_ctx, FakeBackend, FakeResponse, ProxyHarness};

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

#[tokio::test]
async fn s4_gunzip_on_send_for_a_client_without_accept_encoding() {
    let compressed = gzip(b"hello");
    let backend = FakeBackend::start(move |_path| {
        FakeResponse::ok(compressed.clone())
            .with_header("Content-Type", "text/plain")
            .with_header("Content-Encoding", "gzip")
    })
    .await;
    let ctx = make_ctx(backend.addr);
    let proxy = ProxyHarness::start(ctx).await;

    let response = proxy.request(b"GET /plain HTTP/1.1\r\nHost: h\r\n\r\n").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"hello");
    assert!(response.header("content-encoding").is_none(), "a gunzipped-on-send body carries no Content-Encoding");
    assert_eq!(response.header("transfer-encoding"), Some("chunked"), "length is unknown before decompression");
}

#[tokio::test]
async fn s4_gzip_aware_client_receives_the_compressed_body_verbatim() {
    let compressed = gzip(b"hello");
    let stored = compressed.clone();
    let backend = FakeBackend::start(move |_path| {
        FakeResponse::ok(stored.clone()).with_header("Content-Type", "text/plain").with_header("Content-Encoding", "gzip")
    })
    .await;
    let ctx = make_ctx(backend.addr);
    let proxy = ProxyHarness::start(ctx).await;

    let response =
        proxy.request(b"GET /plain HTTP/1.1\r\nHost: h\r\nAccept-Encoding: gzip\r\n\r\n").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-encoding"), Some("gzip"));
    assert_eq!(response.body, compressed);
}
