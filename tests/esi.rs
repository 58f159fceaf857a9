//! Scenario S5: an HTML response with an `<esi:include>` is expanded against
//! a second backend fetch for the include's own URL.

mod common;

use common::{make_ctx, make_ctx_with, FakeBackend, FakeResponse, ProxyHarness};

fn parent_body() -> FakeResponse {
    FakeResponse::ok(*b"A<esi:include src=\"/child\"/>B").with_header("Content-Type", "text/html")
}

#[tokio::test]
async fn s5_esi_include_is_expanded_with_the_child_fetch() {
    let backend = FakeBackend::start(|path| match path {
        "/child" => FakeResponse::ok(*b"X").with_header("Content-Type", "text/plain"),
        _ => parent_body(),
    })
    .await;
    let ctx = make_ctx(backend.addr);
    let proxy = ProxyHarness::start(ctx).await;

    let response = proxy.request(b"GET /parent HTTP/1.1\r\nHost: h\r\n\r\n").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"AXB");
    assert_eq!(response.header("transfer-encoding"), Some("chunked"), "an ESI object's length isn't known up front");
    assert_eq!(backend.connect_count(), 1, "the include's fetch reuses the parent's recycled backend connection");
}

#[tokio::test]
async fn s5_include_past_the_depth_cap_renders_empty() {
    let backend = FakeBackend::start(|path| match path {
        "/child" => FakeResponse::ok(*b"X").with_header("Content-Type", "text/plain"),
        _ => parent_body(),
    })
    .await;
    let ctx = make_ctx_with(backend.addr, |p| p.max_esi_includes = 0);
    let proxy = ProxyHarness::start(ctx).await;

    let response = proxy.request(b"GET /parent HTTP/1.1\r\nHost: h\r\n\r\n").await;
    assert_eq!(response.body, b"AB", "past the depth cap an include contributes no bytes");
    assert_eq!(backend.connect_count(), 1, "the child is never fetched once the cap is already reached");
}
