//! Component P: the response assembler — §6's Range/conditional/chunked
//! requirements and §4.5's ESI delivery walk.
//!
//! Neither `cache_deliver_proc.c` nor `cache_range.c` exist in this tree;
//! grounded instead on `bin/varnishd/cache_response.c`, which folds the
//! VDP/range/deliver logic together here, realized
//! here as a plan-then-write pair (`plan_delivery` decides once, then
//! `write_body` drains storage chunks through it) rather than a chained
//! VDP pipeline, mirroring the VFP-as-struct-not-chain choice already made
//! in [`crate::fetch::vfp`].

use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::cache::Object;
use crate::fetch::esi::EsiFragment;
use crate::http::{HeaderTable, Version};

/// Parses a single-range `bytes=a-b` / `bytes=a-` / `bytes=-n` request
/// header against a known total length. Multi-range requests are not
/// supported (§1 scopes HTTP/2+ framing out generally; multi-range responses
/// are a `multipart/byteranges` extension this core does not implement)
/// — callers fall back to a full 200 response for those.
pub fn parse_range(value: &[u8], total_len: u64) -> Option<(u64, u64)> {
    let value = value.strip_prefix(b"bytes=")?;
    if value.contains(&b',') {
        return None;
    }
    let mut parts = value.splitn(2, |&b| b == b'-');
    let start_str = parts.next()?;
    let end_str = parts.next()?;
    if start_str.is_empty() {
        let suffix_len: u64 = std::str::from_utf8(end_str).ok()?.parse().ok()?;
        if suffix_len == 0 || total_len == 0 {
            return None;
        }
        let suffix_len = suffix_len.min(total_len);
        return Some((total_len - suffix_len, total_len - 1));
    }
    let start: u64 = std::str::from_utf8(start_str).ok()?.parse().ok()?;
    let end: u64 = if end_str.is_empty() {
        total_len.checked_sub(1)?
    } else {
        std::str::from_utf8(end_str).ok()?.parse().ok()?
    };
    if start > end || end >= total_len {
        return None;
    }
    Some((start, end))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyPlan {
    Full,
    Range { start: u64, end: u64 },
    NotModified,
}

pub struct DeliverPlan {
    pub status: u16,
    pub body: BodyPlan,
    pub gunzip_on_send: bool,
    pub chunked: bool,
    pub age_secs: u64,
}

/// Decides how to serve a stored object (§6, §8 properties 3/5): honors
/// conditional headers first, then Range (only against a known-length,
/// non-ESI, non-gunzip-on-the-fly body), else a full body, gunzipped on the
/// fly for clients lacking `Accept-Encoding: gzip` and ESI-expanded objects
/// whose length is not knowable up front.
pub fn plan_delivery(object: &Object, req_headers: &HeaderTable, req_version: Version, now: Instant) -> DeliverPlan {
    let age_secs = now.saturating_duration_since(object.entered).as_secs();

    if is_not_modified(object, req_headers) {
        return DeliverPlan { status: 304, body: BodyPlan::NotModified, gunzip_on_send: false, chunked: false, age_secs };
    }

    let needs_esi = object.esi.is_some();
    let gunzip_on_send = object.gzipped && !client_accepts_gzip(req_headers);
    let length_known = !needs_esi && !gunzip_on_send;

    if length_known {
        if let Some(range_hdr) = req_headers.get("range") {
            let total = object.content_length() as u64;
            if let Some((start, end)) = parse_range(range_hdr, total) {
                return DeliverPlan {
                    status: 206,
                    body: BodyPlan::Range { start, end },
                    gunzip_on_send,
                    chunked: false,
                    age_secs,
                };
            }
        }
    }

    let chunked = !length_known && req_version == Version::Http11;
    DeliverPlan { status: 200, body: BodyPlan::Full, gunzip_on_send, chunked, age_secs }
}

fn client_accepts_gzip(headers: &HeaderTable) -> bool {
    headers.get_logical("accept-encoding").map(|v| v.windows(4).any(|w| w.eq_ignore_ascii_case(b"gzip"))).unwrap_or(false)
}

/// §6: "`If-Modified-Since` / `If-None-Match` produce 304 when stored object
/// is fresh per RFC2616." `ETag`/`Last-Modified` are taken from the object's
/// stored response headers; a missing validator means the precondition
/// cannot be satisfied, so the request falls through to a normal response.
fn is_not_modified(object: &Object, req_headers: &HeaderTable) -> bool {
    if let (Some(inm), Some(etag)) = (req_headers.get("if-none-match"), object.headers.get("etag")) {
        if inm.as_ref() == etag.as_ref() {
            return true;
        }
    }
    if let (Some(ims), Some(lm)) = (req_headers.get("if-modified-since"), object.headers.get("last-modified")) {
        if ims.as_ref() == lm.as_ref() {
            return true;
        }
    }
    false
}

/// Builds the outgoing response head for `plan`, copying the object's
/// stored headers and overwriting the transfer-framing ones. `request_xid`
/// is this request's own xid (§8 S1: "second identical request: `X-Varnish`
/// contains two xids" — the object's original fetch xid, plus the xid of
/// whichever request is being served from it now).
pub fn build_headers(object: &Object, plan: &DeliverPlan, request_xid: u64) -> HeaderTable {
    let mut headers = object.headers.clone();
    headers.remove_all("content-encoding");
    headers.remove_all("transfer-encoding");
    headers.remove_all("content-length");
    headers.remove_all("content-range");
    headers.remove_all("x-varnish");
    headers.set("Age", Bytes::from(plan.age_secs.to_string()));
    let x_varnish = if request_xid == object.xid {
        object.xid.to_string()
    } else {
        format!("{} {}", request_xid, object.xid)
    };
    headers.set("X-Varnish", Bytes::from(x_varnish));

    match plan.body {
        BodyPlan::NotModified => {},
        BodyPlan::Full => {
            if plan.chunked {
                headers.set("Transfer-Encoding", Bytes::from_static(b"chunked"));
            } else if !plan.gunzip_on_send {
                headers.set("Content-Length", Bytes::from(object.content_length().to_string()));
            }
            if object.gzipped && !plan.gunzip_on_send {
                headers.set("Content-Encoding", Bytes::from_static(b"gzip"));
            }
        },
        BodyPlan::Range { start, end } => {
            let total = object.content_length();
            headers.set("Content-Length", Bytes::from((end - start + 1).to_string()));
            headers.set("Content-Range", Bytes::from(format!("bytes {start}-{end}/{total}")));
        },
    }
    headers
}

fn write_chunk_framed(buf: &mut BytesMut, data: &[u8]) {
    buf.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
}

/// Builds the exact on-wire bytes for `object`'s body under `plan` (gunzip
/// on the fly, range slicing, chunked framing) without touching the stream.
/// Synchronous so it can run inside [`crate::cache::Cache::with_object`]'s
/// callback, which borrows the object only for the duration of the call;
/// the caller awaits the actual write ([`write_body`]) after the borrow
/// ends (§8 property 4's "served to a non-gzip client matches the original
/// plaintext byte-for-byte").
pub fn prepare_body(object: &Object, plan: &DeliverPlan) -> Vec<u8> {
    if matches!(plan.body, BodyPlan::NotModified) {
        return Vec::new();
    }

    let mut plain = if plan.gunzip_on_send || object.esi.is_some() {
        Some(gunzip_all(object))
    } else {
        None
    };

    let bytes_to_send: std::borrow::Cow<'_, [u8]> = if let Some(p) = plain.take() {
        std::borrow::Cow::Owned(p)
    } else {
        let mut all = Vec::with_capacity(object.content_length());
        for chunk in &object.body {
            all.extend_from_slice(&chunk.bytes);
        }
        std::borrow::Cow::Owned(all)
    };

    let slice: &[u8] = match plan.body {
        BodyPlan::Range { start, end } => &bytes_to_send[start as usize..=end as usize],
        _ => &bytes_to_send[..],
    };

    if plan.chunked {
        let mut buf = BytesMut::new();
        write_chunk_framed(&mut buf, slice);
        buf.put_slice(b"0\r\n\r\n");
        buf.to_vec()
    } else {
        slice.to_vec()
    }
}

/// Writes `object`'s stored body per `plan` onto `stream` in one call; a
/// thin wrapper around [`prepare_body`] for callers that already hold the
/// object across the write (tests, mainly — [`crate::state::cnt_deliver`]
/// calls `prepare_body` inside the cache borrow and writes afterward).
pub async fn write_body<S: AsyncWrite + Unpin>(stream: &mut S, object: &Object, plan: &DeliverPlan) -> std::io::Result<()> {
    let framed = prepare_body(object, plan);
    stream.write_all(&framed).await
}

fn gunzip_all(object: &Object) -> Vec<u8> {
    use crate::fetch::vfp::{GunzipVfp, Vfp};
    let mut gz = GunzipVfp::default();
    let mut out = Vec::with_capacity(object.content_length());
    for chunk in &object.body {
        let _ = gz.bytes(&chunk.bytes, &mut out);
    }
    let _ = gz.end(&mut out);
    out
}

/// §4.5 ESI delivery: expands `fragments` against the object's stored body,
/// writing verbatim spans directly and invoking `on_include` for each
/// include (the caller — [`crate::state`] — re-enters the state machine for
/// each include and supplies its rendered bytes).
pub async fn deliver_esi<S: AsyncWrite + Unpin>(
    stream: &mut S,
    fragments: &[EsiFragment],
    chunked: bool,
    mut on_include: impl FnMut(&[u8]) -> Vec<u8>,
) -> std::io::Result<()> {
    for fragment in fragments {
        let bytes: Bytes = match fragment {
            EsiFragment::Verbatim(b) => b.clone(),
            EsiFragment::Include { url } => Bytes::from(on_include(url)),
        };
        if chunked {
            let mut buf = BytesMut::new();
            write_chunk_framed(&mut buf, &bytes);
            stream.write_all(&buf).await?;
        } else {
            stream.write_all(&bytes).await?;
        }
    }
    if chunked {
        stream.write_all(b"0\r\n\r\n").await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_byte_range() {
        assert_eq!(parse_range(b"bytes=10-19", 100), Some((10, 19)));
    }

    #[test]
    fn parses_open_ended_range() {
        assert_eq!(parse_range(b"bytes=90-", 100), Some((90, 99)));
    }

    #[test]
    fn parses_suffix_range() {
        assert_eq!(parse_range(b"bytes=-10", 100), Some((90, 99)));
    }

    #[test]
    fn rejects_out_of_bounds_range() {
        assert_eq!(parse_range(b"bytes=10-200", 100), None);
    }

    #[test]
    fn rejects_multi_range() {
        assert_eq!(parse_range(b"bytes=0-1,2-3", 100), None);
    }
}
