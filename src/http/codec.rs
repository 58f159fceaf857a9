//! Component I: request/response dissection, a case-insensitive header
//! table with logical-header collection, and wire serialization.
//!
//! Grounded in `bin/varnishd/cache_http.c` (`http_DissectRequest`,
//! `http_DissectResponse`, `http_findhdr`/`http_GetHdr`) for exact
//! semantics, hand-parsing `bytes::BytesMut` rather than pulling in a
//! ready-made HTTP crate.

use bytes::{BufMut, Bytes, BytesMut};
use itertools::Itertools;

use crate::error::HttpError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Http10 => b"HTTP/1.0",
            Self::Http11 => b"HTTP/1.1",
        }
    }

    fn parse(b: &[u8]) -> Option<Self> {
        match b {
            b"HTTP/1.0" => Some(Self::Http10),
            b"HTTP/1.1" => Some(Self::Http11),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Other,
}

impl Method {
    /// Whether this request's response may be served from and inserted into
    /// the cache (§6: "Supported methods include GET and HEAD as cacheable;
    /// others are passed through").
    pub fn is_cacheable(self) -> bool {
        matches!(self, Self::Get | Self::Head)
    }

    fn parse(b: &[u8]) -> Self {
        match b {
            b"GET" => Self::Get,
            b"HEAD" => Self::Head,
            b"POST" => Self::Post,
            b"PUT" => Self::Put,
            b"DELETE" => Self::Delete,
            b"OPTIONS" => Self::Options,
            _ => Self::Other,
        }
    }

    fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Get => b"GET",
            Self::Head => b"HEAD",
            Self::Post => b"POST",
            Self::Put => b"PUT",
            Self::Delete => b"DELETE",
            Self::Options => b"OPTIONS",
            Self::Other => b"GET", // Other carries its own wire form; see Request::method_raw.
        }
    }
}

fn lower(b: &[u8]) -> Vec<u8> {
    b.iter().map(u8::to_ascii_lowercase).collect()
}

/// A case-insensitive multi-map of header name -> value, preserving
/// insertion order (matches `http_findhdr`'s linear scan order, which
/// determines which duplicate wins for single-valued headers).
#[derive(Debug, Clone, Default)]
pub struct HeaderTable {
    // (lowercased name, original name, value)
    fields: Vec<(Bytes, Bytes, Bytes)>,
}

impl HeaderTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: Bytes, value: Bytes) {
        let lname = Bytes::from(lower(&name));
        self.fields.push((lname, name, value));
    }

    pub fn remove_all(&mut self, name: &str) {
        let lname = lower(name.as_bytes());
        self.fields.retain(|(l, _, _)| l.as_ref() != lname.as_slice());
    }

    pub fn set(&mut self, name: &'static str, value: impl Into<Bytes>) {
        self.remove_all(name);
        self.push(Bytes::from_static(name.as_bytes()), value.into());
    }

    /// First value for `name`, case-insensitive (matches `http_GetHdr`).
    pub fn get(&self, name: &str) -> Option<&Bytes> {
        let lname = lower(name.as_bytes());
        self.fields.iter().find(|(l, _, _)| l.as_ref() == lname.as_slice()).map(|(_, _, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// All values for `name`, in wire order. §6 requires duplicate
    /// `Cache-Control`/`Vary` headers be "collected into a single logical
    /// header" — callers join these with ", " per RFC 2616 §4.2.
    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a Bytes> + 'a {
        let lname = lower(name.as_bytes());
        self.fields.iter().filter(move |(l, _, _)| l.as_ref() == lname.as_slice()).map(|(_, _, v)| v)
    }

    /// Joins every occurrence of a logically-single-valued, comma-separable
    /// header (Cache-Control, Vary, ...) into one string, per §6.
    pub fn get_logical(&self, name: &str) -> Option<Vec<u8>> {
        let mut out: Vec<u8> = Vec::new();
        for v in self.get_all(name) {
            if !out.is_empty() {
                out.extend_from_slice(b", ");
            }
            out.extend_from_slice(v);
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &Bytes)> {
        self.fields.iter().map(|(_, n, v)| (n, v))
    }

    fn write(&self, dst: &mut BytesMut) {
        for (_, name, value) in &self.fields {
            dst.reserve(name.len() + 2 + value.len() + 2);
            dst.put_slice(name);
            dst.put_slice(b": ");
            dst.put_slice(value);
            dst.put_slice(b"\r\n");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// `Content-Length: n`.
    Length(usize),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// no length given; body runs until the connection closes (§4.5).
    Eof,
    /// 1xx/204/304/HEAD: no body permitted regardless of headers.
    None,
}

impl BodyFraming {
    /// Selects framing for a response per §4.5: `Transfer-Encoding: chunked`
    /// beats `Content-Length` beats EOF, and certain statuses/methods never
    /// carry a body.
    pub fn for_response(status: u16, is_head: bool, headers: &HeaderTable) -> Self {
        if is_head || matches!(status, 100..=199 | 204 | 304) {
            return Self::None;
        }
        if let Some(te) = headers.get_logical("transfer-encoding") {
            if te.eq_ignore_ascii_case(b"chunked")
                || te.to_ascii_lowercase().ends_with(b"chunked" as &[u8])
            {
                return Self::Chunked;
            }
        }
        if let Some(cl) = headers.get("content-length") {
            if let Ok(n) = std::str::from_utf8(cl).unwrap_or("").trim().parse::<usize>() {
                return Self::Length(n);
            }
        }
        Self::Eof
    }

    /// Selects framing for a request body: absent both headers means no
    /// body at all (never EOF-framed, since the connection must remain
    /// usable for the next pipelined request).
    pub fn for_request(headers: &HeaderTable) -> Self {
        if let Some(te) = headers.get_logical("transfer-encoding") {
            if te.eq_ignore_ascii_case(b"chunked") {
                return Self::Chunked;
            }
        }
        if let Some(cl) = headers.get("content-length") {
            if let Ok(n) = std::str::from_utf8(cl).unwrap_or("").trim().parse::<usize>() {
                return Self::Length(n);
            }
        }
        Self::None
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// raw wire method token; `method` classifies it, this preserves it
    /// verbatim for non-cacheable/passthrough methods and for re-emission
    /// to the backend.
    pub method_raw: Bytes,
    pub target: Bytes,
    pub version: Version,
    pub headers: HeaderTable,
}

impl Request {
    pub fn framing(&self) -> BodyFraming {
        BodyFraming::for_request(&self.headers)
    }

    pub fn write(&self, dst: &mut BytesMut) {
        dst.reserve(self.method_raw.len() + 1 + self.target.len() + 1 + 8 + 2);
        dst.put_slice(&self.method_raw);
        dst.put_slice(b" ");
        dst.put_slice(&self.target);
        dst.put_slice(b" ");
        dst.put_slice(self.version.as_bytes());
        dst.put_slice(b"\r\n");
        self.headers.write(dst);
        dst.put_slice(b"\r\n");
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub version: Version,
    pub status: u16,
    pub reason: Bytes,
    pub headers: HeaderTable,
}

impl Response {
    pub fn write(&self, dst: &mut BytesMut) {
        let status_str = self.status.to_string();
        dst.reserve(8 + 1 + status_str.len() + 1 + self.reason.len() + 2);
        dst.put_slice(self.version.as_bytes());
        dst.put_slice(b" ");
        dst.put_slice(status_str.as_bytes());
        dst.put_slice(b" ");
        dst.put_slice(&self.reason);
        dst.put_slice(b"\r\n");
        self.headers.write(dst);
        dst.put_slice(b"\r\n");
    }
}

/// Finds the first bare `\r\n` in `buf`, returning its index.
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.iter().tuple_windows().find_position(|&(&a, &b)| a == b'\r' && b == b'\n').map(|(i, _)| i)
}

/// Finds the blank-line terminator `\r\n\r\n` ending a header block.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Collapses obsolete line folding (a header continuation line starting
/// with SP/HTAB) into the preceding header's value, joined by a single
/// space, then returns the unfolded header block. §6 requires folding be
/// "collapsed to spaces"; §9 notes a compat switch for it, defaulted on
/// here since §6 states it unconditionally.
fn unfold(block: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(block.len());
    for line in block.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if (line.starts_with(b" ") || line.starts_with(b"\t")) && !out.is_empty() {
            out.push(b' ');
            out.extend_from_slice(line.trim_ascii_start());
        } else {
            if !out.is_empty() {
                out.extend_from_slice(b"\r\n");
            }
            out.extend_from_slice(line);
        }
    }
    out
}

fn parse_headers(block: &[u8]) -> Result<HeaderTable, HttpError> {
    let unfolded = unfold(block);
    let mut table = HeaderTable::new();
    for line in unfolded.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        let colon = line.iter().position(|&b| b == b':').ok_or(HttpError::Malformed("header"))?;
        let name = &line[..colon];
        if name.is_empty() || name.iter().any(u8::is_ascii_whitespace) {
            return Err(HttpError::Malformed("header"));
        }
        let value = line[colon + 1..].trim_ascii();
        table.push(Bytes::copy_from_slice(name), Bytes::copy_from_slice(value));
    }
    Ok(table)
}

/// Parses a complete request head (request-line + headers) from the front
/// of `buf`. Returns `Ok(None)` if the head isn't fully buffered yet (more
/// bytes needed), `Ok(Some((consumed, request)))` on success.
pub fn parse_request_head(buf: &[u8], max_len: usize) -> Result<Option<(usize, Request)>, HttpError> {
    let Some(end) = find_header_end(buf) else {
        if buf.len() > max_len {
            return Err(HttpError::TooLarge);
        }
        return Ok(None);
    };
    let head = &buf[..end];
    let consumed = end + 4;

    let line_end = find_crlf(head).unwrap_or(head.len());
    let line = &head[..line_end];
    let mut parts = line.splitn(3, |&b| b == b' ');
    let method_raw = parts.next().ok_or(HttpError::Malformed("request-line"))?;
    let target = parts.next().ok_or(HttpError::Malformed("request-line"))?;
    let version_raw = parts.next().ok_or(HttpError::Malformed("request-line"))?;
    let version = Version::parse(version_raw).ok_or(HttpError::Malformed("http-version"))?;

    let header_block = if line_end + 2 <= head.len() { &head[line_end + 2..] } else { &[] as &[u8] };
    let headers = parse_headers(header_block)?;

    Ok(Some((
        consumed,
        Request {
            method: Method::parse(method_raw),
            method_raw: Bytes::copy_from_slice(method_raw),
            target: Bytes::copy_from_slice(target),
            version,
            headers,
        },
    )))
}

/// As [`parse_request_head`], but for a backend status line.
pub fn parse_response_head(buf: &[u8], max_len: usize) -> Result<Option<(usize, Response)>, HttpError> {
    let Some(end) = find_header_end(buf) else {
        if buf.len() > max_len {
            return Err(HttpError::TooLarge);
        }
        return Ok(None);
    };
    let head = &buf[..end];
    let consumed = end + 4;

    let line_end = find_crlf(head).unwrap_or(head.len());
    let line = &head[..line_end];
    let mut parts = line.splitn(3, |&b| b == b' ');
    let version_raw = parts.next().ok_or(HttpError::Malformed("status-line"))?;
    let version = Version::parse(version_raw).ok_or(HttpError::Malformed("http-version"))?;
    let status_raw = parts.next().ok_or(HttpError::Malformed("status-line"))?;
    let status: u16 =
        std::str::from_utf8(status_raw).ok().and_then(|s| s.parse().ok()).ok_or(HttpError::Malformed("status-code"))?;
    let reason = parts.next().unwrap_or(b"");

    let header_block = if line_end + 2 <= head.len() { &head[line_end + 2..] } else { &[] as &[u8] };
    let headers = parse_headers(header_block)?;

    Ok(Some((consumed, Response { version, status, reason: Bytes::copy_from_slice(reason), headers })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_request() {
        let buf = b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n";
        let (consumed, req) = parse_request_head(buf, 8192).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.target.as_ref(), b"/a");
        assert_eq!(req.headers.get("host").unwrap().as_ref(), b"h");
    }

    #[test]
    fn incomplete_head_returns_none() {
        let buf = b"GET /a HTTP/1.1\r\nHost: h\r\n";
        assert!(parse_request_head(buf, 8192).unwrap().is_none());
    }

    #[test]
    fn collapses_obsolete_folding() {
        let buf = b"GET / HTTP/1.1\r\nX-Foo: bar\r\n baz\r\n\r\n";
        let (_, req) = parse_request_head(buf, 8192).unwrap().unwrap();
        assert_eq!(req.headers.get("x-foo").unwrap().as_ref(), b"bar baz");
    }

    #[test]
    fn collects_duplicate_headers_into_logical_value() {
        let buf = b"GET / HTTP/1.1\r\nCache-Control: no-cache\r\nCache-Control: max-age=0\r\n\r\n";
        let (_, req) = parse_request_head(buf, 8192).unwrap().unwrap();
        assert_eq!(req.headers.get_logical("cache-control").unwrap(), b"no-cache, max-age=0");
    }

    #[test]
    fn header_name_is_case_insensitive() {
        let buf = b"GET / HTTP/1.1\r\nhOsT: example\r\n\r\n";
        let (_, req) = parse_request_head(buf, 8192).unwrap().unwrap();
        assert_eq!(req.headers.get("Host").unwrap().as_ref(), b"example");
    }

    #[test]
    fn response_framing_prefers_content_length_over_chunked() {
        let mut h = HeaderTable::new();
        h.push("Content-Length".into(), "3".into());
        assert_eq!(BodyFraming::for_response(200, false, &h), BodyFraming::Length(3));
    }

    #[test]
    fn head_request_never_has_body() {
        let mut h = HeaderTable::new();
        h.push("Content-Length".into(), "3".into());
        assert_eq!(BodyFraming::for_response(200, true, &h), BodyFraming::None);
    }

    #[test]
    fn too_large_head_is_rejected() {
        let mut buf = b"GET / HTTP/1.1\r\n".to_vec();
        buf.extend(std::iter::repeat(b'a').take(200));
        assert_eq!(parse_request_head(&buf, 64), Err(HttpError::TooLarge));
    }
}
