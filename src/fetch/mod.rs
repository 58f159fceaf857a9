//! Component O: the fetch pipeline — backend connect/send/receive, body
//! framing selection, and the VFP stack (§4.5).
//!
//! Grounded in `bin/varnishd/cache_fetch.c`/`cache_busyobj.c`: a header
//! phase (connect-or-reuse, write request, read response, retry once on a
//! stale reused connection) followed by a body phase that loops a framing
//! reader through the chosen VFP, spilling into storage chunks of
//! `fetch_chunksize` bytes.

pub mod esi;
pub mod vfp;

use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;
use tracing::{instrument, warn};

use crate::backend::Backend;
use crate::cache::ObjCoreId;
use crate::error::{FetchError, StorageError};
use crate::http::{BodyFraming, HeaderTable, HttpConn, Method, Request, Response, Version};
use crate::storage::{ManagedStevedore, Storage, Stevedore, StevedoreOps};
use vfp::{Vfp, VfpKind};

/// Which VFP (or VFP pairing) to run for a given response, selected by the
/// caller from the response's `Content-Encoding` and the delivery policy
/// (§4.5's nop/gunzip/gzip/testgzip/esi enumeration).
pub enum VfpPlan {
    /// store verbatim. `stored_is_gzip` tells the body phase whether those
    /// verbatim bytes happen to already be gzip-compressed (an upstream
    /// `Content-Encoding: gzip` response passed through unchanged), since a
    /// `Nop` VFP itself carries no such information.
    Nop { stored_is_gzip: bool },
    Gunzip,
    Gzip { level: u32 },
    TestGzip,
    /// parse as ESI while storing. `input_gzipped` pairs a gunzip feeder in
    /// front of the parser; `output_gzip` pairs a deflate writer around it
    /// (§4.5: "when input is gzip'd, pair with a gunzip feeder; when
    /// output should be gzip'd, pair with a deflate writer").
    Esi { input_gzipped: bool, output_gzip: Option<u32> },
}

pub struct FetchedHead {
    pub response: Response,
    pub framing: BodyFraming,
}

pub struct FetchedBody {
    pub chunks: Vec<Storage>,
    pub esi: Option<esi::EsiProgram>,
    pub gzipped: bool,
    pub used_transient: bool,
}

/// §6: "The proxy always asks the backend for gzip when gzip support is
/// enabled and the request is not a pipe/pass... decompressing for clients
/// that don't accept gzip." Rewrites the outgoing `Accept-Encoding`.
pub fn prepare_backend_request(mut req: Request, gzip_enabled: bool) -> Request {
    if gzip_enabled {
        req.headers.set("Accept-Encoding", Bytes::from_static(b"gzip"));
    } else {
        req.headers.remove_all("accept-encoding");
    }
    req.headers.remove_all("connection");
    req
}

/// §4.5 header phase: connect-or-reuse, write the request, read the
/// response head. Retries once if a reused connection was already closed
/// by the backend (the one case §4.5 calls out by name).
#[instrument(skip(backend, req), fields(addr = %backend.addr))]
pub async fn fetch_head(
    backend: &Backend,
    req: &Request,
    connect_timeout: Duration,
    first_byte_timeout: Duration,
    max_head: usize,
) -> Result<(HttpConn<tokio::net::TcpStream>, FetchedHead), FetchError> {
    for attempt in 0..2 {
        let stream = timeout(connect_timeout, backend.get())
            .await
            .map_err(|_| FetchError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "connect_timeout")))??;
        let mut conn = HttpConn::new(stream, max_head);
        let mut buf = bytes::BytesMut::new();
        req.write(&mut buf);
        if let Err(e) = conn.write_all(&buf[..]).await {
            if attempt == 0 {
                warn!(error = %e, "reused backend connection was stale; retrying once");
                continue;
            }
            return Err(e.into());
        }
        match timeout(first_byte_timeout, conn.read_response()).await {
            Ok(Ok(Some(response))) => {
                let is_head = req.method == Method::Head;
                let framing = BodyFraming::for_response(response.status, is_head, &response.headers);
                return Ok((conn, FetchedHead { response, framing }));
            },
            Ok(Ok(None)) => {
                if attempt == 0 {
                    warn!("reused backend connection closed before a response; retrying once");
                    continue;
                }
                return Err(FetchError::Protocol("backend closed connection with no response".into()));
            },
            Ok(Err(e)) => return Err(e.into()),
            Err(_elapsed) => {
                backend.mark_sick();
                return Err(FetchError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "first_byte_timeout",
                )));
            },
        }
    }
    unreachable!("loop always returns within two attempts")
}

fn vfp_for_plan(plan: &VfpPlan, gzip_level: u32) -> VfpKind {
    let _ = gzip_level;
    match plan {
        VfpPlan::Nop { .. } => VfpKind::Nop(vfp::NopVfp),
        VfpPlan::Gunzip => VfpKind::Gunzip(vfp::GunzipVfp::default()),
        VfpPlan::Gzip { level } => VfpKind::Gzip(vfp::GzipVfp::new(*level)),
        VfpPlan::TestGzip => VfpKind::TestGzip(vfp::TestGzipVfp::default()),
        // esi drives its own plaintext accumulation and parse pass in fetch_body;
        // the VFP here only needs to deliver plaintext — gunzip first if the
        // backend body arrived compressed.
        VfpPlan::Esi { input_gzipped: true, .. } => VfpKind::Gunzip(vfp::GunzipVfp::default()),
        VfpPlan::Esi { input_gzipped: false, .. } => VfpKind::Nop(vfp::NopVfp),
    }
}

/// Allocation policy (§4.4): prefer `preferred`'s stevedore; on failure try
/// `nuke_one` up to `max_nuke_attempts` times; on persistent failure,
/// salvage onto `transient` with a shortened TTL; if that also fails,
/// return [`StorageError::OutOfSpace`] (mapped by the caller to 503, §7).
pub fn alloc_with_policy(
    preferred: &ManagedStevedore,
    transient: &Stevedore,
    size: usize,
    max_nuke_attempts: usize,
    mut nuke_candidate: impl FnMut(ObjCoreId) -> bool,
) -> Result<(Storage, bool), StorageError> {
    if let Ok(s) = preferred.stevedore.alloc(size) {
        return Ok((s, false));
    }
    for _ in 0..max_nuke_attempts {
        if !preferred.nuke_one(&mut nuke_candidate) {
            break;
        }
        if let Ok(s) = preferred.stevedore.alloc(size) {
            return Ok((s, false));
        }
    }
    match transient.alloc(size) {
        Ok(s) => Ok((s, true)),
        Err(_) => Err(StorageError::OutOfSpace),
    }
}

/// §4.5 body phase: drains `conn`'s body reader through `plan`'s VFP(s),
/// spilling output into `chunksize`-sized storage chunks via the
/// allocation policy. When `plan` is [`VfpPlan::Esi`], additionally parses
/// the accumulated plaintext into an [`esi::EsiProgram`].
#[allow(clippy::too_many_arguments)]
pub async fn fetch_body(
    conn: &mut HttpConn<tokio::net::TcpStream>,
    framing: BodyFraming,
    plan: VfpPlan,
    gzip_level: u32,
    chunksize: usize,
    preferred: &ManagedStevedore,
    transient: &Stevedore,
    shortlived: Duration,
    between_bytes_timeout: Duration,
    max_nuke_attempts: usize,
    mut nuke_candidate: impl FnMut(ObjCoreId) -> bool,
) -> Result<FetchedBody, FetchError> {
    // TTL enforcement for transient-salvaged chunks is applied by the caller
    // once the object is installed (the stevedore layer has no TTL concept).
    let _ = shortlived;

    let esi_mode = matches!(plan, VfpPlan::Esi { .. });
    let mut vfp = vfp_for_plan(&plan, gzip_level);
    vfp.begin(framing_size_hint(framing));

    let mut chunks = Vec::new();
    let mut current: Vec<u8> = Vec::with_capacity(chunksize.min(64 * 1024));
    let mut esi_plaintext = if esi_mode { Some(Vec::new()) } else { None };
    let mut used_transient = false;
    let mut gzipped_output =
        matches!(plan, VfpPlan::Gzip { .. } | VfpPlan::TestGzip | VfpPlan::Nop { stored_is_gzip: true });

    let mut body = conn.body_reader(framing);
    loop {
        let chunk = match timeout(between_bytes_timeout, body.next_chunk()).await {
            Ok(Ok(Some(c))) => c,
            Ok(Ok(None)) => break,
            Ok(Err(e)) => return Err(e.into()),
            Err(_elapsed) => {
                return Err(FetchError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "between_bytes_timeout",
                )))
            },
        };

        let mut produced = Vec::new();
        vfp.bytes(&chunk, &mut produced)?;
        if let Some(plaintext) = esi_plaintext.as_mut() {
            plaintext.extend_from_slice(&produced);
        } else {
            spill(
                &mut current,
                &produced,
                chunksize,
                &mut chunks,
                preferred,
                transient,
                max_nuke_attempts,
                &mut nuke_candidate,
                &mut used_transient,
            )?;
        }
    }

    let mut tail = Vec::new();
    vfp.end(&mut tail)?;
    if let Some(plaintext) = esi_plaintext.as_mut() {
        plaintext.extend_from_slice(&tail);
    } else if !tail.is_empty() {
        spill(
            &mut current,
            &tail,
            chunksize,
            &mut chunks,
            preferred,
            transient,
            max_nuke_attempts,
            &mut nuke_candidate,
            &mut used_transient,
        )?;
    }

    let esi_program = if let Some(plaintext) = esi_plaintext {
        let (program, warnings) = esi::parse(&plaintext);
        for w in &warnings {
            warn!(?w, "esi parse warning; offending construct kept verbatim");
        }
        let VfpPlan::Esi { output_gzip, .. } = &plan else { unreachable!() };
        let bytes_to_store = if let Some(level) = output_gzip {
            gzipped_output = true;
            let mut gz = vfp::GzipVfp::new(*level);
            let mut out = Vec::new();
            gz.bytes(&plaintext, &mut out)?;
            gz.end(&mut out)?;
            out
        } else {
            plaintext
        };
        spill(
            &mut current,
            &bytes_to_store,
            chunksize,
            &mut chunks,
            preferred,
            transient,
            max_nuke_attempts,
            &mut nuke_candidate,
            &mut used_transient,
        )?;
        Some(program)
    } else {
        None
    };

    if !current.is_empty() {
        finalize_chunk(&mut current, &mut chunks, preferred, transient, max_nuke_attempts, &mut nuke_candidate, &mut used_transient)?;
    }

    Ok(FetchedBody { chunks, esi: esi_program, gzipped: gzipped_output, used_transient })
}

fn framing_size_hint(framing: BodyFraming) -> Option<usize> {
    match framing {
        BodyFraming::Length(n) => Some(n),
        _ => None,
    }
}

#[allow(clippy::too_many_arguments)]
fn spill(
    current: &mut Vec<u8>,
    produced: &[u8],
    chunksize: usize,
    chunks: &mut Vec<Storage>,
    preferred: &ManagedStevedore,
    transient: &Stevedore,
    max_nuke_attempts: usize,
    nuke_candidate: &mut impl FnMut(ObjCoreId) -> bool,
    used_transient: &mut bool,
) -> Result<(), FetchError> {
    let mut rest = produced;
    while !rest.is_empty() {
        let room = chunksize - current.len();
        let take = room.min(rest.len());
        current.extend_from_slice(&rest[..take]);
        rest = &rest[take..];
        if current.len() == chunksize {
            finalize_chunk(current, chunks, preferred, transient, max_nuke_attempts, nuke_candidate, used_transient)?;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn finalize_chunk(
    current: &mut Vec<u8>,
    chunks: &mut Vec<Storage>,
    preferred: &ManagedStevedore,
    transient: &Stevedore,
    max_nuke_attempts: usize,
    nuke_candidate: &mut impl FnMut(ObjCoreId) -> bool,
    used_transient: &mut bool,
) -> Result<(), FetchError> {
    let (mut storage, via_transient) =
        alloc_with_policy(preferred, transient, current.len(), max_nuke_attempts, &mut *nuke_candidate)
            .map_err(|_| FetchError::StorageExhausted)?;
    storage.bytes[..current.len()].copy_from_slice(current);
    preferred.stevedore.trim(&mut storage, current.len());
    *used_transient |= via_transient;
    chunks.push(storage);
    current.clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_request_headers_set_accept_encoding() {
        let req = Request {
            method: Method::Get,
            method_raw: Bytes::from_static(b"GET"),
            target: Bytes::from_static(b"/"),
            version: Version::Http11,
            headers: HeaderTable::new(),
        };
        let prepped = prepare_backend_request(req, true);
        assert_eq!(prepped.headers.get("accept-encoding").unwrap().as_ref(), b"gzip");
    }

    #[test]
    fn alloc_policy_falls_back_to_transient_when_preferred_exhausted() {
        let preferred = ManagedStevedore::new(Stevedore::Malloc(crate::storage::malloc::MallocStevedore::new(1)));
        let transient = Stevedore::Transient(crate::storage::transient::TransientStevedore::new());
        let (storage, used_transient) = alloc_with_policy(&preferred, &transient, 100, 2, |_| false).unwrap();
        assert_eq!(storage.len(), 100);
        assert!(used_transient);
    }
}
