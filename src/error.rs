use std::{error, fmt, io};

/// Errors surfaced by the fetch pipeline: backend I/O, protocol framing, and
/// storage exhaustion all funnel through here so the state machine can map
/// them onto a single ERROR transition (§7).
#[derive(Debug)]
pub enum FetchError {
    /// connect/read/write/timeout against the backend.
    Io(io::Error),
    /// malformed status line or header block, or unsupported framing.
    Protocol(String),
    /// both the preferred stevedore and Transient failed to allocate.
    StorageExhausted,
}

impl error::Error for FetchError {}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "backend i/o error: {e}"),
            Self::Protocol(s) => write!(f, "backend protocol error: {s}"),
            Self::StorageExhausted => write!(f, "storage exhausted"),
        }
    }
}

impl From<io::Error> for FetchError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Errors from parsing or writing the client/backend HTTP/1.x wire format.
#[derive(Debug, PartialEq, Eq)]
pub enum HttpError {
    /// request/status line or header block did not fit the grammar.
    Malformed(&'static str),
    /// a header line, or the sum of headers, exceeded the workspace budget.
    TooLarge,
    /// obs-fold (header continuation) seen with folding disabled.
    ObsFold,
}

impl error::Error for HttpError {}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(what) => write!(f, "malformed {what}"),
            Self::TooLarge => write!(f, "request too large for workspace"),
            Self::ObsFold => write!(f, "obsolete line folding rejected"),
        }
    }
}

/// Errors from a stevedore's allocation path (§4.4).
#[derive(Debug, PartialEq, Eq)]
pub enum StorageError {
    OutOfSpace,
    NukeFailed,
}

impl error::Error for StorageError {}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfSpace => write!(f, "stevedore out of space"),
            Self::NukeFailed => write!(f, "no eligible LRU candidate to nuke"),
        }
    }
}
