//! Error types for the cluster client.
//!
//! Configuration problems surface at open time and are never retried. Per-peer
//! transport problems are collected into [`PeerFailures`] and only surface when
//! every peer has been tried.

use std::fmt;

use thiserror::Error;

use crate::topology::Peer;

/// Errors returned by the client.
#[derive(Debug, Error)]
pub enum Error {
    /// The connection has been closed; no I/O was attempted.
    #[error("connection is closed")]
    Closed,

    /// The topology holds no peers to send a request to.
    #[error("no peers available")]
    NoPeers,

    /// Cluster discovery could not determine the topology.
    #[error("cluster discovery failed: {0}")]
    Discovery(String),

    /// Every peer in the ordered list failed.
    #[error("{0}")]
    AllPeersFailed(PeerFailures),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// A cursor accessor was used while the cursor was not on a row.
    #[error("cursor error: {0}")]
    CursorState(&'static str),

    /// A value could not be coerced into the requested type.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// The connection URL could not be parsed.
    #[error("invalid connection url: {0}")]
    InvalidUrl(String),

    #[error("unknown consistency level: {0}")]
    InvalidConsistencyLevel(String),

    /// The single statement of a `*_one` call failed on the store.
    #[error("statement failed: {0}")]
    Statement(String),

    /// The store rejected the whole request.
    #[error("store returned an error: {0}")]
    Store(String),

    #[error("failed to decode response: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode statements: {0}")]
    Encode(#[source] serde_json::Error),

    /// The HTTP transport could not be constructed.
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a single peer attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The TCP/TLS connection could not be established.
    Connect(String),
    /// The per-request timeout elapsed.
    Timeout,
    /// The peer answered with something other than 200.
    Status { status: u16, body: String },
    /// The response body could not be read.
    Body(String),
    /// A 301 could not be followed.
    Redirect(String),
    /// Any other transport error.
    Transport(String),
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Connect(msg) => write!(f, "connection error: {msg}"),
            FailureKind::Timeout => write!(f, "timed out"),
            FailureKind::Status { status, body } if body.is_empty() => {
                write!(f, "got status {status}")
            }
            FailureKind::Status { status, body } => write!(f, "got status {status}: {body}"),
            FailureKind::Body(msg) => write!(f, "failed to read body: {msg}"),
            FailureKind::Redirect(msg) => write!(f, "redirect failed: {msg}"),
            FailureKind::Transport(msg) => write!(f, "transport error: {msg}"),
        }
    }
}

/// One failed attempt against one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerFailure {
    pub peer: Peer,
    /// Request URL with credentials redacted.
    pub url: String,
    pub kind: FailureKind,
}

impl fmt::Display for PeerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) {}", self.peer, self.url, self.kind)
    }
}

/// Ordered per-peer failures, in attempt order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerFailures(Vec<PeerFailure>);

impl PeerFailures {
    pub(crate) fn push(&mut self, failure: PeerFailure) {
        self.0.push(failure);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerFailure> {
        self.0.iter()
    }
}

impl fmt::Display for PeerFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tried all peers unsuccessfully. here are the results:")?;
        for (n, failure) in self.0.iter().enumerate() {
            write!(f, "\n   peer #{n}: {failure}")?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a PeerFailures {
    type Item = &'a PeerFailure;
    type IntoIter = std::slice::Iter<'a, PeerFailure>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
