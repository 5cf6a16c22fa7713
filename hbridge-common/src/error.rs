//! # Error Taxonomy
//!
//! Purpose: Keep transport failures detailed where they happen and collapse
//! them into a small, stable set of kinds at the single execution boundary.
//!
//! ## Design Principles
//! 1. **Two Layers**: `TransportError` is what a session reports;
//!    `BridgeError` is what a caller sees.
//! 2. **Kind, Not Text**: Classification inspects error variants and
//!    `io::ErrorKind`, never message strings.
//! 3. **No Retries**: A normalized failure is handed back as-is.
//!
//! ## Mapping
//!
//! ```text
//! TransportError::ReadTimeout, io::ErrorKind::TimedOut      -> Timeout
//! TransportError::Tls, io::Error wrapping rustls::Error     -> TlsFailure
//! other io::Error, Resolve, ConnectionClosed                -> ConnectionFailed
//! Protocol, ProxyRefused, UnsupportedScheme, Other          -> passed through
//! ```

use std::io;

use thiserror::Error;

/// Result type for caller-facing operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Result type for session/transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// The normalized failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A whole-call deadline or a per-operation read deadline expired.
    Timeout,
    /// TLS negotiation or certificate verification failed.
    TlsFailure,
    /// The connection could not be established or broke mid-request.
    ConnectionFailed,
    /// Anything else, passed through unchanged.
    Other,
}

/// Errors reported by a transport session.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket-level failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// TLS failure reported directly by rustls.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// The host name is not usable as a TLS server name.
    #[error("invalid tls server name: {0}")]
    InvalidServerName(String),

    /// Name resolution failed.
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    /// A single read, write or connect exceeded the read timeout.
    #[error("i/o operation timed out")]
    ReadTimeout,

    /// The peer closed the connection before the response completed.
    #[error("connection closed before the response completed")]
    ConnectionClosed,

    /// The peer sent bytes that are not valid HTTP/1.1.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The proxy answered the tunnel request with a non-2xx status.
    #[error("proxy refused tunnel to {target} with status {status}")]
    ProxyRefused { target: String, status: u16 },

    /// The session does not know how to reach this scheme.
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// Failure raised by a custom session or decorator.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl TransportError {
    /// Classifies this error into the normalized taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::ReadTimeout => ErrorKind::Timeout,
            TransportError::Io(err) => classify_io(err),
            TransportError::Tls(_) | TransportError::InvalidServerName(_) => ErrorKind::TlsFailure,
            TransportError::Resolve { .. } | TransportError::ConnectionClosed => {
                ErrorKind::ConnectionFailed
            }
            TransportError::Protocol(_)
            | TransportError::ProxyRefused { .. }
            | TransportError::UnsupportedScheme(_)
            | TransportError::Other(_) => ErrorKind::Other,
        }
    }
}

/// Classifies an `io::Error` by its kind and wrapped source.
///
/// tokio-rustls surfaces handshake failures as `io::Error` values whose inner
/// error is a `rustls::Error`; those count as TLS failures. Every other I/O
/// failure (refused, reset, aborted, unreachable, broken pipe, invalid
/// argument, address unavailable, unexpected EOF, ...) is a connection failure.
pub fn classify_io(err: &io::Error) -> ErrorKind {
    if err.kind() == io::ErrorKind::TimedOut {
        return ErrorKind::Timeout;
    }
    if err
        .get_ref()
        .is_some_and(|inner| inner.is::<rustls::Error>())
    {
        return ErrorKind::TlsFailure;
    }
    ErrorKind::ConnectionFailed
}

/// Errors surfaced to callers of the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The call deadline or a read deadline expired.
    #[error("request timed out")]
    Timeout,

    /// TLS negotiation failed.
    #[error("tls negotiation failed: {0}")]
    TlsFailure(#[source] TransportError),

    /// The connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(#[source] TransportError),

    /// A transport error outside the normalized kinds.
    #[error(transparent)]
    Transport(TransportError),

    /// The endpoint could not be parsed.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// A session was requested from a pool after `close`.
    #[error("session pool is closed")]
    PoolClosed,

    /// `execute` was called while a batch was already running.
    #[error("a batch is already running; nested execution is not supported")]
    NestedBatch,

    /// An operation was scheduled while no batch was running.
    #[error("no batch is running")]
    NoActiveBatch,

    /// Configuration could not be loaded.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

impl BridgeError {
    /// Returns the normalized kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Timeout => ErrorKind::Timeout,
            BridgeError::TlsFailure(_) => ErrorKind::TlsFailure,
            BridgeError::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            _ => ErrorKind::Other,
        }
    }
}

impl From<TransportError> for BridgeError {
    fn from(err: TransportError) -> Self {
        match err.kind() {
            ErrorKind::Timeout => BridgeError::Timeout,
            ErrorKind::TlsFailure => BridgeError::TlsFailure(err),
            ErrorKind::ConnectionFailed => BridgeError::ConnectionFailed(err),
            ErrorKind::Other => BridgeError::Transport(err),
        }
    }
}
