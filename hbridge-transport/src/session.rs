//! # Session Interface
//!
//! The narrow contract between the bridge and a transport: issue one request,
//! derive a tunnelled session, close.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{Stream, StreamExt};

use hbridge_common::{BodyStream, Endpoint, Headers, TransportResult};

/// A transport session bound to one destination.
///
/// Implementations must be safe to share between tasks; a pool hands the
/// same `Arc<dyn Session>` to every caller with the same host key.
#[async_trait]
pub trait Session: Send + Sync + fmt::Debug {
    /// Destination this session sends requests to.
    fn endpoint(&self) -> &Endpoint;

    /// Issues one request and returns the response head with a body stream.
    ///
    /// Dropping the returned future aborts any outstanding I/O.
    async fn send(&self, request: TransportRequest) -> TransportResult<TransportResponse>;

    /// Derives a session that reaches `target` through this session's
    /// destination acting as a proxy.
    fn proxied(&self, target: &Endpoint) -> TransportResult<Arc<dyn Session>>;

    /// Releases every connection the session holds.
    fn close(&self);
}

/// Request body in the form the transport writes it.
#[derive(Default)]
pub enum TransportBody {
    #[default]
    Empty,
    Full(Bytes),
    /// Streamed body; `length` is known when the caller declared it.
    Stream { stream: BodyStream, length: Option<u64> },
}

impl fmt::Debug for TransportBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportBody::Empty => write!(f, "Empty"),
            TransportBody::Full(bytes) => write!(f, "Full({} bytes)", bytes.len()),
            TransportBody::Stream { length, .. } => write!(f, "Stream(length: {length:?})"),
        }
    }
}

/// A request ready for the wire.
#[derive(Debug)]
pub struct TransportRequest {
    /// Upper-case method.
    pub method: String,
    pub scheme: String,
    /// Value for the `host` header.
    pub authority: String,
    /// Origin-form target: path plus query.
    pub path: String,
    pub headers: Headers,
    pub body: TransportBody,
}

/// A response head plus its (possibly still unread) body.
#[derive(Debug)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: ResponseStream,
}

type ChunkStream = Pin<Box<dyn Stream<Item = TransportResult<Bytes>> + Send>>;

enum StreamInner {
    Empty,
    Full(Option<Bytes>),
    Chunks(ChunkStream),
}

/// Response body, pulled chunk by chunk.
pub struct ResponseStream {
    inner: StreamInner,
}

impl ResponseStream {
    /// A body with no bytes (e.g. 204 or HEAD).
    pub fn empty() -> Self {
        ResponseStream { inner: StreamInner::Empty }
    }

    /// A body that is already in memory.
    pub fn full(bytes: Bytes) -> Self {
        ResponseStream {
            inner: StreamInner::Full(Some(bytes)),
        }
    }

    /// A body produced incrementally.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = TransportResult<Bytes>> + Send + 'static,
    {
        ResponseStream {
            inner: StreamInner::Chunks(Box::pin(stream)),
        }
    }

    /// Returns the next non-empty chunk, or `None` at the end of the body.
    pub async fn next_chunk(&mut self) -> TransportResult<Option<Bytes>> {
        match &mut self.inner {
            StreamInner::Empty => Ok(None),
            StreamInner::Full(bytes) => Ok(bytes.take().filter(|b| !b.is_empty())),
            StreamInner::Chunks(stream) => loop {
                match stream.next().await {
                    Some(Ok(chunk)) if chunk.is_empty() => continue,
                    Some(Ok(chunk)) => return Ok(Some(chunk)),
                    Some(Err(err)) => return Err(err),
                    None => return Ok(None),
                }
            },
        }
    }

    /// Reads the remaining body into one buffer.
    pub async fn read_all(mut self) -> TransportResult<Bytes> {
        if let StreamInner::Full(bytes) = &mut self.inner {
            return Ok(bytes.take().unwrap_or_default());
        }
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

impl fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            StreamInner::Empty => write!(f, "ResponseStream::Empty"),
            StreamInner::Full(_) => write!(f, "ResponseStream::Full"),
            StreamInner::Chunks(_) => write!(f, "ResponseStream::Chunks"),
        }
    }
}
