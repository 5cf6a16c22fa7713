//! # HTTP/1.1 Session
//!
//! Purpose: The default `Session`: keep-alive HTTP/1.1 over TCP or TLS,
//! optionally tunnelled through one or more proxies.
//!
//! ## Design Principles
//! 1. **One Exchange per Connection at a Time**: Each request checks out a
//!    connection from the session's pool and keeps it until its body is read.
//! 2. **Body Owns the Connection**: The response stream carries the pooled
//!    connection; reading it to the end hands the connection back.
//! 3. **Framing from Headers**: Request framing follows the body shape,
//!    response framing follows RFC 7230 section 3.3.3.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use tracing::{debug, trace};

use hbridge_common::{Endpoint, SessionOptions, TransportError, TransportResult};

use crate::codec::{
    encode_chunk, encode_request_head, parse_response_head, BodyFraming, ChunkedState, Decoded, RequestFraming,
    ResponseHead, LAST_CHUNK,
};
use crate::connection::{Connection, ConnectionPool, PooledConnection, Route};
use crate::session::{ResponseStream, Session, TransportBody, TransportRequest, TransportResponse};

/// Keep-alive HTTP/1.1 session bound to one destination.
///
/// Cloning is cheap; clones share the connection pool.
#[derive(Clone)]
pub struct Http1Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    route: Route,
    options: SessionOptions,
    pool: ConnectionPool,
}

impl Http1Session {
    /// Creates a session for `endpoint`. No connection is opened until the
    /// first request.
    pub fn new(endpoint: &Endpoint, options: SessionOptions) -> Self {
        Http1Session::with_route(Route::direct(endpoint.clone()), options)
    }

    fn with_route(route: Route, options: SessionOptions) -> Self {
        let pool = ConnectionPool::new(options.max_idle);
        Http1Session {
            inner: Arc::new(SessionInner { route, options, pool }),
        }
    }

    /// Number of keep-alive connections waiting for reuse.
    pub fn idle_connections(&self) -> usize {
        self.inner.pool.idle_count()
    }
}

impl fmt::Debug for Http1Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http1Session")
            .field("endpoint", &self.inner.route.target.to_string())
            .field("proxies", &self.inner.route.via.len())
            .field("idle", &self.idle_connections())
            .finish()
    }
}

#[async_trait]
impl Session for Http1Session {
    fn endpoint(&self) -> &Endpoint {
        &self.inner.route.target
    }

    async fn send(&self, request: TransportRequest) -> TransportResult<TransportResponse> {
        let inner = &self.inner;
        let mut pooled = inner.pool.acquire(&inner.route, &inner.options).await?;
        let method = request.method.clone();

        trace!(method = %method, path = %request.path, "sending request");
        write_request(pooled.conn()?, request).await?;
        let head = read_head(pooled.conn()?).await?;

        let framing = BodyFraming::for_response(&method, &head)?;
        // After 101 the connection speaks another protocol.
        let keep_alive = head.keep_alive() && head.status != 101;
        debug!(
            method = %method,
            status = head.status,
            framing = ?framing,
            keep_alive,
            "response head received"
        );

        let body = match framing {
            BodyFraming::Empty => {
                if keep_alive {
                    pooled.release();
                }
                ResponseStream::empty()
            }
            BodyFraming::Length(length) => body_stream(pooled, BodyState::Length(length), keep_alive),
            BodyFraming::Chunked => body_stream(pooled, BodyState::Chunked(ChunkedState::Size), keep_alive),
            BodyFraming::Close => body_stream(pooled, BodyState::Close, false),
        };

        Ok(TransportResponse {
            status: head.status,
            headers: head.headers,
            body,
        })
    }

    fn proxied(&self, target: &Endpoint) -> TransportResult<Arc<dyn Session>> {
        let route = self.inner.route.through(target.clone());
        Ok(Arc::new(Http1Session::with_route(route, self.inner.options.clone())))
    }

    fn close(&self) {
        self.inner.pool.close();
    }
}

fn request_framing(request: &TransportRequest) -> RequestFraming {
    match &request.body {
        TransportBody::Full(bytes) => RequestFraming::Length(bytes.len() as u64),
        TransportBody::Stream { length: Some(length), .. } => RequestFraming::Length(*length),
        TransportBody::Stream { length: None, .. } => RequestFraming::Chunked,
        TransportBody::Empty if matches!(request.method.as_str(), "POST" | "PUT" | "PATCH") => {
            RequestFraming::Length(0)
        }
        TransportBody::Empty => RequestFraming::None,
    }
}

async fn write_request(conn: &mut Connection, request: TransportRequest) -> TransportResult<()> {
    let framing = request_framing(&request);
    let mut head = Vec::with_capacity(256);
    encode_request_head(&request, framing, &mut head);

    match request.body {
        TransportBody::Empty => conn.write_all(&head).await?,
        TransportBody::Full(bytes) => {
            conn.write_all(&head).await?;
            conn.write_all(&bytes).await?;
        }
        TransportBody::Stream { mut stream, .. } => {
            conn.write_all(&head).await?;
            let mut written = 0u64;
            let mut frame = Vec::new();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                if chunk.is_empty() {
                    continue;
                }
                written += chunk.len() as u64;
                match framing {
                    RequestFraming::Chunked => {
                        frame.clear();
                        encode_chunk(&chunk, &mut frame);
                        conn.write_all(&frame).await?;
                    }
                    RequestFraming::Length(declared) if written > declared => {
                        return Err(TransportError::Protocol(format!(
                            "request body exceeds declared length of {declared} bytes"
                        )));
                    }
                    _ => conn.write_all(&chunk).await?,
                }
            }
            match framing {
                RequestFraming::Chunked => conn.write_all(LAST_CHUNK).await?,
                RequestFraming::Length(declared) if written != declared => {
                    return Err(TransportError::Protocol(format!(
                        "request body ended after {written} of {declared} declared bytes"
                    )));
                }
                _ => {}
            }
        }
    }

    conn.flush().await
}

/// Reads the final response head, skipping interim 1xx responses.
async fn read_head(conn: &mut Connection) -> TransportResult<ResponseHead> {
    loop {
        if let Some(head) = parse_response_head(&mut conn.read_buf)? {
            if (100..200).contains(&head.status) && head.status != 101 {
                trace!(status = head.status, "skipping interim response");
                continue;
            }
            return Ok(head);
        }
        if conn.read_more().await? == 0 {
            return Err(TransportError::ConnectionClosed);
        }
    }
}

enum BodyState {
    Length(u64),
    Chunked(ChunkedState),
    Close,
}

struct BodyReader {
    conn: PooledConnection,
    state: BodyState,
    keep_alive: bool,
}

impl BodyReader {
    /// Returns the next piece of body, or `None` once the body is complete.
    async fn next_piece(&mut self) -> TransportResult<Option<Bytes>> {
        let conn = self.conn.conn()?;
        loop {
            match &mut self.state {
                BodyState::Length(0) => return Ok(None),
                BodyState::Length(remaining) => {
                    if !conn.read_buf.is_empty() {
                        let take = (*remaining).min(conn.read_buf.len() as u64) as usize;
                        *remaining -= take as u64;
                        return Ok(Some(conn.read_buf.split_to(take).freeze()));
                    }
                }
                BodyState::Chunked(decoder) => match decoder.step(&mut conn.read_buf)? {
                    Decoded::Data(data) => return Ok(Some(data)),
                    Decoded::Done => return Ok(None),
                    Decoded::NeedMore => {}
                },
                BodyState::Close => {
                    if !conn.read_buf.is_empty() {
                        return Ok(Some(conn.read_buf.split().freeze()));
                    }
                    if conn.read_more().await? == 0 {
                        return Ok(None);
                    }
                    continue;
                }
            }

            if conn.read_more().await? == 0 {
                return Err(TransportError::ConnectionClosed);
            }
        }
    }

    fn finish(self) {
        if self.keep_alive {
            self.conn.release();
        }
    }
}

async fn read_step(mut reader: BodyReader) -> TransportResult<Option<(Bytes, BodyReader)>> {
    match reader.next_piece().await? {
        Some(piece) => Ok(Some((piece, reader))),
        None => {
            reader.finish();
            Ok(None)
        }
    }
}

fn body_stream(conn: PooledConnection, state: BodyState, keep_alive: bool) -> ResponseStream {
    let reader = BodyReader {
        conn,
        state,
        keep_alive,
    };
    ResponseStream::from_stream(stream::try_unfold(reader, read_step))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hbridge_common::Headers;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn get(path: &str) -> TransportRequest {
        TransportRequest {
            method: "GET".into(),
            scheme: "http".into(),
            authority: "127.0.0.1".into(),
            path: path.into(),
            headers: Headers::new(),
            body: TransportBody::Empty,
        }
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            raw.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&raw).into_owned();
            let Some(head_end) = text.find("\r\n\r\n") else { continue };
            let complete = if text.contains("transfer-encoding: chunked") {
                text.ends_with("0\r\n\r\n")
            } else {
                let length = text
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length: "))
                    .and_then(|value| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                raw.len() >= head_end + 4 + length
            };
            if complete || n == 0 {
                return text;
            }
        }
    }

    /// Serves each scripted response in turn on a single accepted connection
    /// and reports every request it saw.
    async fn scripted(responses: Vec<&'static [u8]>) -> (Endpoint, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut seen = Vec::new();
            for response in responses {
                seen.push(read_request(&mut socket).await);
                socket.write_all(response).await.unwrap();
            }
            seen
        });
        let endpoint = Endpoint::parse(&format!("http://{addr}/")).unwrap();
        (endpoint, handle)
    }

    #[tokio::test]
    async fn reuses_keep_alive_connection() {
        let (endpoint, server) = scripted(vec![
            b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello",
            b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n",
        ])
        .await;
        let session = Http1Session::new(&endpoint, SessionOptions::default());

        let first = session.send(get("/one")).await.unwrap();
        assert_eq!(first.body.read_all().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(session.idle_connections(), 1);

        let second = session.send(get("/two")).await.unwrap();
        assert_eq!(second.body.read_all().await.unwrap(), Bytes::from_static(b"abc"));

        let seen = server.await.unwrap();
        assert!(seen[0].starts_with("GET /one HTTP/1.1\r\n"));
        assert!(seen[1].starts_with("GET /two HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn connection_close_is_not_reused() {
        let (endpoint, _server) =
            scripted(vec![b"HTTP/1.1 200 OK\r\nconnection: close\r\ncontent-length: 2\r\n\r\nok"]).await;
        let session = Http1Session::new(&endpoint, SessionOptions::default());

        let response = session.send(get("/")).await.unwrap();
        assert_eq!(response.body.read_all().await.unwrap(), Bytes::from_static(b"ok"));
        assert_eq!(session.idle_connections(), 0);
    }

    #[tokio::test]
    async fn no_content_releases_immediately() {
        let (endpoint, _server) = scripted(vec![b"HTTP/1.1 204 No Content\r\n\r\n"]).await;
        let session = Http1Session::new(&endpoint, SessionOptions::default());

        let response = session.send(get("/")).await.unwrap();
        assert_eq!(response.status, 204);
        assert_eq!(session.idle_connections(), 1);
        assert!(response.body.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn switching_protocols_is_not_reused() {
        let (endpoint, server) =
            scripted(vec![b"HTTP/1.1 101 Switching Protocols\r\nconnection: upgrade\r\nupgrade: websocket\r\n\r\n"])
                .await;
        let session = Http1Session::new(&endpoint, SessionOptions::default());

        let response = session.send(get("/socket")).await.unwrap();
        assert_eq!(response.status, 101);
        assert!(response.body.read_all().await.unwrap().is_empty());
        assert_eq!(session.idle_connections(), 0);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let (endpoint, server) = scripted(vec![b"HTTP/1.1 200 OK\r\ncontent-length: 10\r\n\r\nshort"]).await;
        let session = Http1Session::new(&endpoint, SessionOptions::default());

        let response = session.send(get("/")).await.unwrap();
        // Dropping the socket ends the stream early.
        server.await.unwrap();
        let err = response.body.read_all().await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionClosed));
        assert_eq!(session.idle_connections(), 0);
    }

    #[tokio::test]
    async fn streams_body_with_chunked_framing() {
        let (endpoint, server) = scripted(vec![b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n"]).await;
        let session = Http1Session::new(&endpoint, SessionOptions::default());

        let mut request = get("/upload");
        request.method = "POST".into();
        request.body = TransportBody::Stream {
            stream: Box::pin(stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(b"Hello World"))])),
            length: None,
        };
        session.send(request).await.unwrap();

        let seen = server.await.unwrap();
        assert!(seen[0].contains("transfer-encoding: chunked\r\n"));
        assert!(seen[0].ends_with("b\r\nHello World\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn close_drops_idle_connections() {
        let (endpoint, _server) = scripted(vec![b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n"]).await;
        let session = Http1Session::new(&endpoint, SessionOptions::default());
        session.send(get("/")).await.unwrap();
        assert_eq!(session.idle_connections(), 1);

        session.close();
        assert_eq!(session.idle_connections(), 0);
    }

    #[test]
    fn proxied_session_targets_new_endpoint() {
        let proxy = Endpoint::parse("http://proxy.local:3128").unwrap();
        let target = Endpoint::parse("https://example.com/").unwrap();
        let session = Http1Session::new(&proxy, SessionOptions::default());

        let tunnelled = session.proxied(&target).unwrap();
        assert_eq!(tunnelled.endpoint(), &target);
        assert_eq!(session.endpoint(), &proxy);
    }
}
