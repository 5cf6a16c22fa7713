//! # Connection Pool
//!
//! Purpose: Reuse keep-alive connections inside one session to avoid
//! repeated TCP and TLS handshakes.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded list of idle connections.
//! 2. **Minimal Locking**: Hold the mutex only while moving idle connections.
//! 3. **Return on Success Only**: A connection goes back to the idle list
//!    only when its exchange finished cleanly; everything else is dropped.
//! 4. **Per-Operation Deadlines**: Every connect, read and write is bounded by
//!    the session's read timeout.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use hbridge_common::{Endpoint, SessionOptions, TransportError, TransportResult};

use crate::codec::{encode_connect, parse_response_head};
use crate::tls;

/// Byte stream a connection runs over: TCP, TLS, or TLS inside a tunnel.
pub(crate) trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

pub(crate) type BoxIo = Box<dyn Io>;

/// Path from this process to a destination: zero or more proxies, then the
/// target itself.
#[derive(Debug, Clone)]
pub(crate) struct Route {
    pub via: Vec<Endpoint>,
    pub target: Endpoint,
}

impl Route {
    pub fn direct(target: Endpoint) -> Self {
        Route {
            via: Vec::new(),
            target,
        }
    }

    /// Extends this route so the current target becomes the last proxy.
    pub fn through(&self, target: Endpoint) -> Self {
        let mut via = self.via.clone();
        via.push(self.target.clone());
        Route { via, target }
    }
}

/// One open HTTP/1.1 connection with its read buffer.
pub(crate) struct Connection {
    io: BoxIo,
    pub read_buf: BytesMut,
    read_timeout: Option<Duration>,
}

impl Connection {
    /// Opens a connection along `route`, tunnelling through every proxy.
    pub async fn open(route: &Route, options: &SessionOptions) -> TransportResult<Self> {
        let (first, rest) = match route.via.split_first() {
            Some((proxy, rest)) => (proxy, rest),
            None => {
                let io = connect_hop(&route.target, options.read_timeout).await?;
                return Ok(Connection::new(io, options.read_timeout));
            }
        };
        let mut io = connect_hop(first, options.read_timeout).await?;

        for next in rest.iter().chain(std::iter::once(&route.target)) {
            let mut tunnel = Connection::new(io, options.read_timeout);
            tunnel.establish_tunnel(next).await?;
            io = tunnel.into_io()?;
            if next.is_tls() {
                io = with_deadline(options.read_timeout, tls::handshake(io, next.connect_host())).await?;
            }
        }

        Ok(Connection::new(io, options.read_timeout))
    }

    fn new(io: BoxIo, read_timeout: Option<Duration>) -> Self {
        Connection {
            io,
            read_buf: BytesMut::with_capacity(8 * 1024),
            read_timeout,
        }
    }

    /// Reads more bytes into `read_buf`; returns 0 at end of stream.
    pub async fn read_more(&mut self) -> TransportResult<usize> {
        let io = &mut self.io;
        let buf = &mut self.read_buf;
        with_deadline(self.read_timeout, async move { io.read_buf(buf).await.map_err(TransportError::from) }).await
    }

    pub async fn write_all(&mut self, data: &[u8]) -> TransportResult<()> {
        let io = &mut self.io;
        with_deadline(self.read_timeout, async move { io.write_all(data).await.map_err(TransportError::from) }).await
    }

    pub async fn flush(&mut self) -> TransportResult<()> {
        let io = &mut self.io;
        with_deadline(self.read_timeout, async move { io.flush().await.map_err(TransportError::from) }).await
    }

    /// Returns true when an idle connection can no longer be used: the peer
    /// closed it, it failed, or it sent bytes nobody asked for.
    fn is_stale(&mut self) -> bool {
        if !self.read_buf.is_empty() {
            return true;
        }
        let mut probe = [0u8; 1];
        match self.io.read(&mut probe).now_or_never() {
            None => false,
            Some(Ok(_)) | Some(Err(_)) => true,
        }
    }

    async fn establish_tunnel(&mut self, target: &Endpoint) -> TransportResult<()> {
        let authority = format!("{}:{}", target.host(), target.port());
        let mut request = Vec::with_capacity(64);
        encode_connect(&authority, &mut request);
        self.write_all(&request).await?;
        self.flush().await?;

        let head = loop {
            if let Some(head) = parse_response_head(&mut self.read_buf)? {
                break head;
            }
            if self.read_more().await? == 0 {
                return Err(TransportError::ConnectionClosed);
            }
        };

        if !(200..300).contains(&head.status) {
            tracing::warn!(tunnel = %authority, status = head.status, "proxy refused tunnel");
            return Err(TransportError::ProxyRefused {
                target: authority,
                status: head.status,
            });
        }
        debug!(tunnel = %authority, "tunnel established");
        Ok(())
    }

    fn into_io(self) -> TransportResult<BoxIo> {
        if !self.read_buf.is_empty() {
            return Err(TransportError::Protocol("proxy sent data before the tunnel was used".into()));
        }
        Ok(self.io)
    }
}

async fn connect_hop(endpoint: &Endpoint, read_timeout: Option<Duration>) -> TransportResult<BoxIo> {
    if endpoint.default_port().is_none() {
        return Err(TransportError::UnsupportedScheme(endpoint.scheme().to_string()));
    }

    let stream = with_deadline(read_timeout, connect_tcp(endpoint)).await?;
    let io: BoxIo = Box::new(stream);
    if endpoint.is_tls() {
        return with_deadline(read_timeout, tls::handshake(io, endpoint.connect_host())).await;
    }
    Ok(io)
}

async fn connect_tcp(endpoint: &Endpoint) -> TransportResult<TcpStream> {
    let host = endpoint.connect_host();
    let addrs = tokio::net::lookup_host((host, endpoint.port()))
        .await
        .map_err(|source| TransportError::Resolve {
            host: host.to_string(),
            source,
        })?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                // Disable Nagle to keep request latency low for small payloads.
                stream.set_nodelay(true)?;
                debug!(%addr, "connected");
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }

    Err(match last_err {
        Some(err) => TransportError::Io(err),
        None => TransportError::Resolve {
            host: host.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
        },
    })
}

/// Bounds one I/O operation by `deadline`.
pub(crate) async fn with_deadline<F, T>(deadline: Option<Duration>, fut: F) -> TransportResult<T>
where
    F: Future<Output = TransportResult<T>>,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| TransportError::ReadTimeout)?,
        None => fut.await,
    }
}

struct PoolState {
    idle: VecDeque<Connection>,
    closed: bool,
}

struct PoolInner {
    max_idle: usize,
    state: Mutex<PoolState>,
}

/// Idle-connection pool owned by one session.
#[derive(Clone)]
pub(crate) struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(max_idle: usize) -> Self {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                max_idle,
                state: Mutex::new(PoolState {
                    idle: VecDeque::with_capacity(max_idle),
                    closed: false,
                }),
            }),
        }
    }

    /// Acquires an idle connection or opens a new one along `route`.
    pub async fn acquire(&self, route: &Route, options: &SessionOptions) -> TransportResult<PooledConnection> {
        while let Some(mut conn) = self.pop_idle() {
            if conn.is_stale() {
                debug!(endpoint = %route.target, "discarding stale connection");
                continue;
            }
            return Ok(PooledConnection::new(self.inner.clone(), conn));
        }

        let conn = Connection::open(route, options).await?;
        Ok(PooledConnection::new(self.inner.clone(), conn))
    }

    /// Drops every idle connection and stops accepting returned ones.
    pub fn close(&self) {
        let idle = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        debug!(count = idle.len(), "closing idle connections");
        drop(idle);
    }

    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    fn pop_idle(&self) -> Option<Connection> {
        self.inner.state.lock().idle.pop_front()
    }
}

impl PoolInner {
    fn return_connection(&self, conn: Connection) {
        let mut state = self.state.lock();
        if !state.closed && state.idle.len() < self.max_idle {
            state.idle.push_back(conn);
        }
    }
}

/// RAII wrapper returning a connection to the pool when released cleanly.
pub(crate) struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
    reusable: bool,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            reusable: false,
        }
    }

    pub fn conn(&mut self) -> TransportResult<&mut Connection> {
        self.conn.as_mut().ok_or(TransportError::ConnectionClosed)
    }

    /// Marks the exchange complete; the connection returns to the pool.
    pub fn release(mut self) {
        self.reusable = true;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };

        if self.reusable && conn.read_buf.is_empty() {
            self.pool.return_connection(conn);
        }
    }
}
