//! Minimal `CONNECT` proxy.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::{shared_counters, Background, Counters};

/// Running tunnelling proxy; stops when dropped.
///
/// Every accepted connection must start with `CONNECT host:port`; anything
/// else is answered with `405`. A refusing proxy answers every tunnel
/// request with `403`.
pub struct TestProxy {
    background: Background,
    counters: Arc<Counters>,
}

impl TestProxy {
    pub fn start() -> io::Result<Self> {
        TestProxy::spawn(false)
    }

    /// A proxy that refuses every tunnel.
    pub fn refusing() -> io::Result<Self> {
        TestProxy::spawn(true)
    }

    fn spawn(refuse: bool) -> io::Result<Self> {
        let counters = shared_counters();
        let shared = counters.clone();
        let background = Background::spawn("hbridge-test-proxy", move |listener| accept_loop(listener, shared, refuse))?;
        Ok(TestProxy { background, counters })
    }

    pub fn addr(&self) -> SocketAddr {
        self.background.addr()
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr())
    }

    /// Number of tunnel requests received.
    pub fn tunnels(&self) -> u64 {
        self.counters.requests()
    }

    /// Number of client connections accepted.
    pub fn connections(&self) -> u64 {
        self.counters.connections()
    }
}

async fn accept_loop(listener: TcpListener, counters: Arc<Counters>, refuse: bool) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(error = %err, "proxy accept failed");
                continue;
            }
        };
        counters.record_connection();

        let counters = counters.clone();
        tokio::spawn(async move {
            if let Err(err) = tunnel(stream, counters, refuse).await {
                tracing::debug!(%peer, error = %err, "tunnel ended");
            }
        });
    }
}

async fn tunnel(mut client: TcpStream, counters: Arc<Counters>, refuse: bool) -> io::Result<()> {
    let mut buffer = BytesMut::with_capacity(4 * 1024);
    let authority = loop {
        match parse_connect(&mut buffer) {
            Ok(Some(authority)) => break authority,
            Ok(None) => {}
            Err(()) => {
                client
                    .write_all(b"HTTP/1.1 405 Method Not Allowed\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await?;
                return Ok(());
            }
        }
        if client.read_buf(&mut buffer).await? == 0 {
            return Ok(());
        }
    };
    counters.record_request();

    if refuse {
        client
            .write_all(b"HTTP/1.1 403 Forbidden\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
            .await?;
        return Ok(());
    }

    let mut upstream = match TcpStream::connect(authority.as_str()).await {
        Ok(upstream) => upstream,
        Err(err) => {
            tracing::debug!(%authority, error = %err, "upstream connect failed");
            client
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await?;
            return Ok(());
        }
    };
    client.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await?;
    if !buffer.is_empty() {
        upstream.write_all(&buffer).await?;
    }

    tracing::debug!(%authority, "tunnel open");
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

/// Parses a `CONNECT` head from the front of `buffer`, returning its
/// authority. Any other method is an error.
fn parse_connect(buffer: &mut BytesMut) -> Result<Option<String>, ()> {
    let mut slots = [httparse::EMPTY_HEADER; 16];
    let mut request = httparse::Request::new(&mut slots);
    let consumed = match request.parse(&buffer[..]) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(_) => return Err(()),
    };
    if request.method != Some("CONNECT") {
        return Err(());
    }
    let authority = request.path.ok_or(())?.to_string();
    buffer.advance(consumed);
    Ok(Some(authority))
}
