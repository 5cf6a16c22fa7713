//! # Test HTTP Server
//!
//! Accept HTTP/1.1 connections, parse requests, and answer from a fixed
//! route table.
//!
//! | Path            | Response                                                 |
//! |-----------------|----------------------------------------------------------|
//! | `/`             | `Hello World` as `text/plain`                            |
//! | `/204`          | `204 No Content`                                         |
//! | `/utf8`         | UTF-8 text with `charset=utf-8`                          |
//! | `/latin1`       | `café` encoded as ISO-8859-1                             |
//! | `/bad-charset`  | `abc` labelled with an unknown charset                   |
//! | `/binary`       | bytes that are not valid UTF-8, no content type          |
//! | `/bytes/{n}`    | `n` bytes of a repeating pattern                         |
//! | `/chunked`      | `Hello World` in three chunks, written apart             |
//! | `/delay/{ms}`   | `Hello World` after sleeping `ms` milliseconds           |
//! | `/echo`         | the request body, plus headers describing its framing    |
//! | `/headers`      | one `name: value` line per request header                |
//! | `/close`        | `bye` with `connection: close`                           |

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::{shared_counters, Background, Counters};

/// Upper bound on request header lines.
const MAX_HEADERS: usize = 64;

/// Byte pattern served by `/binary`.
pub const BINARY_BODY: &[u8] = &[0x00, 0x9f, 0x92, 0x96, 0xff, 0xfe];

/// Text served by `/utf8`.
pub const UTF8_TEXT: &str = "h\u{e9}llo w\u{f6}rld \u{2713}";

/// Running test server; stops when dropped.
pub struct TestServer {
    background: Background,
    counters: Arc<Counters>,
}

impl TestServer {
    pub fn start() -> io::Result<Self> {
        let counters = shared_counters();
        let shared = counters.clone();
        let background = Background::spawn("hbridge-test-server", move |listener| accept_loop(listener, shared))?;
        Ok(TestServer { background, counters })
    }

    pub fn addr(&self) -> SocketAddr {
        self.background.addr()
    }

    /// Plain HTTP URL for `path` on this server.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr(), path)
    }

    /// HTTPS URL for `path`. The server never speaks TLS, so handshakes
    /// against it fail.
    pub fn tls_url(&self, path: &str) -> String {
        format!("https://{}{}", self.addr(), path)
    }

    /// Number of TCP connections accepted so far.
    pub fn connections(&self) -> u64 {
        self.counters.connections()
    }

    /// Number of well-formed requests served so far.
    pub fn requests(&self) -> u64 {
        self.counters.requests()
    }
}

async fn accept_loop(listener: TcpListener, counters: Arc<Counters>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                continue;
            }
        };
        counters.record_connection();
        tracing::debug!(%peer, "test server accepted connection");

        let counters = counters.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, counters).await {
                tracing::debug!(%peer, error = %err, "test connection ended");
            }
        });
    }
}

/// Handles a single client connection until it closes.
async fn handle_connection(mut stream: TcpStream, counters: Arc<Counters>) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let mut buffer = BytesMut::with_capacity(8 * 1024);

    loop {
        let request = match read_request(&mut stream, &mut buffer).await? {
            Parsed::Request(request) => request,
            Parsed::Closed => return Ok(()),
            Parsed::Invalid => {
                stream
                    .write_all(b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await?;
                return Ok(());
            }
        };
        counters.record_request();

        let response = respond(&request).await;
        write_response(&mut stream, &request, &response).await?;
        if response.close {
            return Ok(());
        }
    }
}

struct Request {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Request {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    fn header_count(&self, name: &str) -> usize {
        self.headers.iter().filter(|(key, _)| key.eq_ignore_ascii_case(name)).count()
    }
}

enum Parsed {
    Request(Request),
    Closed,
    Invalid,
}

struct Head {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
}

fn parse_head(buffer: &mut BytesMut) -> Result<Option<Head>, httparse::Error> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut slots);
    let consumed = match request.parse(&buffer[..])? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };
    let head = Head {
        method: request.method.unwrap_or("GET").to_string(),
        path: request.path.unwrap_or("/").to_string(),
        headers: request
            .headers
            .iter()
            .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
            .collect(),
    };
    buffer.advance(consumed);
    Ok(Some(head))
}

async fn read_request(stream: &mut TcpStream, buffer: &mut BytesMut) -> io::Result<Parsed> {
    let head = loop {
        match parse_head(buffer) {
            Ok(Some(head)) => break head,
            Ok(None) => {}
            Err(err) => {
                tracing::debug!(error = %err, "rejecting malformed request");
                return Ok(Parsed::Invalid);
            }
        }
        if stream.read_buf(buffer).await? == 0 {
            return Ok(Parsed::Closed);
        }
    };

    let chunked = head
        .headers
        .iter()
        .any(|(k, v)| k.eq_ignore_ascii_case("transfer-encoding") && v.to_ascii_lowercase().contains("chunked"));
    let length = head
        .headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let body = if chunked {
        loop {
            match decode_chunked(buffer) {
                Ok(Some((body, consumed))) => {
                    buffer.advance(consumed);
                    break body;
                }
                Ok(None) => {}
                Err(()) => return Ok(Parsed::Invalid),
            }
            if stream.read_buf(buffer).await? == 0 {
                return Ok(Parsed::Closed);
            }
        }
    } else {
        while buffer.len() < length {
            if stream.read_buf(buffer).await? == 0 {
                return Ok(Parsed::Closed);
            }
        }
        buffer.split_to(length).to_vec()
    };

    Ok(Parsed::Request(Request {
        method: head.method,
        path: head.path,
        headers: head.headers,
        body,
    }))
}

/// Decodes a complete chunked body from the front of `buf`, returning the
/// payload and the number of bytes it occupied.
fn decode_chunked(buf: &[u8]) -> Result<Option<(Vec<u8>, usize)>, ()> {
    let mut pos = 0;
    let mut body = Vec::new();
    loop {
        let Some(line_end) = find_crlf(&buf[pos..]) else {
            return Ok(None);
        };
        let line = std::str::from_utf8(&buf[pos..pos + line_end]).map_err(|_| ())?;
        let digits = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(digits, 16).map_err(|_| ())?;
        pos += line_end + 2;

        if size == 0 {
            loop {
                let Some(end) = find_crlf(&buf[pos..]) else {
                    return Ok(None);
                };
                pos += end + 2;
                if end == 0 {
                    return Ok(Some((body, pos)));
                }
            }
        }

        if buf.len() < pos + size + 2 {
            return Ok(None);
        }
        body.extend_from_slice(&buf[pos..pos + size]);
        pos += size + 2;
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

enum Body {
    None,
    Fixed(Vec<u8>),
    Chunked(Vec<Vec<u8>>),
}

struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: Body,
    close: bool,
}

impl Response {
    fn new(status: u16, body: Body) -> Self {
        Response {
            status,
            headers: Vec::new(),
            body,
            close: false,
        }
    }

    fn text(text: &str) -> Self {
        Response::new(200, Body::Fixed(text.as_bytes().to_vec())).header("content-type", "text/plain")
    }

    fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }
}

async fn respond(request: &Request) -> Response {
    let path = request.path.split('?').next().unwrap_or("/");
    let mut segments = path.trim_start_matches('/').splitn(2, '/');
    let route = (segments.next().unwrap_or_default(), segments.next());

    match route {
        ("", None) => Response::text("Hello World"),
        ("204", None) => Response::new(204, Body::None),
        ("utf8", None) => Response::new(200, Body::Fixed(UTF8_TEXT.as_bytes().to_vec()))
            .header("content-type", "text/plain; charset=utf-8"),
        ("latin1", None) => Response::new(200, Body::Fixed(b"caf\xe9".to_vec()))
            .header("content-type", "text/plain; charset=iso-8859-1"),
        ("bad-charset", None) => Response::new(200, Body::Fixed(b"abc".to_vec()))
            .header("content-type", "text/plain; charset=no-such-charset"),
        ("binary", None) => Response::new(200, Body::Fixed(BINARY_BODY.to_vec())),
        ("bytes", Some(count)) => match count.parse::<usize>() {
            Ok(count) => Response::new(200, Body::Fixed(pattern(count))).header("content-type", "application/octet-stream"),
            Err(_) => Response::new(400, Body::Fixed(b"bad count".to_vec())),
        },
        ("chunked", None) => Response::new(
            200,
            Body::Chunked(vec![b"Hello".to_vec(), b" ".to_vec(), b"World".to_vec()]),
        )
        .header("content-type", "text/plain"),
        ("delay", Some(millis)) => match millis.parse::<u64>() {
            Ok(millis) => {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Response::text("Hello World")
            }
            Err(_) => Response::new(400, Body::Fixed(b"bad delay".to_vec())),
        },
        ("echo", None) => echo(request),
        ("headers", None) => {
            let listing: String = request
                .headers
                .iter()
                .map(|(name, value)| format!("{}: {}\n", name.to_ascii_lowercase(), value))
                .collect();
            Response::text(&listing)
        }
        ("close", None) => {
            let mut response = Response::text("bye").header("connection", "close");
            response.close = true;
            response
        }
        _ => Response::new(404, Body::Fixed(b"not found".to_vec())),
    }
}

fn echo(request: &Request) -> Response {
    let content_type = request.header("content-type").unwrap_or("application/octet-stream").to_string();
    let transfer_encoding = request.header("transfer-encoding").unwrap_or("none").to_string();
    Response::new(200, Body::Fixed(request.body.clone()))
        .header("content-type", content_type)
        .header("x-method", request.method.clone())
        .header("x-content-length-count", request.header_count("content-length").to_string())
        .header("x-transfer-encoding", transfer_encoding)
}

/// Deterministic body for `/bytes/{n}`.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Unknown",
    }
}

async fn write_response(stream: &mut TcpStream, request: &Request, response: &Response) -> io::Result<()> {
    let mut head = format!("HTTP/1.1 {} {}\r\n", response.status, reason(response.status));
    for (name, value) in &response.headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    match &response.body {
        Body::None => {}
        Body::Fixed(bytes) => head.push_str(&format!("content-length: {}\r\n", bytes.len())),
        Body::Chunked(_) => head.push_str("transfer-encoding: chunked\r\n"),
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes()).await?;

    if request.method == "HEAD" {
        return stream.flush().await;
    }

    match &response.body {
        Body::None => {}
        Body::Fixed(bytes) => stream.write_all(bytes).await?,
        Body::Chunked(chunks) => {
            for chunk in chunks {
                stream.write_all(format!("{:x}\r\n", chunk.len()).as_bytes()).await?;
                stream.write_all(chunk).await?;
                stream.write_all(b"\r\n").await?;
                stream.flush().await?;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            stream.write_all(b"0\r\n\r\n").await?;
        }
    }
    stream.flush().await
}
