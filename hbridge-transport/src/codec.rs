//! # HTTP/1.1 Framing
//!
//! Purpose: Encode request heads and decode response heads and bodies
//! without holding any connection state.
//!
//! ## Design Principles
//! 1. **Buffer Reuse**: Callers pass the output buffer; heads are encoded in
//!    place and parsed straight out of the connection's read buffer.
//! 2. **Binary-Safe**: Bodies are raw bytes; only heads are interpreted.
//! 3. **Fail Fast**: Invalid framing returns protocol errors immediately.

use bytes::{Buf, Bytes, BytesMut};

use hbridge_common::{Headers, TransportError, TransportResult};

use crate::session::TransportRequest;

/// Upper bound on response header lines.
const MAX_HEADERS: usize = 100;

/// How the request body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestFraming {
    None,
    Length(u64),
    Chunked,
}

/// Parsed response status line and headers.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub status: u16,
    /// 0 for HTTP/1.0, 1 for HTTP/1.1.
    pub version: u8,
    pub headers: Headers,
}

impl ResponseHead {
    /// True when the connection may carry another request after this one.
    pub fn keep_alive(&self) -> bool {
        let connection = self.headers.get("connection").unwrap_or_default();
        if has_token(connection, "close") {
            return false;
        }
        self.version >= 1 || has_token(connection, "keep-alive")
    }
}

/// How the response body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
    /// Body runs until the peer closes.
    Close,
}

impl BodyFraming {
    pub fn for_response(method: &str, head: &ResponseHead) -> TransportResult<Self> {
        if method == "HEAD" || (100..200).contains(&head.status) || head.status == 204 || head.status == 304 {
            return Ok(BodyFraming::Empty);
        }
        if let Some(encoding) = head.headers.get("transfer-encoding") {
            let last = encoding.rsplit(',').next().unwrap_or_default().trim();
            if last.eq_ignore_ascii_case("chunked") {
                return Ok(BodyFraming::Chunked);
            }
            return Ok(BodyFraming::Close);
        }
        match head.headers.get("content-length") {
            Some(raw) => {
                let length = raw
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| TransportError::Protocol(format!("invalid content-length: {raw}")))?;
                if length == 0 {
                    Ok(BodyFraming::Empty)
                } else {
                    Ok(BodyFraming::Length(length))
                }
            }
            None => Ok(BodyFraming::Close),
        }
    }
}

/// Encodes the request line and headers into `out`.
///
/// `content-length`, `transfer-encoding` and `connection` supplied by the
/// caller are dropped; framing is decided by `framing`.
pub(crate) fn encode_request_head(request: &TransportRequest, framing: RequestFraming, out: &mut Vec<u8>) {
    out.extend_from_slice(request.method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(request.path.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");

    if !request.headers.contains("host") {
        push_header(out, "host", &request.authority);
    }

    for (name, value) in request.headers.iter() {
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
            || name.eq_ignore_ascii_case("connection")
        {
            continue;
        }
        push_header(out, name, value);
    }

    match framing {
        RequestFraming::None => {}
        RequestFraming::Length(length) => push_header(out, "content-length", &length.to_string()),
        RequestFraming::Chunked => push_header(out, "transfer-encoding", "chunked"),
    }

    out.extend_from_slice(b"\r\n");
}

/// Encodes a `CONNECT` request for a tunnel to `authority`.
pub(crate) fn encode_connect(authority: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(b"CONNECT ");
    out.extend_from_slice(authority.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    push_header(out, "host", authority);
    out.extend_from_slice(b"\r\n");
}

/// Appends one chunk in chunked transfer coding.
pub(crate) fn encode_chunk(data: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Terminating chunk with an empty trailer section.
pub(crate) const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Parses a response head from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed; on success the head bytes
/// are consumed from `buf`.
pub(crate) fn parse_response_head(buf: &mut BytesMut) -> TransportResult<Option<ResponseHead>> {
    let mut header_slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut header_slots);

    let consumed = match response.parse(&buf[..]) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(err) => return Err(TransportError::Protocol(format!("invalid response head: {err}"))),
    };

    let status = response
        .code
        .ok_or_else(|| TransportError::Protocol("missing status code".into()))?;
    let version = response.version.unwrap_or(1);
    let headers = response
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect();

    buf.advance(consumed);
    Ok(Some(ResponseHead {
        status,
        version,
        headers,
    }))
}

/// Incremental decoder for chunked transfer coding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkedState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
    Done,
}

/// Outcome of one decoding step.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Decoded {
    /// A piece of body data.
    Data(Bytes),
    /// The buffer does not hold enough bytes to make progress.
    NeedMore,
    /// The final chunk and trailers were consumed.
    Done,
}

impl ChunkedState {
    /// Advances the decoder over `buf`, consuming what it understands.
    pub fn step(&mut self, buf: &mut BytesMut) -> TransportResult<Decoded> {
        loop {
            match *self {
                ChunkedState::Size => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(Decoded::NeedMore);
                    };
                    let size = parse_chunk_size(&line)?;
                    *self = if size == 0 {
                        ChunkedState::Trailers
                    } else {
                        ChunkedState::Data(size)
                    };
                }
                ChunkedState::Data(remaining) => {
                    if buf.is_empty() {
                        return Ok(Decoded::NeedMore);
                    }
                    let take = remaining.min(buf.len() as u64) as usize;
                    let data = buf.split_to(take).freeze();
                    let left = remaining - take as u64;
                    *self = if left == 0 {
                        ChunkedState::DataEnd
                    } else {
                        ChunkedState::Data(left)
                    };
                    return Ok(Decoded::Data(data));
                }
                ChunkedState::DataEnd => {
                    if buf.len() < 2 {
                        return Ok(Decoded::NeedMore);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(TransportError::Protocol("missing crlf after chunk".into()));
                    }
                    buf.advance(2);
                    *self = ChunkedState::Size;
                }
                ChunkedState::Trailers => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(Decoded::NeedMore);
                    };
                    if line.is_empty() {
                        *self = ChunkedState::Done;
                    }
                }
                ChunkedState::Done => return Ok(Decoded::Done),
            }
        }
    }
}

/// Upper bound on a chunk-size or trailer line.
const MAX_LINE: usize = 8 * 1024;

fn take_line(buf: &mut BytesMut) -> TransportResult<Option<BytesMut>> {
    match buf.windows(2).position(|w| w == b"\r\n") {
        Some(end) => {
            let line = buf.split_to(end);
            buf.advance(2);
            Ok(Some(line))
        }
        None if buf.len() > MAX_LINE => Err(TransportError::Protocol("chunk line too long".into())),
        None => Ok(None),
    }
}

fn parse_chunk_size(line: &[u8]) -> TransportResult<u64> {
    // Chunk extensions after ';' are ignored.
    let digits = line.split(|&b| b == b';').next().unwrap_or_default();
    let digits = std::str::from_utf8(digits)
        .map_err(|_| TransportError::Protocol("invalid chunk size".into()))?
        .trim();
    u64::from_str_radix(digits, 16).map_err(|_| TransportError::Protocol(format!("invalid chunk size: {digits:?}")))
}

fn push_header(out: &mut Vec<u8>, name: &str, value: &str) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
}

fn has_token(value: &str, token: &str) -> bool {
    value.split(',').any(|part| part.trim().eq_ignore_ascii_case(token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::TransportBody;

    fn request(method: &str, headers: Headers) -> TransportRequest {
        TransportRequest {
            method: method.into(),
            scheme: "http".into(),
            authority: "example.com".into(),
            path: "/index".into(),
            headers,
            body: TransportBody::Empty,
        }
    }

    #[test]
    fn encodes_request_head_with_host() {
        let mut out = Vec::new();
        let headers: Headers = [("accept", "*/*")].into_iter().collect();
        encode_request_head(&request("GET", headers), RequestFraming::None, &mut out);
        assert_eq!(
            out,
            b"GET /index HTTP/1.1\r\nhost: example.com\r\naccept: */*\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn caller_framing_headers_are_replaced() {
        let mut out = Vec::new();
        let headers: Headers = [("Content-Length", "99"), ("Host", "other")].into_iter().collect();
        encode_request_head(&request("POST", headers), RequestFraming::Length(11), &mut out);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Host: other\r\n"));
        assert!(!text.contains("host: example.com"));
        assert!(!text.contains("Content-Length: 99"));
        assert!(text.ends_with("content-length: 11\r\n\r\n"));
    }

    #[test]
    fn encodes_connect() {
        let mut out = Vec::new();
        encode_connect("example.com:443", &mut out);
        assert_eq!(
            out,
            b"CONNECT example.com:443 HTTP/1.1\r\nhost: example.com:443\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn parses_partial_then_complete_head() {
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n"[..]);
        assert!(parse_response_head(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\r\nhello");
        let head = parse_response_head(&mut buf).unwrap().unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.headers.get("Content-Length"), Some("5"));
        assert_eq!(&buf[..], b"hello");
        assert_eq!(BodyFraming::for_response("GET", &head).unwrap(), BodyFraming::Length(5));
    }

    #[test]
    fn rejects_garbage_head() {
        let mut buf = BytesMut::from(&b"\x16\x03\x01garbage\r\n\r\n"[..]);
        assert!(parse_response_head(&mut buf).is_err());
    }

    #[test]
    fn bodiless_responses() {
        let mut buf = BytesMut::from(&b"HTTP/1.1 204 No Content\r\ncontent-length: 10\r\n\r\n"[..]);
        let head = parse_response_head(&mut buf).unwrap().unwrap();
        assert_eq!(BodyFraming::for_response("GET", &head).unwrap(), BodyFraming::Empty);

        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\ncontent-length: 10\r\n\r\n"[..]);
        let head = parse_response_head(&mut buf).unwrap().unwrap();
        assert_eq!(BodyFraming::for_response("HEAD", &head).unwrap(), BodyFraming::Empty);
    }

    #[test]
    fn keep_alive_rules() {
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\nconnection: close\r\n\r\n"[..]);
        assert!(!parse_response_head(&mut buf).unwrap().unwrap().keep_alive());

        let mut buf = BytesMut::from(&b"HTTP/1.0 200 OK\r\n\r\n"[..]);
        assert!(!parse_response_head(&mut buf).unwrap().unwrap().keep_alive());

        let mut buf = BytesMut::from(&b"HTTP/1.0 200 OK\r\nConnection: Keep-Alive\r\n\r\n"[..]);
        assert!(parse_response_head(&mut buf).unwrap().unwrap().keep_alive());
    }

    #[test]
    fn decodes_chunked_body_across_splits() {
        let mut state = ChunkedState::Size;
        let mut buf = BytesMut::from(&b"5;ext=1\r\nHel"[..]);
        assert_eq!(state.step(&mut buf).unwrap(), Decoded::Data(Bytes::from_static(b"Hel")));
        assert_eq!(state.step(&mut buf).unwrap(), Decoded::NeedMore);

        buf.extend_from_slice(b"lo\r\n6\r\n World\r\n0\r\nx-trailer: 1\r\n\r\n");
        assert_eq!(state.step(&mut buf).unwrap(), Decoded::Data(Bytes::from_static(b"lo")));
        assert_eq!(state.step(&mut buf).unwrap(), Decoded::Data(Bytes::from_static(b" World")));
        assert_eq!(state.step(&mut buf).unwrap(), Decoded::Done);
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_bad_chunk_size() {
        let mut state = ChunkedState::Size;
        let mut buf = BytesMut::from(&b"zz\r\n"[..]);
        assert!(state.step(&mut buf).is_err());
    }

    #[test]
    fn encodes_chunks() {
        let mut out = Vec::new();
        encode_chunk(b"Hello World", &mut out);
        out.extend_from_slice(LAST_CHUNK);
        assert_eq!(out, b"b\r\nHello World\r\n0\r\n\r\n".to_vec());
    }
}
