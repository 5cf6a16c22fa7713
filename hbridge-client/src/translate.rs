//! Envelope to transport-request translation.

use tokio_util::io::ReaderStream;

use hbridge_common::{RequestBody, RequestEnvelope};
use hbridge_transport::{TransportBody, TransportRequest};

/// Builds the wire request for `envelope`, taking its body.
///
/// A caller-supplied `content-length` header is removed and used as the
/// length hint for streamed bodies; the transport writes the real framing
/// header itself.
pub(crate) fn translate(envelope: &mut RequestEnvelope, block_size: usize) -> TransportRequest {
    let mut headers = envelope.headers.clone();
    let length_hint = headers
        .remove("content-length")
        .and_then(|value| value.trim().parse::<u64>().ok());

    let body = match std::mem::take(&mut envelope.body) {
        RequestBody::Empty => TransportBody::Empty,
        RequestBody::Buffered(bytes) => TransportBody::Full(bytes),
        RequestBody::Stream(stream) => TransportBody::Stream {
            stream,
            length: length_hint,
        },
        RequestBody::Reader(reader) => TransportBody::Stream {
            stream: Box::pin(ReaderStream::with_capacity(reader, block_size)),
            length: length_hint,
        },
    };

    let url = &envelope.url;
    TransportRequest {
        method: envelope.method.to_ascii_uppercase(),
        scheme: url.scheme().to_string(),
        authority: url.authority(),
        path: url.request_target(),
        headers,
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::StreamExt;

    #[test]
    fn uppercases_method_and_splits_target() {
        let mut envelope = RequestEnvelope::get("http://example.com:8080/search?q=rust#frag").unwrap();
        envelope.method = "get".into();
        let request = translate(&mut envelope, 4096);

        assert_eq!(request.method, "GET");
        assert_eq!(request.authority, "example.com:8080");
        assert_eq!(request.path, "/search?q=rust");
        assert!(matches!(request.body, TransportBody::Empty));
    }

    #[test]
    fn content_length_moves_into_length_hint() {
        let chunks = vec![Ok(Bytes::from_static(b"Hello World"))];
        let mut envelope = RequestEnvelope::post("http://example.com/echo", RequestBody::stream(futures_util::stream::iter(chunks)))
            .unwrap()
            .with_header("Content-Length", "11")
            .with_header("content-type", "text/plain");
        let request = translate(&mut envelope, 4096);

        assert!(!request.headers.contains("content-length"));
        assert_eq!(request.headers.get("content-type"), Some("text/plain"));
        assert!(matches!(request.body, TransportBody::Stream { length: Some(11), .. }));
        assert!(envelope.body.is_empty());
    }

    #[test]
    fn buffered_body_is_sent_whole() {
        let mut envelope = RequestEnvelope::post("http://example.com/echo", "payload").unwrap();
        let request = translate(&mut envelope, 4096);
        match request.body {
            TransportBody::Full(bytes) => assert_eq!(bytes, Bytes::from_static(b"payload")),
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reader_is_pulled_in_blocks() {
        let data = vec![7u8; 10_000];
        let mut envelope =
            RequestEnvelope::post("http://example.com/echo", RequestBody::reader(std::io::Cursor::new(data))).unwrap();
        let request = translate(&mut envelope, 4096);

        let TransportBody::Stream { mut stream, length } = request.body else {
            panic!("reader should become a stream");
        };
        assert_eq!(length, None);
        let mut sizes = Vec::new();
        while let Some(block) = stream.next().await {
            sizes.push(block.unwrap().len());
        }
        assert!(sizes.iter().all(|&size| size <= 4096));
        assert_eq!(sizes.iter().sum::<usize>(), 10_000);
    }
}
