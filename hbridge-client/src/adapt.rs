//! # Response Adapter
//!
//! Purpose: Write a transport response into the caller's envelope, either
//! as a materialized body or through the streaming callback.
//!
//! ## Design Principles
//! 1. **One Delivery Mode**: A registered callback switches to streaming;
//!    the body is then never buffered as a whole.
//! 2. **Absent, Not Empty**: An empty body is reported as no body.
//! 3. **Declared Charset Only**: Text decoding happens only when the content
//!    type names a charset; otherwise bytes are passed through untouched.

use bytes::Bytes;
use encoding_rs::Encoding;
use tracing::warn;

use hbridge_common::{BridgeResult, CharsetFallback, RequestEnvelope, ResponseBody, ResponseEnvelope};
use hbridge_transport::TransportResponse;

/// Fills `envelope.response` from `response`.
pub(crate) async fn adapt(
    response: TransportResponse,
    envelope: &mut RequestEnvelope,
    fallback: CharsetFallback,
) -> BridgeResult<()> {
    let TransportResponse {
        status,
        headers,
        mut body,
    } = response;

    let Some(callback) = envelope.on_data.as_mut() else {
        let bytes = body.read_all().await?;
        let decoded = materialize(bytes, headers.get("content-type"), fallback);
        envelope.response = Some(ResponseEnvelope {
            status,
            headers,
            body: decoded,
            finished: true,
        });
        return Ok(());
    };

    let slot = envelope.response.insert(ResponseEnvelope {
        status,
        headers,
        body: None,
        finished: false,
    });
    let mut received = 0u64;
    while let Some(chunk) = body.next_chunk().await? {
        received += chunk.len() as u64;
        callback(&chunk, received);
    }
    slot.finished = true;
    Ok(())
}

/// Turns a fully read body into the envelope's body value.
fn materialize(bytes: Bytes, content_type: Option<&str>, fallback: CharsetFallback) -> Option<ResponseBody> {
    if bytes.is_empty() {
        return None;
    }
    let Some(label) = content_type.and_then(charset_param) else {
        return Some(ResponseBody::Raw(bytes));
    };

    match Encoding::for_label(label.as_bytes()) {
        Some(encoding) => {
            let (text, _) = encoding.decode_without_bom_handling(&bytes);
            Some(ResponseBody::Text(text.into_owned()))
        }
        None => {
            warn!(charset = label, ?fallback, "unknown response charset");
            match fallback {
                CharsetFallback::Empty => None,
                CharsetFallback::Raw => Some(ResponseBody::Raw(bytes)),
            }
        }
    }
}

/// Extracts the `charset` parameter from a content-type value.
fn charset_param(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("charset") {
            Some(value.trim().trim_matches('"'))
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use hbridge_common::Headers;
    use hbridge_transport::ResponseStream;
    use parking_lot::Mutex;

    fn response(content_type: Option<&str>, body: ResponseStream) -> TransportResponse {
        let mut headers = Headers::new();
        if let Some(value) = content_type {
            headers.append("Content-Type", value);
        }
        TransportResponse {
            status: 200,
            headers,
            body,
        }
    }

    #[test]
    fn finds_charset_parameter() {
        assert_eq!(charset_param("text/html; charset=UTF-8"), Some("UTF-8"));
        assert_eq!(charset_param("text/html;foo=bar; Charset=\"latin1\""), Some("latin1"));
        assert_eq!(charset_param("text/html"), None);
        assert_eq!(charset_param("charset=utf-8"), None);
    }

    #[test]
    fn decodes_declared_charsets() {
        let body = materialize(Bytes::from_static(b"caf\xe9"), Some("text/plain; charset=iso-8859-1"), CharsetFallback::Empty);
        assert_eq!(body, Some(ResponseBody::Text("caf\u{e9}".into())));

        let body = materialize(Bytes::from("h\u{e9}llo"), Some("text/plain; charset=utf-8"), CharsetFallback::Empty);
        assert_eq!(body, Some(ResponseBody::Text("h\u{e9}llo".into())));
    }

    #[test]
    fn passes_raw_bytes_without_charset() {
        let raw = Bytes::from_static(&[0xff, 0x00, 0x9f]);
        assert_eq!(materialize(raw.clone(), None, CharsetFallback::Empty), Some(ResponseBody::Raw(raw.clone())));
        assert_eq!(
            materialize(raw.clone(), Some("application/octet-stream"), CharsetFallback::Empty),
            Some(ResponseBody::Raw(raw))
        );
    }

    #[test]
    fn unknown_charset_follows_fallback() {
        let bytes = Bytes::from_static(b"abc");
        let content_type = Some("text/plain; charset=no-such-charset");
        assert_eq!(materialize(bytes.clone(), content_type, CharsetFallback::Empty), None);
        assert_eq!(
            materialize(bytes.clone(), content_type, CharsetFallback::Raw),
            Some(ResponseBody::Raw(bytes))
        );
    }

    #[test]
    fn empty_body_is_absent() {
        assert_eq!(materialize(Bytes::new(), Some("text/plain; charset=utf-8"), CharsetFallback::Raw), None);
    }

    #[tokio::test]
    async fn streaming_reports_cumulative_sizes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut envelope = RequestEnvelope::get("http://example.com/")
            .unwrap()
            .on_data(move |chunk, total| sink.lock().push((chunk.to_vec(), total)));

        let chunks = vec![Ok(Bytes::from_static(b"Hello")), Ok(Bytes::from_static(b" World"))];
        let body = ResponseStream::from_stream(futures_util::stream::iter(chunks));
        adapt(response(Some("text/plain"), body), &mut envelope, CharsetFallback::Empty)
            .await
            .unwrap();

        let response = envelope.response.unwrap();
        assert!(response.finished);
        assert!(response.body.is_none());
        assert_eq!(
            *seen.lock(),
            vec![(b"Hello".to_vec(), 5), (b" World".to_vec(), 11)]
        );
    }

    #[tokio::test]
    async fn buffered_mode_marks_finished() {
        let mut envelope = RequestEnvelope::get("http://example.com/").unwrap();
        let body = ResponseStream::full(Bytes::from_static(b"Hello World"));
        adapt(response(None, body), &mut envelope, CharsetFallback::Empty).await.unwrap();

        let response = envelope.response.unwrap();
        assert!(response.finished);
        assert_eq!(response.body, Some(ResponseBody::Raw(Bytes::from_static(b"Hello World"))));
    }
}
