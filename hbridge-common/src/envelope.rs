//! # Request/Response Envelopes
//!
//! Purpose: The generic shape a calling framework hands to the bridge: a
//! request description plus a mutable slot the bridge fills with the result.
//!
//! ## Design Principles
//! 1. **Ordered Headers**: Headers keep insertion order and compare names
//!    case-insensitively; no other canonicalization happens.
//! 2. **Body Capabilities**: A request body is either buffered bytes, a
//!    ready byte stream, or a reader that must be pulled in blocks.
//! 3. **One Delivery Mode**: A response either materializes its body or is
//!    delivered through the streaming callback, never both.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::Stream;
use tokio::io::AsyncRead;

use crate::endpoint::Endpoint;
use crate::error::BridgeResult;

/// Ordered header list with case-insensitive names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Headers::default()
    }

    /// Returns the first value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Sets `name` to `value`, replacing every existing value in place of
    /// the first occurrence.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter().position(|(key, _)| key.eq_ignore_ascii_case(&name)) {
            Some(idx) => {
                self.entries[idx].1 = value;
                let mut seen = 0usize;
                self.entries.retain(|(key, _)| {
                    if key.eq_ignore_ascii_case(&name) {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
            }
            None => self.entries.push((name, value)),
        }
    }

    /// Appends a value without touching existing ones.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Removes every value for `name`, returning the first.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let mut removed = None;
        self.entries.retain(|(key, value)| {
            if key.eq_ignore_ascii_case(name) {
                if removed.is_none() {
                    removed = Some(value.clone());
                }
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Headers {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// A byte stream that already satisfies the transport's readable capability.
pub type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// A source that only supports chunked reads.
pub type BodyReader = Box<dyn AsyncRead + Send + Unpin>;

/// Request body as supplied by the caller.
#[derive(Default)]
pub enum RequestBody {
    #[default]
    Empty,
    /// Fully buffered bytes.
    Buffered(Bytes),
    /// A ready stream, passed through to the transport.
    Stream(BodyStream),
    /// A reader, pulled in fixed-size blocks.
    Reader(BodyReader),
}

impl RequestBody {
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        RequestBody::Stream(Box::pin(stream))
    }

    pub fn reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        RequestBody::Reader(Box::new(reader))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            RequestBody::Empty => true,
            RequestBody::Buffered(bytes) => bytes.is_empty(),
            _ => false,
        }
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => write!(f, "Empty"),
            RequestBody::Buffered(bytes) => write!(f, "Buffered({} bytes)", bytes.len()),
            RequestBody::Stream(_) => write!(f, "Stream"),
            RequestBody::Reader(_) => write!(f, "Reader"),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        RequestBody::Buffered(bytes)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        RequestBody::Buffered(Bytes::from(bytes))
    }
}

impl From<String> for RequestBody {
    fn from(text: String) -> Self {
        RequestBody::Buffered(Bytes::from(text))
    }
}

impl From<&'static str> for RequestBody {
    fn from(text: &'static str) -> Self {
        RequestBody::Buffered(Bytes::from_static(text.as_bytes()))
    }
}

/// Incremental delivery callback: `(chunk, cumulative bytes so far)`.
pub type StreamCallback = Box<dyn FnMut(&[u8], u64) + Send>;

/// A request plus the slot its response is written to.
pub struct RequestEnvelope {
    pub method: String,
    pub url: Endpoint,
    /// Tunnel the request through this proxy.
    pub proxy: Option<Endpoint>,
    pub headers: Headers,
    pub body: RequestBody,
    /// Overrides the adapter's whole-call deadline.
    pub timeout: Option<Duration>,
    /// When set, the body is streamed through this callback.
    pub on_data: Option<StreamCallback>,
    /// Result slot filled by the adapter.
    pub response: Option<ResponseEnvelope>,
}

impl RequestEnvelope {
    pub fn new(method: impl Into<String>, url: Endpoint) -> Self {
        RequestEnvelope {
            method: method.into(),
            url,
            proxy: None,
            headers: Headers::new(),
            body: RequestBody::Empty,
            timeout: None,
            on_data: None,
            response: None,
        }
    }

    /// Shorthand for a GET to an absolute URL.
    pub fn get(url: &str) -> BridgeResult<Self> {
        Ok(RequestEnvelope::new("GET", Endpoint::parse(url)?))
    }

    /// Shorthand for a POST with a body to an absolute URL.
    pub fn post(url: &str, body: impl Into<RequestBody>) -> BridgeResult<Self> {
        Ok(RequestEnvelope::new("POST", Endpoint::parse(url)?).with_body(body))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_proxy(mut self, proxy: Endpoint) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Registers the streaming callback, switching delivery to streaming mode.
    pub fn on_data<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&[u8], u64) + Send + 'static,
    {
        self.on_data = Some(Box::new(callback));
        self
    }

    pub fn is_streaming(&self) -> bool {
        self.on_data.is_some()
    }
}

impl fmt::Debug for RequestEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestEnvelope")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("proxy", &self.proxy)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("timeout", &self.timeout)
            .field("streaming", &self.is_streaming())
            .field("response", &self.response)
            .finish()
    }
}

/// A materialized response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// Bytes exactly as received.
    Raw(Bytes),
    /// Text decoded from the declared charset.
    Text(String),
}

impl ResponseBody {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ResponseBody::Raw(bytes) => bytes,
            ResponseBody::Text(text) => text.as_bytes(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ResponseBody::Raw(_) => None,
            ResponseBody::Text(text) => Some(text),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The response written into a request envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseEnvelope {
    pub status: u16,
    pub headers: Headers,
    /// `None` when the body was empty, streamed, or dropped.
    pub body: Option<ResponseBody>,
    /// False while a streamed body is still being delivered.
    pub finished: bool,
}

impl ResponseEnvelope {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body bytes, empty when there is no body.
    pub fn body_bytes(&self) -> &[u8] {
        self.body.as_ref().map(ResponseBody::as_bytes).unwrap_or_default()
    }

    /// Body as text when it is valid UTF-8 or was decoded from a charset.
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            Some(ResponseBody::Text(text)) => Some(text),
            Some(ResponseBody::Raw(bytes)) => std::str::from_utf8(bytes).ok(),
            None => None,
        }
    }
}
