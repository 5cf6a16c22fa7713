use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use hbridge_common::{Endpoint, ErrorKind, Headers, SessionOptions, TransportError};
use hbridge_testkit::{TestProxy, TestServer};
use hbridge_transport::{DefaultHeaders, Http1Session, Session, TransportBody, TransportRequest};

fn request(method: &str, endpoint: &Endpoint, body: TransportBody) -> TransportRequest {
    TransportRequest {
        method: method.to_string(),
        scheme: endpoint.scheme().to_string(),
        authority: endpoint.authority(),
        path: endpoint.request_target(),
        headers: Headers::new(),
        body,
    }
}

fn endpoint(url: &str) -> Endpoint {
    Endpoint::parse(url).expect("endpoint")
}

#[tokio::test]
async fn direct_get_reaches_origin() {
    let server = TestServer::start().expect("server");
    let target = endpoint(&server.url("/"));
    let session = Http1Session::new(&target, SessionOptions::default());

    let response = session.send(request("GET", &target, TransportBody::Empty)).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.headers.get("content-length"), Some("11"));
    assert_eq!(response.body.read_all().await.unwrap(), Bytes::from_static(b"Hello World"));
    assert_eq!(server.requests(), 1);
    assert_eq!(session.idle_connections(), 1);
}

#[tokio::test]
async fn get_reuses_one_connection() {
    let server = TestServer::start().expect("server");
    let target = endpoint(&server.url("/"));
    let session = Http1Session::new(&target, SessionOptions::default());

    for _ in 0..3 {
        let response = session.send(request("GET", &target, TransportBody::Empty)).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body.read_all().await.unwrap(), Bytes::from_static(b"Hello World"));
    }
    assert_eq!(server.connections(), 1);
    assert_eq!(server.requests(), 3);
}

#[tokio::test]
async fn chunked_response_arrives_in_pieces() {
    let server = TestServer::start().expect("server");
    let target = endpoint(&server.url("/chunked"));
    let session = Http1Session::new(&target, SessionOptions::default());

    let mut response = session.send(request("GET", &target, TransportBody::Empty)).await.unwrap();
    let mut pieces = Vec::new();
    while let Some(piece) = response.body.next_chunk().await.unwrap() {
        pieces.push(piece);
    }
    assert!(pieces.len() >= 2);
    assert_eq!(pieces.concat(), b"Hello World".to_vec());
}

#[tokio::test]
async fn echoes_streamed_body_with_declared_length() {
    let server = TestServer::start().expect("server");
    let target = endpoint(&server.url("/echo"));
    let session = Http1Session::new(&target, SessionOptions::default());

    let chunks = vec![Ok::<_, std::io::Error>(Bytes::from_static(b"Hello ")), Ok(Bytes::from_static(b"World"))];
    let body = TransportBody::Stream {
        stream: Box::pin(futures_util::stream::iter(chunks)),
        length: Some(11),
    };
    let response = session.send(request("POST", &target, body)).await.unwrap();
    assert_eq!(response.headers.get("x-content-length-count"), Some("1"));
    assert_eq!(response.headers.get("x-transfer-encoding"), Some("none"));
    assert_eq!(response.body.read_all().await.unwrap(), Bytes::from_static(b"Hello World"));
}

#[tokio::test]
async fn refused_connection_is_a_connection_failure() {
    let target = endpoint("http://127.0.0.1:1/");
    let session = Http1Session::new(&target, SessionOptions::default());

    let err = session.send(request("GET", &target, TransportBody::Empty)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
}

#[tokio::test]
async fn tls_against_plain_server_is_a_tls_failure() {
    let server = TestServer::start().expect("server");
    let target = endpoint(&server.tls_url("/"));
    let session = Http1Session::new(&target, SessionOptions::default());

    let err = session.send(request("GET", &target, TransportBody::Empty)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TlsFailure, "unexpected error: {err:?}");
}

#[tokio::test]
async fn read_timeout_bounds_slow_responses() {
    let server = TestServer::start().expect("server");
    let target = endpoint(&server.url("/delay/300"));
    let options = SessionOptions {
        read_timeout: Some(Duration::from_millis(50)),
        ..SessionOptions::default()
    };
    let session = Http1Session::new(&target, options);

    let err = session.send(request("GET", &target, TransportBody::Empty)).await.unwrap_err();
    assert!(matches!(err, TransportError::ReadTimeout));
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[tokio::test]
async fn proxied_session_tunnels_through_connect() {
    let server = TestServer::start().expect("server");
    let proxy = TestProxy::start().expect("proxy");
    let target = endpoint(&server.url("/"));

    let proxy_session = Http1Session::new(&endpoint(&proxy.url()), SessionOptions::default());
    let tunnelled = proxy_session.proxied(&target).unwrap();

    let response = tunnelled.send(request("GET", &target, TransportBody::Empty)).await.unwrap();
    assert_eq!(response.body.read_all().await.unwrap(), Bytes::from_static(b"Hello World"));
    assert_eq!(proxy.tunnels(), 1);
    assert_eq!(server.requests(), 1);
}

#[tokio::test]
async fn refusing_proxy_reports_status() {
    let server = TestServer::start().expect("server");
    let proxy = TestProxy::refusing().expect("proxy");
    let target = endpoint(&server.url("/"));

    let proxy_session = Http1Session::new(&endpoint(&proxy.url()), SessionOptions::default());
    let tunnelled = proxy_session.proxied(&target).unwrap();

    let err = tunnelled.send(request("GET", &target, TransportBody::Empty)).await.unwrap_err();
    assert!(matches!(err, TransportError::ProxyRefused { status: 403, .. }));
    assert_eq!(server.requests(), 0);
}

#[tokio::test]
async fn default_headers_reach_the_server() {
    let server = TestServer::start().expect("server");
    let target = endpoint(&server.url("/headers"));
    let base: Arc<dyn Session> = Arc::new(Http1Session::new(&target, SessionOptions::default()));
    let defaults: Headers = [("user-agent", "hbridge-test")].into_iter().collect();
    let session = DefaultHeaders::wrap(base, defaults);

    let response = session.send(request("GET", &target, TransportBody::Empty)).await.unwrap();
    let listing = response.body.read_all().await.unwrap();
    let listing = String::from_utf8_lossy(&listing);
    assert!(listing.contains("user-agent: hbridge-test\n"));
    assert!(listing.contains(&format!("host: {}\n", target.authority())));
}
