//! # HybridBridge Transport
//!
//! Purpose: Provide the asynchronous, session-oriented HTTP/1.1 transport the
//! bridge pools, and the `Session` interface custom transports implement.
//!
//! ## Design Principles
//! 1. **Session Facade**: A `Session` is bound to one destination and hides
//!    how many keep-alive connections it holds underneath.
//! 2. **Lazy Connects**: Building a session never touches the network; the
//!    first request opens the first connection.
//! 3. **Tunnels Compose**: A proxied session is derived from the proxy's
//!    session and reaches its target through `CONNECT`.
//! 4. **Drop Means Abort**: Dropping an in-flight request drops its
//!    connection; only fully read responses hand connections back.

mod codec;
mod connection;
mod http1;
mod middleware;
mod session;
mod tls;

pub use http1::Http1Session;
pub use middleware::DefaultHeaders;
pub use session::{ResponseStream, Session, TransportBody, TransportRequest, TransportResponse};
