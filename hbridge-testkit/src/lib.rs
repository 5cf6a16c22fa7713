//! # HybridBridge Test Kit
//!
//! Purpose: Local HTTP/1.1 server and `CONNECT` proxy for exercising the
//! bridge end to end without network access.
//!
//! ## Design Principles
//! 1. **Own Runtime**: Each fixture runs on its own thread and runtime, so it
//!    serves blocking tests and async tests alike.
//! 2. **Fixed Routes**: Behaviour is selected by request path; there is no
//!    configuration to get wrong.
//! 3. **Observable**: Atomic counters expose how many connections and
//!    requests a fixture has seen.
//! 4. **Scoped Lifetime**: Dropping a fixture stops it and joins its thread.

mod proxy;
mod server;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::net::TcpListener;
use tokio::sync::oneshot;

pub use proxy::TestProxy;
pub use server::{pattern, TestServer, BINARY_BODY, UTF8_TEXT};

/// Event counters shared between a fixture and its handle.
///
/// Relaxed ordering is enough; tests read the counters after the traffic
/// they care about has completed.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    connections: AtomicU64,
    requests: AtomicU64,
}

impl Counters {
    pub fn record_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

/// A fixture running on a background thread.
pub(crate) struct Background {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Background {
    /// Binds a loopback listener and serves it with `serve` until dropped.
    pub fn spawn<F, Fut>(name: &str, serve: F) -> io::Result<Self>
    where
        F: FnOnce(TcpListener) -> Fut + Send + 'static,
        Fut: Future<Output = ()>,
    {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let (shutdown, stopped) = oneshot::channel::<()>();
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;

        let thread = std::thread::Builder::new().name(name.to_string()).spawn(move || {
            runtime.block_on(async move {
                let listener = match TcpListener::from_std(listener) {
                    Ok(listener) => listener,
                    Err(err) => {
                        tracing::error!(error = %err, "fixture listener failed");
                        return;
                    }
                };
                tokio::select! {
                    _ = serve(listener) => {}
                    _ = stopped => {}
                }
            });
        })?;

        tracing::debug!(%addr, fixture = name, "fixture started");
        Ok(Background {
            addr,
            shutdown: Some(shutdown),
            thread: Some(thread),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for Background {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub(crate) fn shared_counters() -> Arc<Counters> {
    Arc::new(Counters::default())
}
