//! # Blocking Facade
//!
//! Purpose: Serve synchronous callers: each call blocks the calling thread
//! until its response has been written into the envelope.
//!
//! ## Design Principles
//! 1. **Own Runtime**: The facade owns a current-thread runtime, so every
//!    request issued through it runs on the caller's thread and uses that
//!    thread's session cache.
//! 2. **Queue Then Run**: `in_parallel` collects envelopes first and only
//!    then runs them as one batch; handles become ready when it returns.
//!
//! Do not call into a `BlockingAdapter` from inside an async runtime.

use std::io;

use tokio::runtime::{Builder, Runtime};

use hbridge_common::{AdapterConfig, BridgeError, BridgeResult, RequestEnvelope};

use crate::adapter::{Adapter, PendingResponse};

/// Synchronous wrapper around [`Adapter`].
pub struct BlockingAdapter {
    adapter: Adapter,
    runtime: Runtime,
}

impl BlockingAdapter {
    pub fn new(config: AdapterConfig) -> io::Result<Self> {
        BlockingAdapter::from_adapter(Adapter::new(config))
    }

    /// Wraps an adapter built with custom pools or sessions.
    pub fn from_adapter(adapter: Adapter) -> io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(BlockingAdapter { adapter, runtime })
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Performs the request and fills `envelope.response`.
    pub fn call(&self, envelope: &mut RequestEnvelope) -> BridgeResult<()> {
        self.runtime.block_on(self.adapter.call(envelope))
    }

    /// Runs every envelope submitted inside `body` concurrently and returns
    /// once all of them have completed.
    ///
    /// ```rust,no_run
    /// use hbridge_client::BlockingAdapter;
    /// use hbridge_common::{AdapterConfig, RequestEnvelope};
    ///
    /// let client = BlockingAdapter::new(AdapterConfig::default())?;
    /// let mut handles = Vec::new();
    /// client.in_parallel(|scope| {
    ///     for url in ["http://example.com/a", "http://example.com/b"] {
    ///         handles.push(scope.submit(RequestEnvelope::get(url).unwrap()));
    ///     }
    /// })?;
    /// for handle in handles {
    ///     println!("{:?}", handle.status());
    /// }
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn in_parallel<F>(&self, body: F) -> BridgeResult<()>
    where
        F: FnOnce(&mut ParallelScope),
    {
        let mut scope = ParallelScope { queued: Vec::new() };
        body(&mut scope);

        let worker = self.adapter.clone();
        let queued = scope.queued;
        self.runtime.block_on(self.adapter.in_parallel(move || async move {
            for (envelope, pending) in queued {
                worker.dispatch(envelope, pending).await;
            }
            Ok::<_, BridgeError>(())
        }))
    }

    pub fn close(&self) {
        self.adapter.close();
    }
}

/// Collects envelopes for [`BlockingAdapter::in_parallel`].
pub struct ParallelScope {
    queued: Vec<(RequestEnvelope, PendingResponse)>,
}

impl ParallelScope {
    /// Queues `envelope`; its outcome is ready once `in_parallel` returns.
    pub fn submit(&mut self, envelope: RequestEnvelope) -> PendingResponse {
        let pending = PendingResponse::new();
        self.queued.push((envelope, pending.clone()));
        pending
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}
