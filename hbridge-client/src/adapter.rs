//! # Adapter
//!
//! Purpose: The single entry point a calling framework uses: resolve a
//! session, send the envelope's request, and fill the envelope's response.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Adapter` hides pools, translation, deadlines and
//!    batching behind `call`, `submit` and `close`.
//! 2. **Cheap Clones**: State lives behind an `Arc`, so batch operations can
//!    carry their own handle.
//! 3. **One Error Boundary**: Transport failures are normalized when they
//!    cross into `call`; nothing is retried.
//!
//! ## Call Path
//!
//! ```text
//! call(envelope)
//!   └── guard(deadline)
//!         ├── pool.checkout / checkout_proxied -> Lease
//!         ├── translate(envelope)              -> TransportRequest
//!         ├── lease.send(request)              -> TransportResponse
//!         └── adapt(response, envelope)
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use hbridge_common::{AdapterConfig, BridgeResult, RequestEnvelope};

use crate::adapt::adapt;
use crate::batch::BatchCoordinator;
use crate::pool::{
    EphemeralPool, PerContextCache, PoolFactory, PoolOptions, SessionDecorator, SessionFactory, SessionPool,
};
use crate::timeout::{effective_deadline, guard};
use crate::translate::translate;

/// Builder for [`Adapter`].
pub struct AdapterBuilder {
    config: AdapterConfig,
    pool: Option<PoolFactory>,
    session_factory: Option<SessionFactory>,
    decorator: Option<SessionDecorator>,
}

impl AdapterBuilder {
    pub fn new(config: AdapterConfig) -> Self {
        AdapterBuilder {
            config,
            pool: None,
            session_factory: None,
            decorator: None,
        }
    }

    /// Replaces the default pooling policy.
    pub fn pool(mut self, factory: PoolFactory) -> Self {
        self.pool = Some(factory);
        self
    }

    /// Replaces the default HTTP/1.1 session constructor.
    pub fn session_factory(mut self, factory: SessionFactory) -> Self {
        self.session_factory = Some(factory);
        self
    }

    /// Wraps every newly built session.
    pub fn decorator(mut self, decorator: SessionDecorator) -> Self {
        self.decorator = Some(decorator);
        self
    }

    pub fn build(self) -> Adapter {
        let options = PoolOptions {
            session: self.config.session_options(),
            factory: self.session_factory,
            decorator: self.decorator,
        };
        let pool: Arc<dyn SessionPool> = match self.pool {
            Some(factory) => factory(options),
            None if self.config.persistent => Arc::new(PerContextCache::new(options)),
            None => Arc::new(EphemeralPool::new(options)),
        };
        debug!(persistent = self.config.persistent, "adapter created");

        Adapter {
            inner: Arc::new(AdapterInner {
                config: self.config,
                pool,
                batch: BatchCoordinator::new(),
            }),
        }
    }
}

struct AdapterInner {
    config: AdapterConfig,
    pool: Arc<dyn SessionPool>,
    batch: BatchCoordinator,
}

/// Services request envelopes through pooled transport sessions.
#[derive(Clone)]
pub struct Adapter {
    inner: Arc<AdapterInner>,
}

impl Adapter {
    pub fn new(config: AdapterConfig) -> Self {
        AdapterBuilder::new(config).build()
    }

    pub fn builder(config: AdapterConfig) -> AdapterBuilder {
        AdapterBuilder::new(config)
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &Arc<dyn SessionPool> {
        &self.inner.pool
    }

    pub fn batch(&self) -> &BatchCoordinator {
        &self.inner.batch
    }

    /// Performs the envelope's request and writes the response into it.
    ///
    /// # Errors
    /// `Timeout`, `TlsFailure` and `ConnectionFailed` for the normalized
    /// transport failures; other transport errors pass through as
    /// `Transport`. `PoolClosed` after [`Adapter::close`].
    pub async fn call(&self, envelope: &mut RequestEnvelope) -> BridgeResult<()> {
        let deadline = effective_deadline(envelope.timeout, self.inner.config.timeout);
        let result = guard(deadline, self.perform(envelope)).await;
        if let Err(err) = &result {
            debug!(url = %envelope.url, kind = ?err.kind(), error = %err, "call failed");
        }
        result
    }

    async fn perform(&self, envelope: &mut RequestEnvelope) -> BridgeResult<()> {
        let pool = &self.inner.pool;
        let lease = match &envelope.proxy {
            Some(proxy) => pool.checkout_proxied(proxy, &envelope.url)?,
            None => pool.checkout(&envelope.url)?,
        };

        let request = translate(envelope, self.inner.config.block_size);
        let response = lease.send(request).await?;
        adapt(response, envelope, self.inner.config.charset_fallback).await
    }

    /// Performs `envelope` as part of the calling task's running batch, or
    /// inline when the task is not inside one. The outcome lands in the
    /// returned handle.
    pub async fn submit(&self, envelope: RequestEnvelope) -> PendingResponse {
        let pending = PendingResponse::new();
        self.dispatch(envelope, pending.clone()).await;
        pending
    }

    pub(crate) async fn dispatch(&self, envelope: RequestEnvelope, pending: PendingResponse) {
        let adapter = self.clone();
        let op = async move {
            let mut envelope = envelope;
            let outcome = adapter.call(&mut envelope).await.map(|()| envelope);
            pending.fill(outcome);
        };
        self.inner.batch.run(op).await;
    }

    /// Runs `body` as a batch: every `submit` inside it runs concurrently
    /// and this returns once all of them have finished.
    pub async fn in_parallel<F, Fut, T>(&self, body: F) -> BridgeResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BridgeResult<T>>,
    {
        self.inner.batch.execute(body).await
    }

    /// Closes every session held by the pool.
    pub fn close(&self) {
        self.inner.pool.close();
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("config", &self.inner.config)
            .field("batch", &self.inner.batch)
            .finish()
    }
}

type Slot = Arc<Mutex<Option<BridgeResult<RequestEnvelope>>>>;

/// Handle to the outcome of a submitted envelope.
///
/// Ready once the batch that ran it has finished (immediately for inline
/// submissions). The envelope comes back with its response slot filled.
#[derive(Clone, Default)]
pub struct PendingResponse {
    slot: Slot,
}

impl PendingResponse {
    pub(crate) fn new() -> Self {
        PendingResponse::default()
    }

    fn fill(&self, outcome: BridgeResult<RequestEnvelope>) {
        *self.slot.lock() = Some(outcome);
    }

    pub fn is_ready(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Status code of a completed successful call.
    pub fn status(&self) -> Option<u16> {
        match self.slot.lock().as_ref() {
            Some(Ok(envelope)) => envelope.response.as_ref().map(|response| response.status),
            _ => None,
        }
    }

    /// Takes the outcome, leaving the handle empty.
    pub fn take(&self) -> Option<BridgeResult<RequestEnvelope>> {
        self.slot.lock().take()
    }
}

impl fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResponse").field("ready", &self.is_ready()).finish()
    }
}
