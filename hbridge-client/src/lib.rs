//! # HybridBridge Client
//!
//! Purpose: Service a generic request/response envelope API with pooled,
//! asynchronous HTTP sessions.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Sessions are reused per destination host
//!    instead of being opened per call.
//! 2. **Facade Pattern**: `Adapter` and `BlockingAdapter` hide pooling,
//!    deadlines, batching and error normalization.
//! 3. **Scoped Resources**: Leases and deadlines release sessions on every
//!    exit path, including cancellation.
//! 4. **Stable Failures**: Callers see `Timeout`, `TlsFailure` and
//!    `ConnectionFailed` regardless of the underlying cause.

mod adapt;
mod adapter;
mod batch;
mod blocking;
mod pool;
mod timeout;
mod translate;

pub use adapter::{Adapter, AdapterBuilder, PendingResponse};
pub use batch::BatchCoordinator;
pub use blocking::{BlockingAdapter, ParallelScope};
pub use pool::{
    EphemeralPool, Lease, PerContextCache, PoolFactory, PoolOptions, SessionDecorator, SessionFactory, SessionPool,
    SharedCache,
};
