// hbridge-common - Shared types for the HybridBridge HTTP client bridge
//
// This crate defines the pooling keys, the request/response envelopes and the
// error taxonomy shared by the transport and the client crates.

pub mod config;
pub mod endpoint;
pub mod envelope;
pub mod error;

// Re-export for convenience
pub use config::*;
pub use endpoint::*;
pub use envelope::*;
pub use error::*;
