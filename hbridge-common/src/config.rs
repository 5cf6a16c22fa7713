//! # Adapter Configuration
//!
//! Typed options recognised by the pools, the sessions and the response
//! adapter, with documented defaults and JSON loading.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BridgeResult;

/// Default read size for chunked-reader request bodies.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Default number of idle keep-alive connections a session retains.
pub const DEFAULT_MAX_IDLE: usize = 8;

/// What a buffered response body becomes when its charset is unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CharsetFallback {
    /// Drop the body (the response has no body).
    #[default]
    Empty,
    /// Keep the undecoded bytes.
    Raw,
}

/// Options passed to every session a pool constructs.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Deadline for each connect, read and write.
    pub read_timeout: Option<Duration>,
    /// Maximum idle keep-alive connections kept by one session.
    pub max_idle: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            read_timeout: None,
            max_idle: DEFAULT_MAX_IDLE,
        }
    }
}

/// Configuration for the adapter and its default pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    /// Reuse sessions across calls (per-thread cache) when true; open and
    /// close a session per call when false.
    pub persistent: bool,
    /// Whole-call deadline applied when a request has no override.
    pub timeout: Option<Duration>,
    /// Per I/O-operation deadline handed to session construction.
    pub read_timeout: Option<Duration>,
    /// Idle keep-alive connections retained by one session.
    pub max_idle_per_session: usize,
    /// Read size for chunked-reader request bodies.
    pub block_size: usize,
    /// Handling of malformed `charset` parameters.
    pub charset_fallback: CharsetFallback,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        AdapterConfig {
            persistent: true,
            timeout: None,
            read_timeout: None,
            max_idle_per_session: DEFAULT_MAX_IDLE,
            block_size: DEFAULT_BLOCK_SIZE,
            charset_fallback: CharsetFallback::Empty,
        }
    }
}

impl AdapterConfig {
    /// Loads a configuration from JSON; durations are given in milliseconds
    /// and missing fields keep their defaults.
    ///
    /// ```rust
    /// use std::time::Duration;
    /// use hbridge_common::AdapterConfig;
    ///
    /// let config = AdapterConfig::from_json(r#"{"timeout_ms": 250, "persistent": false}"#).unwrap();
    /// assert_eq!(config.timeout, Some(Duration::from_millis(250)));
    /// assert!(!config.persistent);
    /// ```
    pub fn from_json(input: &str) -> BridgeResult<Self> {
        let raw: RawConfig = serde_json::from_str(input)?;
        Ok(raw.into())
    }

    /// Options for sessions built under this configuration.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            read_timeout: self.read_timeout,
            max_idle: self.max_idle_per_session,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    persistent: bool,
    timeout_ms: Option<u64>,
    read_timeout_ms: Option<u64>,
    max_idle_per_session: usize,
    block_size: usize,
    charset_fallback: CharsetFallback,
}

impl Default for RawConfig {
    fn default() -> Self {
        let defaults = AdapterConfig::default();
        RawConfig {
            persistent: defaults.persistent,
            timeout_ms: None,
            read_timeout_ms: None,
            max_idle_per_session: defaults.max_idle_per_session,
            block_size: defaults.block_size,
            charset_fallback: defaults.charset_fallback,
        }
    }
}

impl From<RawConfig> for AdapterConfig {
    fn from(raw: RawConfig) -> Self {
        AdapterConfig {
            persistent: raw.persistent,
            timeout: raw.timeout_ms.map(Duration::from_millis),
            read_timeout: raw.read_timeout_ms.map(Duration::from_millis),
            max_idle_per_session: raw.max_idle_per_session,
            // A zero block size would never make progress.
            block_size: raw.block_size.max(1),
            charset_fallback: raw.charset_fallback,
        }
    }
}
