//! Accord REST - Discord REST dispatch core
//!
//! Provides the rate-limit governor that sits between typed endpoint methods
//! and the HTTP transport:
//! - Per-route rate-limit buckets learned from response headers
//! - A registry of buckets with idle eviction
//! - The account-wide global limit that preempts every route
//! - The per-request dispatch/retry state machine (429 and 502 handling)
//!
//! Endpoint-specific methods (the hundreds of calls that build bodies, query
//! strings, and paths from typed options) live in higher-level crates; they
//! all funnel through [`RestClient::dispatch`].
//!
//! ## Modules
//!
//! - [`routes`] - Route descriptors and bucket identity derivation
//! - [`bucket`] - Per-partition rate-limit state and the FIFO send queue
//! - [`registry`] - Expiring bucket map plus the global bucket
//! - [`headers`] - Typed view over the `X-RateLimit-*` response headers
//! - [`config`] - Client configuration and credentials
//! - [`dispatch`] - The [`RestClient`] request state machine

pub mod bucket;
pub mod config;
pub mod dispatch;
pub mod headers;
pub mod registry;
pub mod routes;

pub use bucket::RateLimitBucket;
pub use config::{Auth, RestConfig};
pub use dispatch::{DispatchOptions, RawResponse, RestClient};
pub use headers::RateLimitHeaders;
pub use registry::BucketRegistry;
pub use routes::Route;

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the REST dispatch core
///
/// The core never logs-and-suppresses: every request resolves with a
/// response or rejects with one of these. Automatic recovery happens only
/// for 429s (unless the caller opted out) and for a bounded number of 502s.
#[derive(Debug, Error)]
pub enum RestError {
    /// A 429 was received and the caller requested immediate rejection
    /// instead of automatic retry (`error_on_ratelimit`)
    #[error("rate limited on {bucket} (global: {global}), retry after {retry_after:?}")]
    Ratelimited {
        /// Bucket key (or route path when no bucket was resolvable yet)
        bucket: String,
        /// Server-suggested delay before retrying
        retry_after: Duration,
        /// Whether the account-wide global limit was hit
        global: bool,
    },

    /// Upstream gateway errors (502) persisted past the bounded retry count
    #[error("bad gateway after {attempts} attempts")]
    GatewayUnavailable {
        /// Number of send attempts made before giving up
        attempts: u32,
    },

    /// Non-2xx response carrying a structured JSON error with a machine code
    #[error("API error {status} (code {code:?}): {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Machine-readable API error code
        code: Option<u64>,
        /// Human-readable message from the API
        message: String,
        /// Nested per-field errors, when the API provided them
        errors: Option<serde_json::Value>,
    },

    /// Non-2xx response without a structured JSON body
    #[error("HTTP {status}: {message}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Best-effort message (raw body text)
        message: String,
    },

    /// A 429 occurred but no bucket could be resolved to requeue against;
    /// the local bucket model has desynchronized from server behavior
    #[error("rate limited on {route} but no bucket is resolvable")]
    BucketDesync {
        /// Bucket path of the offending route
        route: String,
    },

    /// A network-level transport error occurred
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// A response body could not be decoded as the requested type
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
}
