//! The per-request dispatch/retry state machine
//!
//! [`RestClient::dispatch`] is the single primitive the endpoint glue layer
//! consumes. For every call it:
//!
//! 1. Classifies the route: only same-origin calls to the governed API are
//!    subject to rate-limit accounting; absolute routes bypass everything.
//! 2. Waits out the global bucket if the account-wide limit is active, then
//!    acquires the per-route bucket's send permit (queueing FIFO behind
//!    earlier dispatches), pre-emptively locking the bucket when this
//!    dispatch consumes its final permit.
//! 3. Sends the request, learns the server-assigned bucket hash, and merges
//!    the rate-limit headers into the bucket.
//! 4. Transparently retries on 429 (re-queued at the front of its bucket, or
//!    on the global bucket for account-wide limits) and on 502 (bounded,
//!    fixed-delay resends); every other non-2xx surfaces as a typed error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::bucket::BucketPermit;
use crate::config::RestConfig;
use crate::headers::RateLimitHeaders;
use crate::registry::BucketRegistry;
use crate::routes::Route;
use crate::RestError;

/// Header carrying the audit-log reason for mutating requests
const HEADER_AUDIT_LOG_REASON: &str = "X-Audit-Log-Reason";

/// Backoff applied when a 429 carries no usable retry delay.
///
/// A zero-duration lock would unlock the bucket and the retry would resend
/// immediately, so the fallback must stay non-zero.
const RATELIMIT_FALLBACK_DELAY: Duration = Duration::from_secs(1);

// ============================================================================
// DispatchOptions
// ============================================================================

/// Per-call options for [`RestClient::dispatch`]
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// JSON request body
    pub body: Option<serde_json::Value>,
    /// Query-string parameters
    pub query: Vec<(String, String)>,
    /// Audit-log reason attached as a request header
    pub audit_log_reason: Option<String>,
    /// Reject immediately with [`RestError::Ratelimited`] on a 429 instead
    /// of retrying automatically
    pub error_on_ratelimit: bool,
}

impl DispatchOptions {
    /// Creates empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the JSON request body.
    pub fn json_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Appends a query-string parameter.
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Sets the audit-log reason header.
    pub fn audit_log_reason(mut self, reason: impl Into<String>) -> Self {
        self.audit_log_reason = Some(reason.into());
        self
    }

    /// Opts this call out of automatic 429 handling.
    pub fn error_on_ratelimit(mut self) -> Self {
        self.error_on_ratelimit = true;
        self
    }
}

// ============================================================================
// RawResponse
// ============================================================================

/// A successful response with lazily decoded body
///
/// The body is buffered (the 429 path already needs it), but decoding into
/// JSON or text happens only when the caller asks.
#[derive(Debug, Clone)]
pub struct RawResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl RawResponse {
    /// HTTP status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Decodes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, RestError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Decodes the body as UTF-8 text (lossily).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Raw body bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.body
    }
}

// ============================================================================
// RestClient
// ============================================================================

/// REST dispatcher with client-side rate-limit governance
///
/// Owns the bucket registry, the global bucket, and the learned
/// `bucket_path -> hash` table; all three live exactly as long as the client
/// instance. Cheap to share behind an `Arc`.
///
/// Must be created inside a Tokio runtime (the registry sweep task is
/// spawned at construction).
#[derive(Debug)]
pub struct RestClient {
    /// Underlying HTTP transport
    http: Client,
    /// Client configuration
    config: RestConfig,
    /// Per-route buckets plus the global bucket
    registry: Arc<BucketRegistry>,
    /// Learned bucket hashes, keyed by bucket path (bot mode only)
    hashes: Mutex<HashMap<String, String>>,
}

impl RestClient {
    /// Creates a client from the given configuration.
    pub fn new(config: RestConfig) -> Self {
        let registry = BucketRegistry::new(config.bucket_expiry, config.sweep_interval);
        Self {
            http: Client::new(),
            config,
            registry,
            hashes: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the bucket registry.
    pub fn registry(&self) -> &Arc<BucketRegistry> {
        &self.registry
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &RestConfig {
        &self.config
    }

    /// Returns the learned bucket hash for a bucket path, if any.
    pub fn learned_hash(&self, bucket_path: &str) -> Option<String> {
        self.hashes.lock().unwrap().get(bucket_path).cloned()
    }

    /// Resolves the bucket hash for a route.
    ///
    /// Bot credentials must have learned the hash from a prior response; a
    /// miss means the route has no bucket yet and the request proceeds
    /// unthrottled the first time. Ordinary-user credentials use the bucket
    /// path itself as the hash, available immediately.
    fn bucket_hash(&self, bucket_path: &str) -> Option<String> {
        if self.config.is_bot() {
            self.learned_hash(bucket_path)
        } else {
            Some(bucket_path.to_string())
        }
    }

    // ========================================================================
    // dispatch
    // ========================================================================

    /// Dispatches one request through the rate-limit governor.
    ///
    /// Resolves with the raw response once the request eventually succeeds,
    /// or rejects with a typed [`RestError`]. 429s are retried transparently
    /// (unless `error_on_ratelimit` is set) and 502s are resent a bounded
    /// number of times; no other outcome is recovered locally.
    pub async fn dispatch(
        &self,
        route: Route,
        options: DispatchOptions,
    ) -> Result<RawResponse, RestError> {
        if !route.is_tracked() {
            return self.dispatch_untracked(&route, &options).await;
        }

        let bucket_path = route.bucket_path();
        debug!(route = %route, bucket_path, "Dispatching request");

        // Permit carried across 429 re-queues; dropping it on any return
        // path releases the bucket's next queued dispatch.
        let mut held: Option<BucketPermit> = None;
        let mut attempts: u32 = 1;

        loop {
            // The global limit preempts every route; while it is locked,
            // queue there and skip per-route bookkeeping for this attempt.
            while self.registry.global().is_locked() {
                let checkpoint = self.registry.global().acquire().await;
                drop(checkpoint);
            }

            if held.is_none() {
                if let Some(hash) = self.bucket_hash(&bucket_path) {
                    if let Some(bucket) = self.registry.get(&route.bucket_key(&hash)) {
                        let permit = bucket.acquire().await;
                        // This dispatch consumes the window's final permit;
                        // hold later arrivals until the window rolls over.
                        if bucket.remaining() == Some(1) {
                            let delay = bucket.time_until_reset();
                            if !delay.is_zero() {
                                bucket.lock(delay);
                            }
                        }
                        held = Some(permit);
                    }
                }
            }

            let response = self.send(&route, &options).await?;
            let status = response.status();
            let headers = response.headers().clone();
            let rl = RateLimitHeaders::parse(&headers);

            // Learn the server-assigned hash before resolving the bucket, so
            // a first response creates its bucket under the right key.
            if self.config.is_bot() {
                if let Some(hash) = &rl.bucket {
                    let mut hashes = self.hashes.lock().unwrap();
                    if hashes.get(&bucket_path).map(String::as_str) != Some(hash) {
                        debug!(bucket_path, hash, "Learned bucket hash");
                        hashes.insert(bucket_path.clone(), hash.clone());
                    }
                }
            }

            let resolved = if rl.has_bucket_info() || status == StatusCode::TOO_MANY_REQUESTS {
                self.bucket_hash(&bucket_path)
                    .map(|hash| self.registry.get_or_create(&route.bucket_key(&hash)))
            } else {
                None
            };

            if let Some(bucket) = &resolved {
                bucket.set_ratelimit(rl.limit, rl.remaining, rl.reset_at, rl.reset_after);
                // The window is spent; a next send would 429 with near
                // certainty, so hold the bucket until the reported reset.
                if rl.remaining == Some(0) && status != StatusCode::TOO_MANY_REQUESTS {
                    bucket.lock(rl.reset_after.unwrap_or_default());
                }
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                let body = response.bytes().await?;
                let delay = match rl.retry_delay().filter(|d| !d.is_zero()) {
                    Some(delay) => delay,
                    None => {
                        warn!(route = %route, "429 without a usable retry delay");
                        RATELIMIT_FALLBACK_DELAY
                    }
                };
                let global = global_limit_hit(self.config.is_bot(), &rl, &body);
                warn!(
                    route = %route,
                    delay_ms = delay.as_millis() as u64,
                    global,
                    "Rate limited"
                );

                if options.error_on_ratelimit {
                    let bucket = resolved
                        .map(|b| b.key().to_string())
                        .unwrap_or_else(|| bucket_path.clone());
                    return Err(RestError::Ratelimited {
                        bucket,
                        retry_after: delay,
                        global,
                    });
                }

                if global {
                    // Account-wide: hold every route, re-queue this dispatch
                    // on the global bucket.
                    drop(held.take());
                    let global_bucket = self.registry.global();
                    global_bucket.lock(delay);
                    let checkpoint = global_bucket.acquire().await;
                    drop(checkpoint);
                    continue;
                }

                // Route-scoped: the bucket model must be able to name the
                // partition to requeue against; if it cannot, it has
                // desynchronized from the server and silent retry would loop
                // forever.
                let Some(bucket) = resolved else {
                    return Err(RestError::BucketDesync { route: bucket_path });
                };
                bucket.force_exhausted();
                bucket.lock(delay);
                // The front slot is reserved before the permit is released,
                // so no later arrival can be granted in between, whatever
                // the lock state.
                let pending = bucket.enqueue_front();
                drop(held.take());
                held = Some(pending.wait().await);
                continue;
            }

            if status == StatusCode::BAD_GATEWAY {
                attempts += 1;
                if attempts > self.config.gateway_retry_limit + 1 {
                    return Err(RestError::GatewayUnavailable { attempts: attempts - 1 });
                }
                warn!(route = %route, attempts, "Bad gateway, resending");
                // Resent outside the bucket queue: the permit stays held so
                // no other dispatch interleaves on this bucket meanwhile.
                tokio::time::sleep(self.config.gateway_retry_delay).await;
                continue;
            }

            let body = response.bytes().await?.to_vec();
            if !status.is_success() {
                return Err(decode_error(status, &headers, body));
            }

            return Ok(RawResponse {
                status,
                headers,
                body,
            });
        }
    }

    /// Sends a call to a foreign host, bypassing the governor entirely.
    async fn dispatch_untracked(
        &self,
        route: &Route,
        options: &DispatchOptions,
    ) -> Result<RawResponse, RestError> {
        if let Some(raw) = route.absolute_url() {
            if let Ok(parsed) = Url::parse(raw) {
                debug!(
                    host = parsed.host_str().unwrap_or_default(),
                    "Dispatching untracked request"
                );
            }
        }

        let response = self.send(route, options).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        if !status.is_success() {
            return Err(decode_error(status, &headers, body));
        }
        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }

    /// Builds and sends the HTTP request for a route.
    ///
    /// Credentials and the audit-log reason are attached only for tracked
    /// routes; they must never leak to foreign hosts.
    async fn send(
        &self,
        route: &Route,
        options: &DispatchOptions,
    ) -> Result<Response, reqwest::Error> {
        let url = match route.absolute_url() {
            Some(absolute) => absolute.to_string(),
            None => format!("{}{}", self.config.base_url, route.path()),
        };

        let mut request = self.http.request(route.method().clone(), &url);
        if route.is_tracked() {
            if let Some(auth) = &self.config.auth {
                request = request.header(AUTHORIZATION, auth.header_value());
            }
            if let Some(reason) = &options.audit_log_reason {
                request = request.header(HEADER_AUDIT_LOG_REASON, reason);
            }
        }
        if !options.query.is_empty() {
            request = request.query(&options.query);
        }
        if let Some(body) = &options.body {
            request = request.json(body);
        }

        request.send().await
    }
}

// ============================================================================
// Response interpretation helpers
// ============================================================================

/// Structured error body from the governed API
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    /// Machine-readable error code
    code: Option<u64>,
    /// Human-readable message
    message: Option<String>,
    /// Nested per-field errors
    errors: Option<serde_json::Value>,
}

/// 429 body carrying the global-limit flag for ordinary-user credentials
#[derive(Debug, Deserialize)]
struct RatelimitBody {
    #[serde(default)]
    global: bool,
}

/// Determines whether a 429 hit the account-wide global limit.
///
/// Bot responses carry a dedicated header flag. Ordinary-user responses
/// signal it in the JSON body, trusted only when the marker header
/// identifies a genuine upstream response rather than an intermediary proxy.
fn global_limit_hit(is_bot: bool, rl: &RateLimitHeaders, body: &[u8]) -> bool {
    if is_bot {
        return rl.global;
    }
    if !rl.upstream {
        return false;
    }
    serde_json::from_slice::<RatelimitBody>(body)
        .map(|b| b.global)
        .unwrap_or(false)
}

/// Decodes a non-2xx, non-retried response into a typed error.
///
/// JSON bodies carrying a machine code (optionally with nested per-field
/// errors) become [`RestError::Api`]; everything else becomes
/// [`RestError::Http`] with the raw body as a best-effort message.
fn decode_error(status: StatusCode, headers: &HeaderMap, body: Vec<u8>) -> RestError {
    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));

    if is_json {
        if let Ok(api) = serde_json::from_slice::<ApiErrorBody>(&body) {
            if api.code.is_some() || api.errors.is_some() {
                return RestError::Api {
                    status: status.as_u16(),
                    code: api.code,
                    message: api.message.unwrap_or_default(),
                    errors: api.errors,
                };
            }
        }
    }

    RestError::Http {
        status: status.as_u16(),
        message: String::from_utf8_lossy(&body).into_owned(),
    }
}
