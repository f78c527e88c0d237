//! Client configuration and credentials

use std::time::Duration;

/// Default API base URL
const DEFAULT_BASE_URL: &str = "https://discord.com/api/v10";

/// Default idle window before an unused bucket is evicted
const DEFAULT_BUCKET_EXPIRY: Duration = Duration::from_secs(300);

/// Default interval between registry sweeps
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default bound on 502 resends
const DEFAULT_GATEWAY_RETRY_LIMIT: u32 = 3;

/// Default fixed delay between 502 resends
const DEFAULT_GATEWAY_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Credentials for the governed API
///
/// The variant also selects how bucket hashes are resolved: bot credentials
/// learn the hash from response headers, while bearer (ordinary-user)
/// credentials use the bucket path itself as the hash with no learning phase.
#[derive(Debug, Clone)]
pub enum Auth {
    /// Elevated bot-style credentials (`Authorization: Bot <token>`)
    Bot(String),
    /// Ordinary-user bearer credentials (`Authorization: Bearer <token>`)
    Bearer(String),
}

impl Auth {
    /// Renders the `Authorization` header value.
    pub fn header_value(&self) -> String {
        match self {
            Auth::Bot(token) => format!("Bot {}", token),
            Auth::Bearer(token) => format!("Bearer {}", token),
        }
    }

    /// Whether these are bot-style credentials.
    pub fn is_bot(&self) -> bool {
        matches!(self, Auth::Bot(_))
    }
}

/// Configuration for [`RestClient`](crate::dispatch::RestClient)
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Base URL that tracked routes are resolved against
    pub base_url: String,
    /// Credentials attached to tracked requests; `None` dispatches
    /// unauthenticated
    pub auth: Option<Auth>,
    /// Idle window before an unused bucket is evicted from the registry
    pub bucket_expiry: Duration,
    /// How often the registry sweeps for idle buckets
    pub sweep_interval: Duration,
    /// How many times a 502 is resent before surfacing the error
    pub gateway_retry_limit: u32,
    /// Fixed delay between 502 resends
    pub gateway_retry_delay: Duration,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            auth: None,
            bucket_expiry: DEFAULT_BUCKET_EXPIRY,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            gateway_retry_limit: DEFAULT_GATEWAY_RETRY_LIMIT,
            gateway_retry_delay: DEFAULT_GATEWAY_RETRY_DELAY,
        }
    }
}

impl RestConfig {
    /// Sets the base URL (useful for pointing tests at a mock server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        self.base_url = base_url;
        self
    }

    /// Sets the credentials.
    pub fn with_auth(mut self, auth: Auth) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Sets the bucket idle-eviction window.
    pub fn with_bucket_expiry(mut self, expiry: Duration) -> Self {
        self.bucket_expiry = expiry;
        self
    }

    /// Sets the registry sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Sets the 502 retry policy.
    pub fn with_gateway_retry(mut self, limit: u32, delay: Duration) -> Self {
        self.gateway_retry_limit = limit;
        self.gateway_retry_delay = delay;
        self
    }

    /// Whether the configured credentials are bot-style (learned-hash mode).
    pub fn is_bot(&self) -> bool {
        self.auth.as_ref().is_some_and(Auth::is_bot)
    }
}
