//! Typed view over rate-limit response headers
//!
//! All consumption is case-insensitive (reqwest's `HeaderMap` lower-cases
//! names). The fractional `X-RateLimit-Reset-After` value is preferred over
//! the legacy `Retry-After` (integer seconds or HTTP-date) when computing a
//! retry delay.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;

/// Server-assigned opaque bucket hash for the route
pub const HEADER_BUCKET: &str = "x-ratelimit-bucket";
/// Request ceiling for the current window
pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
/// Requests left in the current window
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
/// Absolute window reset time, float epoch seconds
pub const HEADER_RESET: &str = "x-ratelimit-reset";
/// Delta until the window resets, float seconds
pub const HEADER_RESET_AFTER: &str = "x-ratelimit-reset-after";
/// Present when the account-wide global limit was hit
pub const HEADER_GLOBAL: &str = "x-ratelimit-global";
/// Legacy retry delay, integer seconds or an HTTP-date
pub const HEADER_RETRY_AFTER: &str = "retry-after";
/// Marker distinguishing genuine upstream responses from intermediary proxies
pub const HEADER_VIA: &str = "via";

/// Parsed rate-limit headers from one response
///
/// Every field is optional: untracked endpoints, proxies, and error pages
/// may omit any subset, and unparseable values degrade to absent rather
/// than failing the request.
#[derive(Debug, Clone, Default)]
pub struct RateLimitHeaders {
    /// Server-assigned bucket hash, used to learn `bucket_path -> hash`
    pub bucket: Option<String>,
    /// Request ceiling for the window
    pub limit: Option<u32>,
    /// Requests left in the window
    pub remaining: Option<u32>,
    /// Absolute reset time in server clock terms
    pub reset_at: Option<DateTime<Utc>>,
    /// Delta until the window resets
    pub reset_after: Option<Duration>,
    /// Whether the global-limit flag was set
    pub global: bool,
    /// Legacy retry delay
    pub retry_after: Option<Duration>,
    /// Whether the marker header identifying a genuine upstream response
    /// was present
    pub upstream: bool,
}

impl RateLimitHeaders {
    /// Parses the rate-limit headers out of a response header map.
    pub fn parse(headers: &HeaderMap) -> Self {
        Self {
            bucket: header_str(headers, HEADER_BUCKET).map(str::to_string),
            limit: header_str(headers, HEADER_LIMIT).and_then(|v| v.trim().parse().ok()),
            remaining: header_str(headers, HEADER_REMAINING).and_then(|v| v.trim().parse().ok()),
            reset_at: header_str(headers, HEADER_RESET)
                .and_then(|v| v.trim().parse::<f64>().ok())
                .and_then(epoch_secs_to_datetime),
            reset_after: header_str(headers, HEADER_RESET_AFTER)
                .and_then(|v| v.trim().parse::<f64>().ok())
                .and_then(secs_to_duration),
            global: headers.contains_key(HEADER_GLOBAL),
            retry_after: header_str(headers, HEADER_RETRY_AFTER).and_then(parse_retry_after),
            upstream: headers.contains_key(HEADER_VIA),
        }
    }

    /// Whether the response advertised any bucket state worth tracking.
    pub fn has_bucket_info(&self) -> bool {
        self.bucket.is_some()
            || self.limit.is_some()
            || self.remaining.is_some()
            || self.reset_after.is_some()
    }

    /// The delay to wait before retrying a 429.
    ///
    /// Prefers the fractional reset-after value; falls back to the legacy
    /// retry-after.
    pub fn retry_delay(&self) -> Option<Duration> {
        self.reset_after.or(self.retry_after)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Parses a `Retry-After` value: integer seconds, or an HTTP-date.
///
/// A date already in the past carries no usable delay and degrades to
/// absent.
fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let date = DateTime::parse_from_rfc2822(value).ok()?;
    (date.with_timezone(&Utc) - Utc::now()).to_std().ok()
}

/// Float seconds to Duration, rejecting negative/non-finite values.
fn secs_to_duration(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}

/// Float epoch seconds to an absolute timestamp.
fn epoch_secs_to_datetime(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    Utc.timestamp_millis_opt((secs * 1000.0) as i64).single()
}
