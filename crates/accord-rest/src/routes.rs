//! Route descriptors and rate-limit bucket identity
//!
//! A [`Route`] is the unit the dispatcher reasons about: HTTP method, path
//! template, and the resolved path parameters. From it two identities are
//! derived:
//!
//! - **bucket path**: `"{METHOD}-{template}"`, the client-side name under
//!   which the server-assigned bucket hash is learned and cached
//! - **bucket key**: hash plus the major parameters, naming one concrete
//!   rate-limit partition in the [`BucketRegistry`](crate::registry::BucketRegistry)
//!
//! ## Delete-message partitions
//!
//! Deleting a message is penalized differently by the server depending on
//! the message's age, so the same nominal route maps to up to three
//! partitions: recent messages (under ~10 seconds), ordinary messages, and
//! old messages (over two weeks). The age comes from the snowflake ID's
//! embedded creation time.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use reqwest::Method;

/// Milliseconds between the Unix epoch and the snowflake epoch (2015-01-01)
const SNOWFLAKE_EPOCH_MS: i64 = 1_420_070_400_000;

/// Messages younger than this get their own delete-message partition
const NEW_MESSAGE_THRESHOLD: Duration = Duration::from_secs(10);

/// Messages older than this get the penalized delete-message partition
const OLD_MESSAGE_THRESHOLD: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Major parameters, in the fixed order they contribute to a bucket key.
///
/// The order is by parameter name, never by insertion order, so identical
/// logical routes always produce identical keys.
const MAJOR_PARAMS: [&str; 4] = ["channel_id", "guild_id", "webhook_id", "webhook_token"];

/// Extracts the creation time embedded in a snowflake ID.
///
/// Snowflakes carry their creation timestamp in the upper bits:
/// milliseconds since the snowflake epoch, shifted left by 22.
pub fn snowflake_timestamp(id: u64) -> DateTime<Utc> {
    let ms = (id >> 22) as i64 + SNOWFLAKE_EPOCH_MS;
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

// ============================================================================
// Route
// ============================================================================

/// A route descriptor: method, path template, and resolved parameters
///
/// Built by endpoint glue code and handed to
/// [`RestClient::dispatch`](crate::dispatch::RestClient::dispatch). The
/// template keeps its `{name}` placeholders; [`Route::path`] substitutes the
/// resolved values when the request is actually sent.
///
/// Routes created with [`Route::absolute`] target a foreign host and bypass
/// the rate-limit governor entirely.
#[derive(Debug, Clone)]
pub struct Route {
    /// HTTP method
    method: Method,
    /// Path template relative to the API base URL, e.g.
    /// `/channels/{channel_id}/messages/{message_id}`
    template: String,
    /// Resolved path parameter values, keyed by placeholder name
    params: HashMap<String, String>,
    /// Absolute URL for untracked foreign-host calls
    absolute: Option<String>,
}

impl Route {
    /// Creates a route for the governed API from a path template.
    ///
    /// # Arguments
    /// * `method` - HTTP method
    /// * `template` - Path template with `{name}` placeholders
    pub fn new(method: Method, template: impl Into<String>) -> Self {
        Self {
            method,
            template: template.into(),
            params: HashMap::new(),
            absolute: None,
        }
    }

    /// Creates an untracked route targeting an absolute URL.
    ///
    /// Calls to hosts other than the governed API bypass the whole
    /// rate-limit subsystem: no bucket bookkeeping, and no credentials are
    /// attached to the outgoing request.
    pub fn absolute(method: Method, url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            method,
            template: url.clone(),
            params: HashMap::new(),
            absolute: Some(url),
        }
    }

    /// Resolves a path parameter value for a `{name}` placeholder.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the path template (or the absolute URL for untracked routes).
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Returns a resolved parameter value, if present.
    pub fn param_value(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Whether this route is subject to rate-limit accounting.
    ///
    /// Only same-origin calls to the governed API are tracked; absolute
    /// routes to other hosts bypass the governor.
    pub fn is_tracked(&self) -> bool {
        self.absolute.is_none()
    }

    /// Returns the absolute URL for untracked routes.
    pub fn absolute_url(&self) -> Option<&str> {
        self.absolute.as_deref()
    }

    /// Substitutes resolved parameters into the template.
    ///
    /// Placeholders without a resolved value are left as-is; the server will
    /// reject such a path, which surfaces as an API error rather than a
    /// silent misroute.
    pub fn path(&self) -> String {
        let mut path = self.template.clone();
        for (name, value) in &self.params {
            path = path.replace(&format!("{{{}}}", name), value);
        }
        path
    }

    // ========================================================================
    // Bucket identity
    // ========================================================================

    /// Computes the bucket path: `"{METHOD}-{template}"`.
    ///
    /// For message deletion the server applies a graduated penalty by
    /// message age, so a distinguishing suffix is appended for very new
    /// (under 10 seconds) and very old (over two weeks) messages, producing
    /// three distinct partitions for the one nominal route.
    pub fn bucket_path(&self) -> String {
        let mut bucket_path = format!("{}-{}", self.method, self.template);

        if self.method == Method::DELETE && self.template.ends_with("/messages/{message_id}") {
            if let Some(age) = self.message_age() {
                if age >= OLD_MESSAGE_THRESHOLD {
                    bucket_path.push_str("/old-message");
                } else if age <= NEW_MESSAGE_THRESHOLD {
                    bucket_path.push_str("/new-message");
                }
            }
        }

        bucket_path
    }

    /// Computes the bucket key from a resolved bucket hash.
    ///
    /// The key is the hash, a `.` separator, then the trimmed values of the
    /// major parameters present on this route, joined by `-` in the fixed
    /// [`MAJOR_PARAMS`] order with the trailing separator stripped.
    pub fn bucket_key(&self, hash: &str) -> String {
        let mut majors = String::new();
        for name in MAJOR_PARAMS {
            if let Some(value) = self.params.get(name) {
                majors.push_str(value.trim());
                majors.push('-');
            }
        }
        let majors = majors.trim_end_matches('-');
        format!("{}.{}", hash, majors)
    }

    /// Age of the target message, for the delete-message special case.
    fn message_age(&self) -> Option<Duration> {
        let id: u64 = self.params.get("message_id")?.trim().parse().ok()?;
        let created = snowflake_timestamp(id);
        (Utc::now() - created).to_std().ok()
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.template)
    }
}
