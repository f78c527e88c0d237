//! Expiring bucket registry and the account-wide global bucket
//!
//! The [`BucketRegistry`] owns every [`RateLimitBucket`]; the dispatcher only
//! borrows `Arc` references out of it. Buckets are created lazily the first
//! time a response for their route needs one, and evicted by a background
//! sweep once they have been idle past the expiry window. A bucket that is
//! locked, has queued dispatches, or has a send in flight is never evicted.
//!
//! The global bucket lives outside the map under a reserved key: it is always
//! present, never evicted, and checked first by every tracked dispatch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::debug;

use crate::bucket::RateLimitBucket;

/// Reserved key of the account-wide global bucket.
pub const GLOBAL_BUCKET_KEY: &str = "global";

/// Expiring map from bucket key to [`RateLimitBucket`]
///
/// Shared as `Arc<BucketRegistry>`; construction spawns the sweep task, so a
/// registry must be created inside a Tokio runtime. The sweep holds only a
/// [`Weak`] handle and exits once the registry itself is dropped, so it never
/// keeps an otherwise-idle client alive.
#[derive(Debug)]
pub struct BucketRegistry {
    /// Per-route buckets, keyed by hash + major parameters
    buckets: Mutex<HashMap<String, Arc<RateLimitBucket>>>,
    /// The always-present account-wide bucket
    global: Arc<RateLimitBucket>,
    /// How long a bucket may sit idle before it is evicted
    expiry: Duration,
}

impl BucketRegistry {
    /// Creates a registry and spawns its background sweep.
    ///
    /// # Arguments
    /// * `expiry` - Idle window after which an unused bucket is evicted
    /// * `sweep_interval` - How often the background sweep runs
    pub fn new(expiry: Duration, sweep_interval: Duration) -> Arc<Self> {
        let registry = Arc::new(Self {
            buckets: Mutex::new(HashMap::new()),
            global: Arc::new(RateLimitBucket::new(GLOBAL_BUCKET_KEY)),
            expiry,
        });

        let weak: Weak<Self> = Arc::downgrade(&registry);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately; skip it so a fresh registry
            // is not swept at creation time.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(registry) => registry.sweep(),
                    None => break,
                }
            }
        });

        registry
    }

    /// Returns the account-wide global bucket.
    pub fn global(&self) -> &Arc<RateLimitBucket> {
        &self.global
    }

    /// Looks up an existing bucket without creating one.
    pub fn get(&self, key: &str) -> Option<Arc<RateLimitBucket>> {
        self.buckets.lock().unwrap().get(key).cloned()
    }

    /// Returns the bucket for `key`, creating it if absent.
    ///
    /// A freshly created bucket counts as just-used, so it survives at least
    /// one full expiry window.
    pub fn get_or_create(&self, key: &str) -> Arc<RateLimitBucket> {
        let mut buckets = self.buckets.lock().unwrap();
        if let Some(bucket) = buckets.get(key) {
            return Arc::clone(bucket);
        }
        debug!(key, "Creating rate-limit bucket");
        let bucket = Arc::new(RateLimitBucket::new(key));
        buckets.insert(key.to_string(), Arc::clone(&bucket));
        bucket
    }

    /// Number of tracked per-route buckets (the global bucket not included).
    pub fn len(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }

    /// Whether no per-route buckets are tracked.
    pub fn is_empty(&self) -> bool {
        self.buckets.lock().unwrap().is_empty()
    }

    /// Removes every bucket that has been idle past the expiry window.
    fn sweep(&self) {
        let mut buckets = self.buckets.lock().unwrap();
        let before = buckets.len();
        buckets.retain(|_, bucket| !bucket.is_idle(self.expiry));
        let evicted = before - buckets.len();
        if evicted > 0 {
            debug!(evicted, remaining = buckets.len(), "Evicted idle rate-limit buckets");
        }
    }
}
