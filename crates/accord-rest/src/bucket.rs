//! Per-partition rate-limit state and the sequential send queue
//!
//! A [`RateLimitBucket`] tracks everything the client knows about one
//! server-side rate-limit partition: the limits reported by response headers,
//! whether the partition is currently locked, and the FIFO queue of dispatches
//! waiting for their turn. Exactly one send is in flight per bucket at any
//! time; a dispatch holds a [`BucketPermit`] for the duration of its send and
//! the next waiter is released when the permit drops.
//!
//! ## Merge semantics
//!
//! Responses for concurrent in-flight requests against one bucket can resolve
//! out of order, so [`set_ratelimit`](RateLimitBucket::set_ratelimit) only
//! ever tightens the known numbers (minimum remaining, earliest reset).
//! Keeping the most pessimistic view avoids under-counting exhaustion and
//! triggering spurious 429s.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tracing::debug;

// ============================================================================
// RateLimitBucket
// ============================================================================

/// Mutable bucket state, guarded by a Mutex.
///
/// Never held across an await point; timers re-enter through their own lock
/// acquisition.
#[derive(Debug)]
struct BucketInner {
    /// Request ceiling for the window, unknown until a response reports it
    limit: Option<u32>,
    /// Requests left in the window, unknown until a response reports it
    remaining: Option<u32>,
    /// Delta until the window resets, as reported by the server
    reset_after: Option<Duration>,
    /// Absolute reset time in server clock terms
    reset_at: Option<DateTime<Utc>>,
    /// Absolute reset time in local clock terms
    reset_at_local: Option<Instant>,
    /// Whether dispatch through this bucket is currently halted
    locked: bool,
    /// When the current lock expires, if locked
    locked_until: Option<Instant>,
    /// Bumped on every lock/unlock; stale unlock timers check it and bail
    unlock_epoch: u64,
    /// Waiting dispatches, granted strictly front-to-back
    queue: VecDeque<oneshot::Sender<()>>,
    /// Whether a dispatch currently holds the send permit
    in_flight: bool,
    /// Last activity, for idle eviction by the registry
    last_used: Instant,
}

/// One server-defined rate-limit partition
///
/// Owned by the [`BucketRegistry`](crate::registry::BucketRegistry); the
/// dispatcher only ever borrows an `Arc` reference. All rate-limit fields
/// start unknown (effectively infinite) and are filled in from response
/// headers.
#[derive(Debug)]
pub struct RateLimitBucket {
    /// Immutable bucket key (hash + major parameters)
    key: String,
    /// Guarded mutable state
    inner: Mutex<BucketInner>,
}

impl RateLimitBucket {
    /// Creates a bucket with all rate-limit fields unknown.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            inner: Mutex::new(BucketInner {
                limit: None,
                remaining: None,
                reset_after: None,
                reset_at: None,
                reset_at_local: None,
                locked: false,
                locked_until: None,
                unlock_epoch: 0,
                queue: VecDeque::new(),
                in_flight: false,
                last_used: Instant::now(),
            }),
        }
    }

    /// Returns the bucket key.
    pub fn key(&self) -> &str {
        &self.key
    }

    // ========================================================================
    // Header merge
    // ========================================================================

    /// Merges a response's rate-limit headers into the bucket.
    ///
    /// `remaining` becomes the minimum of the current and incoming values
    /// (incoming taken outright while still unknown). `reset_after` and
    /// `reset_at` keep the smaller of current vs incoming, and
    /// `reset_at_local` keeps the earlier of `now + reset_after` and its
    /// previous value. The tightest bound always wins.
    pub fn set_ratelimit(
        &self,
        limit: Option<u32>,
        remaining: Option<u32>,
        reset_at: Option<DateTime<Utc>>,
        reset_after: Option<Duration>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_used = Instant::now();

        if let Some(limit) = limit {
            inner.limit = Some(limit);
        }
        if let Some(remaining) = remaining {
            inner.remaining = Some(match inner.remaining {
                Some(current) => current.min(remaining),
                None => remaining,
            });
        }
        if let Some(reset_after) = reset_after {
            inner.reset_after = Some(match inner.reset_after {
                Some(current) => current.min(reset_after),
                None => reset_after,
            });
            let local = Instant::now() + reset_after;
            inner.reset_at_local = Some(match inner.reset_at_local {
                Some(previous) => previous.min(local),
                None => local,
            });
        }
        if let Some(reset_at) = reset_at {
            inner.reset_at = Some(match inner.reset_at {
                Some(current) => current.min(reset_at),
                None => reset_at,
            });
        }
    }

    /// Pins `remaining` to zero, used when the server answers a 429 for this
    /// bucket and the local count disagreed.
    pub fn force_exhausted(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.remaining = Some(0);
    }

    // ========================================================================
    // Locking
    // ========================================================================

    /// Locks the bucket for `duration`, arming a timer that calls
    /// [`reset`](Self::reset) when it fires.
    ///
    /// A zero duration instead cancels any pending unlock timer, clears the
    /// lock, and drains immediately.
    pub fn lock(self: &Arc<Self>, duration: Duration) {
        let mut inner = self.inner.lock().unwrap();
        // Invalidate whatever unlock timer is currently armed.
        inner.unlock_epoch += 1;

        if duration.is_zero() {
            inner.locked = false;
            inner.locked_until = None;
            debug!(key = %self.key, "Bucket explicitly unlocked");
            Self::drain(&mut inner);
            return;
        }

        inner.locked = true;
        inner.locked_until = Some(Instant::now() + duration);
        let epoch = inner.unlock_epoch;
        drop(inner);

        debug!(key = %self.key, lock_ms = duration.as_millis() as u64, "Bucket locked");
        let bucket = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            bucket.reset_if_current(epoch);
        });
    }

    /// Restores all rate-limit fields to unknown, clears the lock, and
    /// drains the queue.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        Self::reset_inner(&mut inner);
        debug!(key = %self.key, "Bucket reset");
    }

    /// Timer entry point: resets only if no newer lock/unlock superseded the
    /// timer that fired.
    fn reset_if_current(&self, epoch: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.unlock_epoch == epoch {
            Self::reset_inner(&mut inner);
            debug!(key = %self.key, "Bucket lock expired, reset");
        }
    }

    fn reset_inner(inner: &mut BucketInner) {
        inner.limit = None;
        inner.remaining = None;
        inner.reset_after = None;
        inner.reset_at = None;
        inner.reset_at_local = None;
        inner.locked = false;
        inner.locked_until = None;
        inner.unlock_epoch += 1;
        Self::drain(inner);
    }

    // ========================================================================
    // Queue / drain
    // ========================================================================

    /// Waits for this bucket's send permit, joining the back of the queue.
    ///
    /// The permit is granted immediately when the bucket is unlocked, nothing
    /// is in flight, and no one is queued ahead. Dropping the returned
    /// [`BucketPermit`] releases the next waiter.
    pub async fn acquire(self: &Arc<Self>) -> BucketPermit {
        self.acquire_at(false).await
    }

    /// Reserves the *front* slot of the queue without waiting.
    ///
    /// The slot is claimed synchronously, so a dispatcher still holding this
    /// bucket's permit can reserve its retry position *before* releasing the
    /// permit; no later arrival can be granted in between. Only used to
    /// retry a 429-bounced dispatch ahead of requests that arrived after it.
    pub fn enqueue_front(self: &Arc<Self>) -> PendingPermit {
        PendingPermit {
            bucket: Arc::clone(self),
            rx: self.enqueue(true),
        }
    }

    async fn acquire_at(self: &Arc<Self>, front: bool) -> BucketPermit {
        let rx = self.enqueue(front);
        // Resolves immediately when drain granted us the permit above;
        // otherwise suspends until our turn comes around.
        let _ = rx.await;
        BucketPermit {
            bucket: Arc::clone(self),
        }
    }

    /// Pushes a waiter into the queue and drains.
    fn enqueue(self: &Arc<Self>, front: bool) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap();
        inner.last_used = Instant::now();
        if front {
            inner.queue.push_front(tx);
        } else {
            inner.queue.push_back(tx);
        }
        Self::drain(&mut inner);
        rx
    }

    /// Marks the in-flight send finished and releases the next waiter.
    fn complete(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.in_flight = false;
        inner.last_used = Instant::now();
        Self::drain(&mut inner);
    }

    /// Grants the permit to the head of the queue if the bucket is unlocked
    /// and nothing is in flight. Waiters whose receiving side vanished are
    /// skipped.
    fn drain(inner: &mut BucketInner) {
        if inner.locked || inner.in_flight {
            return;
        }
        while let Some(tx) = inner.queue.pop_front() {
            if tx.send(()).is_ok() {
                inner.in_flight = true;
                return;
            }
        }
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Whether the bucket is currently locked.
    pub fn is_locked(&self) -> bool {
        self.inner.lock().unwrap().locked
    }

    /// Requests left in the current window, if known.
    pub fn remaining(&self) -> Option<u32> {
        self.inner.lock().unwrap().remaining
    }

    /// Request ceiling for the current window, if known.
    pub fn limit(&self) -> Option<u32> {
        self.inner.lock().unwrap().limit
    }

    /// Time left until the window resets by the local clock, zero when
    /// unknown or already past.
    pub fn time_until_reset(&self) -> Duration {
        let inner = self.inner.lock().unwrap();
        inner
            .reset_at_local
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or_default()
    }

    /// Number of dispatches waiting on this bucket.
    pub fn queue_len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// Whether the bucket is eligible for eviction: unlocked, no queue,
    /// nothing in flight, and unused for at least `window`.
    pub fn is_idle(&self, window: Duration) -> bool {
        let inner = self.inner.lock().unwrap();
        !inner.locked
            && !inner.in_flight
            && inner.queue.is_empty()
            && inner.last_used.elapsed() >= window
    }
}

// ============================================================================
// BucketPermit
// ============================================================================

/// RAII permit for the single in-flight send of a bucket
///
/// Held by the dispatcher for the duration of one network call. Dropping it
/// completes the send and drains the bucket's next queued dispatch, so the
/// "exactly one in-flight send per bucket" invariant holds even on early
/// error returns.
#[derive(Debug)]
pub struct BucketPermit {
    bucket: Arc<RateLimitBucket>,
}

impl BucketPermit {
    /// The bucket this permit belongs to.
    pub fn bucket(&self) -> &Arc<RateLimitBucket> {
        &self.bucket
    }
}

impl Drop for BucketPermit {
    fn drop(&mut self) {
        self.bucket.complete();
    }
}

/// A reserved queue slot that has not been granted yet
///
/// Created by [`RateLimitBucket::enqueue_front`]; the slot is claimed at
/// creation time, [`wait`](Self::wait) suspends until it is granted.
#[derive(Debug)]
pub struct PendingPermit {
    bucket: Arc<RateLimitBucket>,
    rx: oneshot::Receiver<()>,
}

impl PendingPermit {
    /// Waits for the reserved slot to be granted.
    pub async fn wait(self) -> BucketPermit {
        let _ = self.rx.await;
        BucketPermit {
            bucket: self.bucket,
        }
    }
}
