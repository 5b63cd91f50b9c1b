//! Reconciliation loop primitives.
//!
//! Controllers compare what the store says a workload should be doing with
//! what its cluster reports, and issue at most one corrective update per
//! observation. This crate holds the pieces every controller shares:
//!
//! - [`ReconcileResult`]: whether (and when) a resource should be looked at again.
//! - Wall-clock helpers for grace periods and stuck-workload detection. Domain
//!   timeouts are persisted timestamps compared against `now`, never process
//!   timers.
//! - [`RetryTracker`]: consecutive failure accounting per resource.
//!
//! # Invariants
//!
//! - Reconciling unchanged observed state is a no-op.
//! - Decisions are deterministic given the same inputs and `now`.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Outcome of one reconcile pass over a single resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    /// Look at the resource again on the next pass even if nothing changes.
    pub requeue: bool,

    /// Do not look at the resource again before this much time has passed.
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    /// Nothing left to do until the observed state changes.
    pub const fn done() -> Self {
        Self {
            requeue: false,
            requeue_after: None,
        }
    }

    pub const fn requeue() -> Self {
        Self {
            requeue: true,
            requeue_after: None,
        }
    }

    pub const fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue: true,
            requeue_after: Some(delay),
        }
    }

    pub fn is_requeue(&self) -> bool {
        self.requeue || self.requeue_after.is_some()
    }
}

/// Time elapsed from `then` to `now`, saturating at zero when `then` lies in
/// the future (clock skew between writers).
pub fn elapsed_since(then: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    now.signed_duration_since(then)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// Remaining part of a grace period of `ttl` that started at `started_at`.
///
/// Returns `None` once the period has fully elapsed.
pub fn grace_remaining(
    started_at: DateTime<Utc>,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let elapsed = elapsed_since(started_at, now);
    if elapsed >= ttl {
        None
    } else {
        Some(ttl - elapsed)
    }
}

/// True when `timestamp` is strictly more than `max_age` before `now`.
pub fn is_older_than(timestamp: DateTime<Utc>, max_age: Duration, now: DateTime<Utc>) -> bool {
    elapsed_since(timestamp, now) > max_age
}

/// Tracks consecutive failures per resource within a sliding window.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    max_retries: u32,
    window: Duration,
    /// resource key -> (count, first failure in the current window)
    failures: BTreeMap<String, (u32, DateTime<Utc>)>,
}

impl RetryTracker {
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure at `now`. Returns true if retries are exhausted.
    pub fn record_failure(&mut self, resource_key: &str, now: DateTime<Utc>) -> bool {
        let (count, first) = self
            .failures
            .entry(resource_key.to_string())
            .or_insert((0, now));

        if is_older_than(*first, self.window, now) {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    pub fn is_exhausted(&self, resource_key: &str, now: DateTime<Utc>) -> bool {
        match self.failures.get(resource_key) {
            Some((count, first)) => {
                !is_older_than(*first, self.window, now) && *count > self.max_retries
            }
            None => false,
        }
    }

    pub fn failure_count(&self, resource_key: &str) -> u32 {
        self.failures.get(resource_key).map_or(0, |(count, _)| *count)
    }

    /// Forget a resource after it reconciled cleanly.
    pub fn clear(&mut self, resource_key: &str) {
        self.failures.remove(resource_key);
    }

    /// Drop entries whose window has passed.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let window = self.window;
        self.failures
            .retain(|_, (_, first)| !is_older_than(*first, window, now));
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Default controller tick.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Default rescheduler tick.
pub const DEFAULT_RESCHEDULE_INTERVAL: Duration = Duration::from_secs(10);

/// Consecutive failures tolerated before a resource is reported loudly.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60);
