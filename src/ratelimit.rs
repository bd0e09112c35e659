//! Token-bucket admission control keyed by client identity.
//!
//! Each `(operation class, identity)` pair owns a bucket with the class's
//! capacity and refill rate. Buckets live in a sharded map with per-entry
//! locking, so unrelated identities never serialize on each other. Refill is
//! driven by [`Instant`], making a wall-clock rollback unable to mint
//! tokens. This is a local, in-process limiter; cross-process coordination
//! is out of scope.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{ClassLimit, RateLimitConfig};
use crate::error::Error;

/// Tolerance for floating-point refill arithmetic.
const EPS: f64 = 1e-9;

/// Operation class an admission check is billed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationClass {
    /// Login, callback and token operations
    Auth,
    /// Read operations
    Read,
    /// Write operations
    Write,
    /// Anything unclassified
    Default,
}

/// Outcome of a successful admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Bucket capacity of the class, for `X-RateLimit-Limit`.
    pub limit: u32,
    /// Whole tokens left after this admission, for `X-RateLimit-Remaining`.
    pub remaining: u32,
    /// Time until the bucket is full again.
    pub reset_after: Duration,
}

impl RateDecision {
    /// Decision used when admission control is disabled.
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            limit: u32::MAX,
            remaining: u32::MAX,
            reset_after: Duration::ZERO,
        }
    }
}

/// Admission rejection with its retry hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("rate limit exceeded, retry after {retry_after:?}")]
pub struct RateExceeded {
    /// How long until enough tokens accumulate for the rejected cost.
    pub retry_after: Duration,
    /// Bucket capacity of the rejecting class.
    pub limit: u32,
}

impl From<RateExceeded> for Error {
    fn from(e: RateExceeded) -> Self {
        Self::RateExceeded {
            retry_after: e.retry_after,
            limit: e.limit,
        }
    }
}

/// Per-identity token bucket.
///
/// Invariants: `0 <= tokens <= capacity`; `last_refill` only moves forward.
struct RateBucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateBucket {
    fn full(capacity: u32, now: Instant) -> Self {
        Self {
            tokens: f64::from(capacity),
            last_refill: now,
        }
    }

    fn refill(&mut self, limit: ClassLimit, now: Instant) {
        // A clock that appears to run backwards grants nothing.
        let elapsed = now
            .checked_duration_since(self.last_refill)
            .unwrap_or_default();
        self.tokens = (self.tokens + elapsed.as_secs_f64() * limit.refill_per_sec)
            .min(f64::from(limit.capacity));
        self.last_refill = now;
    }
}

/// Token-bucket rate limiter for request admission.
pub struct RateLimiter {
    enabled: bool,
    eviction_window: Duration,
    auth: ClassLimit,
    read: ClassLimit,
    write: ClassLimit,
    default: ClassLimit,
    buckets: DashMap<(OperationClass, String), RateBucket>,
    last_sweep: Mutex<Instant>,
}

impl RateLimiter {
    /// Create a limiter from configuration.
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            eviction_window: config.eviction_window,
            auth: config.auth,
            read: config.read,
            write: config.write,
            default: config.default,
            buckets: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Try to admit an operation of `cost` tokens for `identity`.
    ///
    /// # Errors
    ///
    /// [`RateExceeded`] with a retry hint when the identity's bucket cannot
    /// cover the cost.
    pub fn try_admit(
        &self,
        identity: &str,
        class: OperationClass,
        cost: f64,
    ) -> Result<RateDecision, RateExceeded> {
        self.try_admit_at(identity, class, cost, Instant::now())
    }

    /// Number of identities currently holding a bucket.
    #[must_use]
    pub fn tracked_identities(&self) -> usize {
        self.buckets.len()
    }

    fn limit_for(&self, class: OperationClass) -> ClassLimit {
        match class {
            OperationClass::Auth => self.auth,
            OperationClass::Read => self.read,
            OperationClass::Write => self.write,
            OperationClass::Default => self.default,
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn try_admit_at(
        &self,
        identity: &str,
        class: OperationClass,
        cost: f64,
        now: Instant,
    ) -> Result<RateDecision, RateExceeded> {
        if !self.enabled {
            return Ok(RateDecision::unlimited());
        }

        self.maybe_sweep(now);

        let limit = self.limit_for(class);
        let mut bucket = self
            .buckets
            .entry((class, identity.to_string()))
            .or_insert_with(|| RateBucket::full(limit.capacity, now));
        bucket.refill(limit, now);

        if bucket.tokens + EPS >= cost {
            bucket.tokens = (bucket.tokens - cost).max(0.0);
            let deficit = f64::from(limit.capacity) - bucket.tokens;
            Ok(RateDecision {
                limit: limit.capacity,
                remaining: bucket.tokens as u32,
                reset_after: Duration::from_secs_f64(deficit / limit.refill_per_sec),
            })
        } else {
            let wait = (cost - bucket.tokens) / limit.refill_per_sec;
            Err(RateExceeded {
                retry_after: Duration::from_secs_f64(wait),
                limit: limit.capacity,
            })
        }
    }

    /// Evict buckets idle for longer than the eviction window, at most once
    /// per window.
    fn maybe_sweep(&self, now: Instant) {
        let mut last = self.last_sweep.lock();
        if now.checked_duration_since(*last).unwrap_or_default() < self.eviction_window {
            return;
        }
        *last = now;
        drop(last);

        let window = self.eviction_window;
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            now.checked_duration_since(bucket.last_refill)
                .unwrap_or_default()
                < window
        });
        let evicted = before - self.buckets.len();
        if evicted > 0 {
            debug!(evicted, "Evicted idle rate buckets");
        }
    }
}
