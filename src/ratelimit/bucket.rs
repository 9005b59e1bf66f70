//! Token bucket implementation.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

use super::policy::RateLimitPolicy;
use crate::error::{Result, TollgateError};

/// Mutable part of a bucket, always accessed under the bucket lock.
#[derive(Debug)]
struct BucketState {
    policy: RateLimitPolicy,
    tokens: f64,
    last_refill: Instant,
    last_access: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let capacity = f64::from(self.policy.capacity);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.policy.refill_per_second)
            .min(capacity);
        self.last_refill = self.last_refill.max(now);
    }

    fn projected(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill);
        (self.tokens + elapsed.as_secs_f64() * self.policy.refill_per_second)
            .min(f64::from(self.policy.capacity))
    }

    fn check_invariants(&self) -> Result<()> {
        let capacity = f64::from(self.policy.capacity);
        if !self.tokens.is_finite() || self.tokens < 0.0 || self.tokens > capacity {
            return Err(TollgateError::StateFault(format!(
                "bucket holds {} tokens with capacity {}",
                self.tokens, capacity
            )));
        }
        Ok(())
    }
}

/// A token bucket owned by a single identity key.
///
/// The bucket holds up to `capacity` tokens and refills continuously at the
/// policy's rate. Every admitted request consumes one token. All mutation
/// happens inside one critical section, so two concurrent requests can never
/// both spend the last token.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket seeded full at `now`.
    pub fn new(policy: RateLimitPolicy, now: Instant) -> Self {
        Self {
            state: Mutex::new(BucketState {
                policy,
                tokens: f64::from(policy.capacity),
                last_refill: now,
                last_access: now,
            }),
        }
    }

    /// Refill for the time elapsed up to `now` and try to take one token.
    ///
    /// Returns `Ok(true)` when the request is admitted, `Ok(false)` when the
    /// bucket is empty. A bucket whose state is corrupt reports
    /// [`TollgateError::StateFault`] and is left untouched.
    pub fn try_acquire(&self, now: Instant) -> Result<bool> {
        let mut state = self.state.lock();
        state.check_invariants()?;

        state.refill(now);
        state.last_access = state.last_access.max(now);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Tokens the bucket would hold at `now`, without mutating it.
    pub fn tokens_at(&self, now: Instant) -> f64 {
        self.state.lock().projected(now)
    }

    /// Whether the bucket is full at `now` and has not been touched for at
    /// least `idle_after`.
    pub fn is_idle(&self, now: Instant, idle_after: Duration) -> bool {
        let state = self.state.lock();
        state.projected(now) >= f64::from(state.policy.capacity)
            && now.saturating_duration_since(state.last_access) >= idle_after
    }

    /// The policy this bucket currently enforces.
    pub fn policy(&self) -> RateLimitPolicy {
        self.state.lock().policy
    }

    /// Switch to a new policy, keeping the current token count clamped to
    /// the new capacity.
    pub fn reconfigure(&self, policy: RateLimitPolicy, now: Instant) {
        let mut state = self.state.lock();
        if state.policy == policy {
            return;
        }
        state.refill(now);
        state.policy = policy;
        state.tokens = state.tokens.min(f64::from(policy.capacity));
    }

    /// Maximum tokens the bucket can hold.
    pub fn capacity(&self) -> u32 {
        self.state.lock().policy.capacity
    }

    #[cfg(test)]
    pub(crate) fn corrupt(&self) {
        self.state.lock().tokens = f64::NAN;
    }
}
