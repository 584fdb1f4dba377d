//! Token bucket state and the refill/debit decision.
//!
//! [`BucketState::take`] is the single definition of a decision. The in-process
//! store runs it directly under a per-key lock; the Redis script in
//! `store::redis` is a line-for-line port of it, so both stores agree on every
//! edge case.

use serde::{Deserialize, Serialize};

use super::limiter::LimiterError;

/// Capacity and refill rate of a bucket, supplied per call and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketLimit {
    /// Maximum tokens the bucket can hold
    pub capacity: u32,
    /// Tokens added per second; zero means a fixed quota
    pub refill_rate: f64,
}

impl BucketLimit {
    /// Create a new limit. Call [`BucketLimit::validate`] before use.
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
        }
    }

    /// Check that the limit describes a usable bucket.
    pub fn validate(&self) -> Result<(), LimiterError> {
        if self.capacity == 0 {
            return Err(LimiterError::InvalidLimit(
                "capacity must be greater than zero".to_string(),
            ));
        }
        if !self.refill_rate.is_finite() || self.refill_rate < 0.0 {
            return Err(LimiterError::InvalidLimit(format!(
                "refill_rate must be a finite non-negative number, got {}",
                self.refill_rate
            )));
        }
        Ok(())
    }

    /// Check that `requested` can ever be satisfied by this bucket.
    pub fn check_request(&self, requested: u32) -> Result<(), LimiterError> {
        if requested == 0 || requested > self.capacity {
            return Err(LimiterError::InvalidRequest {
                requested,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}

/// Outcome of one admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Decision {
    /// Whether the requested tokens were debited
    pub admitted: bool,
    /// Tokens left in the bucket immediately after this decision
    pub tokens_remaining: f64,
}

impl Decision {
    pub fn admitted(tokens_remaining: f64) -> Self {
        Self {
            admitted: true,
            tokens_remaining,
        }
    }

    pub fn denied(tokens_remaining: f64) -> Self {
        Self {
            admitted: false,
            tokens_remaining,
        }
    }
}

/// Persisted state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Available tokens, `0 <= tokens <= capacity`
    pub tokens: f64,
    /// Timestamp of the last refill in seconds since the epoch
    pub last_refill: f64,
}

impl BucketState {
    /// A freshly created bucket.
    pub fn full(capacity: u32, now: f64) -> Self {
        Self {
            tokens: capacity as f64,
            last_refill: now,
        }
    }

    /// Refill the bucket up to `now` and try to debit `requested` tokens.
    ///
    /// A `now` earlier than the recorded refill time is raised to it: the stored
    /// timestamp never moves backwards and skewed callers never lose tokens.
    /// Denials still persist the refill so later calls see accurate progress.
    pub fn take(&mut self, now: f64, requested: u32, limit: &BucketLimit) -> Decision {
        let capacity = limit.capacity as f64;
        let now = now.max(self.last_refill);
        let elapsed = now - self.last_refill;

        let tokens = self.tokens.clamp(0.0, capacity);
        self.tokens = (tokens + elapsed * limit.refill_rate).min(capacity);
        self.last_refill = now;

        let requested = requested as f64;
        if self.tokens < requested {
            Decision::denied(self.tokens)
        } else {
            self.tokens -= requested;
            Decision::admitted(self.tokens)
        }
    }
}
