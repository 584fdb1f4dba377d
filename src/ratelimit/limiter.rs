//! Admission-control facade.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

use super::backend::{BucketStore, TakeRequest};
use super::bucket::{BucketLimit, Decision};
use super::clock::{Clock, SystemClock};
use super::descriptor::{BucketId, DEFAULT_KEY_PREFIX};
use super::rules::LimitRules;
use crate::store::StoreError;

/// Errors returned instead of a decision.
#[derive(Debug, Error)]
pub enum LimiterError {
    /// Tenant or endpoint is empty
    #[error("bucket identity must have a non-empty tenant and endpoint")]
    EmptyIdentity,

    /// Capacity or refill rate is unusable
    #[error("invalid limit: {0}")]
    InvalidLimit(String),

    /// Requested token count can never be satisfied
    #[error("requested {requested} tokens, must be between 1 and capacity {capacity}")]
    InvalidRequest { requested: u32, capacity: u32 },

    /// The store could not produce a decision
    #[error("rate limiter unavailable: {0}")]
    Unavailable(#[from] StoreError),
}

impl LimiterError {
    /// Whether this is an infrastructure failure rather than a caller mistake.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, LimiterError::Unavailable(_))
    }
}

/// Token-bucket rate limiter over a shared [`BucketStore`].
///
/// The limiter holds no per-bucket state and takes no locks; concurrent
/// callers, in this process or any other, are serialized by the store.
/// Share one instance across tasks behind an `Arc`.
pub struct RateLimiter<S: BucketStore> {
    store: S,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    rules: LimitRules,
}

impl<S: BucketStore> RateLimiter<S> {
    /// Create a limiter using the wall clock, the default key prefix and
    /// default limit rules.
    pub fn new(store: S) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock::new()),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            rules: LimitRules::default(),
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the namespace prefix of bucket keys.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Replace the per-endpoint limit rules.
    pub fn with_rules(mut self, rules: LimitRules) -> Self {
        self.rules = rules;
        self
    }

    /// Get the store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Get the configured limit rules.
    pub fn rules(&self) -> &LimitRules {
        &self.rules
    }

    /// Attempt to consume `requested` tokens from the bucket named by `id`.
    ///
    /// Invalid input is rejected before the store is contacted. Otherwise this
    /// costs exactly one store round trip and returns the state of the bucket
    /// right after this decision. Store failures are returned as
    /// [`LimiterError::Unavailable`] and never turned into a decision here.
    ///
    /// Dropping the returned future does not undo a debit the store has
    /// already committed.
    #[instrument(skip(self, id, limit), fields(bucket = %id))]
    pub async fn allow(
        &self,
        id: &BucketId,
        limit: BucketLimit,
        requested: u32,
    ) -> Result<Decision, LimiterError> {
        if id.is_empty() {
            return Err(LimiterError::EmptyIdentity);
        }
        limit.validate()?;
        limit.check_request(requested)?;

        let request = TakeRequest {
            key: id.storage_key(&self.key_prefix),
            now: self.clock.now(),
            requested,
            limit,
        };

        let decision = self.store.take(&request).await.map_err(|e| {
            warn!(key = %request.key, error = %e, "Bucket store failed");
            LimiterError::Unavailable(e)
        })?;

        trace!(
            key = %request.key,
            admitted = decision.admitted,
            tokens_remaining = decision.tokens_remaining,
            "Decision made"
        );

        if !decision.admitted {
            debug!(
                key = %request.key,
                capacity = limit.capacity,
                refill_rate = limit.refill_rate,
                tokens_remaining = decision.tokens_remaining,
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }

    /// Like [`RateLimiter::allow`], with the limit looked up from the
    /// configured rules for `endpoint`.
    pub async fn allow_endpoint(
        &self,
        tenant: &str,
        endpoint: &str,
        requested: u32,
    ) -> Result<Decision, LimiterError> {
        let limit = self.rules.for_endpoint(endpoint);
        self.allow(&BucketId::new(tenant, endpoint), limit, requested)
            .await
    }
}
