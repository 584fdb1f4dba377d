//! Store trait for abstracting shared and in-process bucket storage.

use std::sync::Arc;

use async_trait::async_trait;

use super::bucket::{BucketLimit, Decision};
use crate::store::StoreError;

/// Everything a store needs to make one decision.
#[derive(Debug, Clone, PartialEq)]
pub struct TakeRequest {
    /// Storage key of the bucket
    pub key: String,
    /// Caller timestamp in seconds since the epoch
    pub now: f64,
    /// Tokens to debit
    pub requested: u32,
    /// Limit to apply
    pub limit: BucketLimit,
}

/// Trait for bucket store implementations.
///
/// Implementations must run the read-refill-compare-debit-write sequence of
/// [`BucketState::take`](super::BucketState::take) atomically per key with
/// respect to every other caller of the same store, including callers in
/// other processes, and must reset the bucket's idle expiry on every write.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Attempt to debit `request.requested` tokens from the bucket.
    async fn take(&self, request: &TakeRequest) -> Result<Decision, StoreError>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}

#[async_trait]
impl<S: BucketStore + ?Sized> BucketStore for Arc<S> {
    async fn take(&self, request: &TakeRequest) -> Result<Decision, StoreError> {
        (**self).take(request).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        (**self).ping().await
    }
}
