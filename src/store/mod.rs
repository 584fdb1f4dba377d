//! Bucket store adapters.
//!
//! [`RedisBucketStore`] is the shared store used in production: every decision
//! is one atomic script execution on the Redis server. [`MemoryBucketStore`]
//! gives the same semantics inside a single process.

mod memory;
mod redis;

use std::time::Duration;

use thiserror::Error;

pub use self::memory::MemoryBucketStore;
pub use self::redis::{RedisBucketStore, RedisStoreConfig};

/// Errors raised by a bucket store.
///
/// Every variant means "no decision was obtained"; none of them may be read
/// as an admission or a denial.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store did not answer within the configured timeout
    #[error("store timed out after {0:?}")]
    Timeout(Duration),

    /// The store could not be reached
    #[error("store connection failed: {0}")]
    Connection(String),

    /// The store answered with an error
    #[error("store error: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// The decision script returned something other than a decision
    #[error("malformed store reply: {0}")]
    MalformedReply(String),
}
