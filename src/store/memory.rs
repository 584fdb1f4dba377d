//! In-process bucket store.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::ratelimit::{BucketState, BucketStore, Decision, TakeRequest};

use super::StoreError;

/// Bucket store backed by a concurrent map.
///
/// Each decision runs under the map's per-shard write lock, which makes it
/// atomic for every caller sharing this instance. It does not coordinate
/// across processes; use [`RedisBucketStore`](super::RedisBucketStore) for
/// that.
///
/// Idle expiry is evaluated against decision timestamps: a bucket whose last
/// refill is more than `idle_ttl` before `now` is treated as absent.
#[derive(Debug)]
pub struct MemoryBucketStore {
    buckets: DashMap<String, BucketState>,
    idle_ttl: Duration,
}

impl MemoryBucketStore {
    /// Create an empty store.
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            idle_ttl,
        }
    }

    /// Current state of a bucket, if it exists.
    pub fn get(&self, key: &str) -> Option<BucketState> {
        self.buckets.get(key).map(|state| *state)
    }

    /// Number of stored buckets, including idle ones not yet purged.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Remove buckets idle for longer than the TTL as of `now`.
    pub fn purge_expired(&self, now: f64) -> usize {
        let before = self.buckets.len();
        let ttl = self.idle_ttl.as_secs_f64();
        self.buckets.retain(|_, state| !is_expired(state, now, ttl));
        let purged = before.saturating_sub(self.buckets.len());
        if purged > 0 {
            debug!(purged = purged, "Purged idle buckets");
        }
        purged
    }
}

fn is_expired(state: &BucketState, now: f64, ttl: f64) -> bool {
    now - state.last_refill > ttl
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn take(&self, request: &TakeRequest) -> Result<Decision, StoreError> {
        let ttl = self.idle_ttl.as_secs_f64();
        let mut state = self
            .buckets
            .entry(request.key.clone())
            .or_insert_with(|| BucketState::full(request.limit.capacity, request.now));

        if is_expired(&state, request.now, ttl) {
            *state = BucketState::full(request.limit.capacity, request.now);
        }

        Ok(state.take(request.now, request.requested, &request.limit))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::BucketLimit;
    use std::sync::Arc;

    const T0: f64 = 1_700_000_000.0;

    fn request(key: &str, now: f64, requested: u32, limit: BucketLimit) -> TakeRequest {
        TakeRequest {
            key: key.to_string(),
            now,
            requested,
            limit,
        }
    }

    #[tokio::test]
    async fn test_bucket_created_full() {
        let store = MemoryBucketStore::new(Duration::from_secs(3600));
        let limit = BucketLimit::new(10, 1.0);

        let decision = store.take(&request("rl:a:b", T0, 3, limit)).await.unwrap();
        assert!(decision.admitted);
        assert_eq!(decision.tokens_remaining, 7.0);
        assert_eq!(store.get("rl:a:b"), Some(BucketState { tokens: 7.0, last_refill: T0 }));
    }

    #[tokio::test]
    async fn test_refill_after_idle_interval() {
        let store = MemoryBucketStore::new(Duration::from_secs(3600));
        let limit = BucketLimit::new(10, 4.0);

        // Drain, then wait 1.5s: min(10, 4 * 1.5) = 6 tokens available.
        store.take(&request("k", T0, 10, limit)).await.unwrap();
        let decision = store.take(&request("k", T0 + 1.5, 6, limit)).await.unwrap();
        assert!(decision.admitted);
        assert!(decision.tokens_remaining.abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_denial_persists_refill() {
        let store = MemoryBucketStore::new(Duration::from_secs(3600));
        let limit = BucketLimit::new(10, 2.0);

        store.take(&request("k", T0, 10, limit)).await.unwrap();
        let decision = store.take(&request("k", T0 + 1.0, 5, limit)).await.unwrap();
        assert!(!decision.admitted);
        assert!((decision.tokens_remaining - 2.0).abs() < 1e-6);

        let state = store.get("k").unwrap();
        assert_eq!(state.last_refill, T0 + 1.0);
        assert!((state.tokens - 2.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_expired_bucket_is_recreated_full() {
        let store = MemoryBucketStore::new(Duration::from_secs(3600));
        let limit = BucketLimit::new(10, 0.0);

        store.take(&request("k", T0, 10, limit)).await.unwrap();
        let decision = store.take(&request("k", T0 + 3600.0, 1, limit)).await.unwrap();
        assert!(!decision.admitted, "still within the TTL");

        let decision = store.take(&request("k", T0 + 7201.0, 1, limit)).await.unwrap();
        assert!(decision.admitted);
        assert_eq!(decision.tokens_remaining, 9.0);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryBucketStore::new(Duration::from_secs(60));
        let limit = BucketLimit::new(10, 1.0);

        store.take(&request("old", T0, 1, limit)).await.unwrap();
        store.take(&request("new", T0 + 100.0, 1, limit)).await.unwrap();
        assert_eq!(store.len(), 2);

        assert_eq!(store.purge_expired(T0 + 100.0), 1);
        assert!(store.get("old").is_none());
        assert!(store.get("new").is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_takes_are_serialized() {
        let store = Arc::new(MemoryBucketStore::new(Duration::from_secs(3600)));
        let limit = BucketLimit::new(100, 0.0);

        let handles: Vec<_> = (0..1000)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .take(&request("hot", T0, 1, limit))
                        .await
                        .unwrap()
                        .admitted
                })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 100);
        assert_eq!(store.get("hot").unwrap().tokens, 0.0);
    }
}
