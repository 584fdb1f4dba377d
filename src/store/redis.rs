//! Redis-backed bucket store.
//!
//! Each decision is a single `EVALSHA` of [`DECISION_SCRIPT`]. Redis runs
//! scripts one at a time, so the read-refill-compare-debit-write sequence is
//! atomic against every other client of the same server, wherever it runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{IntoConnectionInfo, Script, Value};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::ratelimit::{BucketStore, Decision, TakeRequest};

use super::StoreError;

/// The decision, executed server-side.
///
/// KEYS[1] bucket key; ARGV: now, requested, capacity, refill_rate, idle TTL
/// seconds. Returns `{admitted (0|1), tokens}` with tokens as a string, since
/// Redis truncates Lua numbers to integers in replies. Must stay in step with
/// `BucketState::take`.
const DECISION_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local requested = tonumber(ARGV[2])
local capacity = tonumber(ARGV[3])
local refill_rate = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local state = redis.call("HMGET", key, "tokens", "ts")
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
  tokens = capacity
  ts = now
end

if now < ts then
  now = ts
end

tokens = math.max(0, math.min(capacity, tokens))
tokens = math.min(capacity, tokens + (now - ts) * refill_rate)

local admitted = 0
if tokens >= requested then
  tokens = tokens - requested
  admitted = 1
end

local encoded = string.format("%.17g", tokens)
redis.call("HSET", key, "tokens", encoded, "ts", string.format("%.17g", now))
redis.call("EXPIRE", key, ttl)
return {admitted, encoded}
"#;

/// Connection settings for the Redis store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisStoreConfig {
    /// Redis URL, e.g. `redis://127.0.0.1:6379/0`
    #[serde(default = "default_url")]
    pub url: String,

    /// Password, if not embedded in the URL
    #[serde(default)]
    pub password: Option<String>,

    /// Number of multiplexed connections shared by all callers
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Bound on establishing each connection
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Bound on each decision round trip
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            password: None,
            pool_size: default_pool_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
        }
    }
}

fn default_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_pool_size() -> usize {
    4
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_response_timeout_ms() -> u64 {
    150
}

impl RedisStoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Bucket store on a shared Redis server.
///
/// Cheap to clone; clones share the connection pool. Connections are
/// multiplexed and reconnect on their own, so callers need no
/// synchronization of their own.
#[derive(Clone)]
pub struct RedisBucketStore {
    inner: Arc<Inner>,
}

struct Inner {
    connections: Vec<ConnectionManager>,
    next: AtomicUsize,
    script: Script,
    idle_ttl_secs: u64,
    response_timeout: Duration,
}

impl std::fmt::Debug for RedisBucketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBucketStore")
            .field("pool_size", &self.inner.connections.len())
            .field("idle_ttl_secs", &self.inner.idle_ttl_secs)
            .field("response_timeout", &self.inner.response_timeout)
            .finish()
    }
}

impl RedisBucketStore {
    /// Open the connection pool and verify the server answers.
    pub async fn connect(config: &RedisStoreConfig, idle_ttl: Duration) -> Result<Self, StoreError> {
        let mut info = config.url.as_str().into_connection_info()?;
        if let Some(password) = &config.password {
            info.redis.password = Some(password.clone());
        }
        let client = redis::Client::open(info)?;

        info!(
            addr = %client.get_connection_info().addr,
            pool_size = config.pool_size,
            response_timeout_ms = config.response_timeout_ms,
            "Connecting to bucket store"
        );

        let connect_timeout = config.connect_timeout();
        let mut connections = Vec::with_capacity(config.pool_size.max(1));
        for _ in 0..config.pool_size.max(1) {
            let manager = timeout(connect_timeout, ConnectionManager::new(client.clone()))
                .await
                .map_err(|_| StoreError::Timeout(connect_timeout))??;
            connections.push(manager);
        }

        let store = Self {
            inner: Arc::new(Inner {
                connections,
                next: AtomicUsize::new(0),
                script: Script::new(DECISION_SCRIPT),
                idle_ttl_secs: idle_ttl.as_secs().max(1),
                response_timeout: config.response_timeout(),
            }),
        };

        store.ping().await?;
        info!("Bucket store connected");
        Ok(store)
    }

    fn connection(&self) -> ConnectionManager {
        let i = self.inner.next.fetch_add(1, Ordering::Relaxed) % self.inner.connections.len();
        self.inner.connections[i].clone()
    }
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    /// A timed-out call may still have been applied by the server.
    async fn take(&self, request: &TakeRequest) -> Result<Decision, StoreError> {
        let mut conn = self.connection();
        let mut invocation = self.inner.script.prepare_invoke();
        invocation
            .key(&request.key)
            .arg(request.now)
            .arg(request.requested)
            .arg(request.limit.capacity)
            .arg(request.limit.refill_rate)
            .arg(self.inner.idle_ttl_secs);

        let response_timeout = self.inner.response_timeout;
        let reply: Value = timeout(response_timeout, invocation.invoke_async(&mut conn))
            .await
            .map_err(|_| StoreError::Timeout(response_timeout))??;

        let decision = parse_reply(reply, request.limit.capacity)?;
        debug!(
            key = %request.key,
            admitted = decision.admitted,
            tokens_remaining = decision.tokens_remaining,
            "Decision script completed"
        );
        Ok(decision)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection();
        let response_timeout = self.inner.response_timeout;
        let pong: String = timeout(response_timeout, redis::cmd("PING").query_async(&mut conn))
            .await
            .map_err(|_| StoreError::Timeout(response_timeout))??;

        if pong != "PONG" {
            return Err(StoreError::MalformedReply(format!(
                "unexpected PING reply {:?}",
                pong
            )));
        }
        Ok(())
    }
}

/// Validate a decision script reply.
fn parse_reply(reply: Value, capacity: u32) -> Result<Decision, StoreError> {
    let items = match reply {
        Value::Array(items) => items,
        other => {
            return Err(StoreError::MalformedReply(format!(
                "expected a two-element array, got {:?}",
                other
            )))
        }
    };

    let [admitted, tokens] = <[Value; 2]>::try_from(items).map_err(|items| {
        StoreError::MalformedReply(format!(
            "expected a two-element array, got {} elements",
            items.len()
        ))
    })?;

    let admitted = match admitted {
        Value::Int(1) => true,
        Value::Int(0) => false,
        other => {
            return Err(StoreError::MalformedReply(format!(
                "admitted flag must be 0 or 1, got {:?}",
                other
            )))
        }
    };

    let tokens = match &tokens {
        Value::BulkString(bytes) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.trim().parse::<f64>().ok()),
        Value::SimpleString(s) => s.trim().parse::<f64>().ok(),
        Value::Int(n) => Some(*n as f64),
        _ => None,
    }
    .ok_or_else(|| StoreError::MalformedReply(format!("tokens is not a number: {:?}", tokens)))?;

    if !tokens.is_finite() || tokens < 0.0 || tokens > capacity as f64 {
        return Err(StoreError::MalformedReply(format!(
            "tokens {} outside [0, {}]",
            tokens, capacity
        )));
    }

    Ok(Decision {
        admitted,
        tokens_remaining: tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> Value {
        Value::BulkString(s.as_bytes().to_vec())
    }

    #[test]
    fn test_parse_admitted_reply() {
        let reply = Value::Array(vec![Value::Int(1), bulk("9.5")]);
        let decision = parse_reply(reply, 10).unwrap();
        assert!(decision.admitted);
        assert_eq!(decision.tokens_remaining, 9.5);
    }

    #[test]
    fn test_parse_denied_reply() {
        let reply = Value::Array(vec![Value::Int(0), bulk("0.25")]);
        let decision = parse_reply(reply, 10).unwrap();
        assert!(!decision.admitted);
        assert_eq!(decision.tokens_remaining, 0.25);
    }

    #[test]
    fn test_parse_integer_tokens() {
        let reply = Value::Array(vec![Value::Int(1), Value::Int(3)]);
        assert_eq!(parse_reply(reply, 10).unwrap().tokens_remaining, 3.0);
    }

    #[test]
    fn test_malformed_replies_rejected() {
        let cases = vec![
            Value::Nil,
            Value::Int(1),
            Value::Array(vec![]),
            Value::Array(vec![Value::Int(1)]),
            Value::Array(vec![Value::Int(1), bulk("1"), bulk("extra")]),
            Value::Array(vec![Value::Int(2), bulk("1")]),
            Value::Array(vec![bulk("1"), bulk("1")]),
            Value::Array(vec![Value::Int(1), bulk("lots")]),
            Value::Array(vec![Value::Int(1), bulk("-1")]),
            Value::Array(vec![Value::Int(1), bulk("11")]),
            Value::Array(vec![Value::Int(1), bulk("nan")]),
            Value::Array(vec![Value::Int(1), Value::Nil]),
        ];

        for reply in cases {
            let shown = format!("{:?}", reply);
            let result = parse_reply(reply, 10);
            assert!(
                matches!(result, Err(StoreError::MalformedReply(_))),
                "{} should be rejected",
                shown
            );
        }
    }

    #[test]
    fn test_default_config() {
        let config = RedisStoreConfig::default();
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.response_timeout(), Duration::from_millis(150));
        assert_eq!(config.connect_timeout(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_store_fails() {
        let config = RedisStoreConfig {
            url: "redis://127.0.0.1:1".to_string(),
            pool_size: 1,
            connect_timeout_ms: 500,
            ..RedisStoreConfig::default()
        };

        let result = RedisBucketStore::connect(&config, Duration::from_secs(3600)).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_url_rejected() {
        let config = RedisStoreConfig {
            url: "not a url".to_string(),
            ..RedisStoreConfig::default()
        };
        let result = tokio_test::block_on(RedisBucketStore::connect(&config, Duration::from_secs(60)));
        assert!(matches!(result, Err(StoreError::Redis(_))));
    }

    /// Tests against a live server; they return early unless
    /// `TOLLGATE_TEST_REDIS_URL` is set.
    mod live {
        use super::*;
        use crate::ratelimit::{BucketId, BucketLimit, ManualClock, RateLimiter};
        use std::sync::Arc;

        async fn live_store_with_ttl(idle_ttl: Duration) -> Option<RedisBucketStore> {
            let url = std::env::var("TOLLGATE_TEST_REDIS_URL").ok()?;
            let config = RedisStoreConfig {
                url,
                response_timeout_ms: 2000,
                ..RedisStoreConfig::default()
            };
            Some(
                RedisBucketStore::connect(&config, idle_ttl)
                    .await
                    .unwrap(),
            )
        }

        async fn live_store() -> Option<RedisBucketStore> {
            live_store_with_ttl(Duration::from_secs(3600)).await
        }

        fn unique_tenant(test: &str) -> String {
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos();
            format!("{}-{}", test, nanos)
        }

        #[tokio::test]
        async fn test_script_burst_then_refill() {
            let Some(store) = live_store().await else { return };
            let clock = Arc::new(ManualClock::new(1_700_000_000.0));
            let limiter = RateLimiter::new(store).with_clock(clock.clone());
            let id = BucketId::new(unique_tenant("burst"), "transform");
            let limit = BucketLimit::new(100, 10.0);

            for _ in 0..100 {
                assert!(limiter.allow(&id, limit, 1).await.unwrap().admitted);
            }
            let decision = limiter.allow(&id, limit, 1).await.unwrap();
            assert!(!decision.admitted);
            assert_eq!(decision.tokens_remaining, 0.0);

            clock.advance(Duration::from_secs(1));
            let decision = limiter.allow(&id, limit, 1).await.unwrap();
            assert!(decision.admitted);
            assert!((decision.tokens_remaining - 9.0).abs() < 1e-6);
        }

        #[tokio::test]
        async fn test_script_clamps_backwards_clock() {
            let Some(store) = live_store().await else { return };
            let clock = Arc::new(ManualClock::new(1_700_000_000.0));
            let limiter = RateLimiter::new(store).with_clock(clock.clone());
            let id = BucketId::new(unique_tenant("skew"), "clean");
            let limit = BucketLimit::new(10, 1.0);

            limiter.allow(&id, limit, 5).await.unwrap();
            clock.set(1_699_999_000.0);
            let decision = limiter.allow(&id, limit, 1).await.unwrap();
            assert!(decision.admitted);
            assert!((decision.tokens_remaining - 4.0).abs() < 1e-6);
        }

        #[tokio::test]
        async fn test_idle_bucket_expires_full() {
            let Some(store) = live_store_with_ttl(Duration::from_secs(1)).await else { return };
            let clock = Arc::new(ManualClock::new(1_700_000_000.0));
            let limiter = RateLimiter::new(store).with_clock(clock);
            let id = BucketId::new(unique_tenant("expiry"), "storage");
            let limit = BucketLimit::new(3, 0.0);

            assert!(limiter.allow(&id, limit, 3).await.unwrap().admitted);
            assert!(!limiter.allow(&id, limit, 1).await.unwrap().admitted);

            // The frozen clock and zero refill rate leave expiry as the only
            // way back to a full bucket.
            tokio::time::sleep(Duration::from_millis(2200)).await;

            let decision = limiter.allow(&id, limit, 3).await.unwrap();
            assert!(decision.admitted);
            assert_eq!(decision.tokens_remaining, 0.0);
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
        async fn test_script_never_over_admits() {
            let Some(store) = live_store().await else { return };
            let limiter = Arc::new(RateLimiter::new(store));
            let id = BucketId::new(unique_tenant("race"), "generate");
            let limit = BucketLimit::new(25, 0.0);

            let handles: Vec<_> = (0..200)
                .map(|_| {
                    let limiter = limiter.clone();
                    let id = id.clone();
                    tokio::spawn(async move { limiter.allow(&id, limit, 1).await.unwrap().admitted })
                })
                .collect();

            let results = futures::future::join_all(handles).await;
            let admitted = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
            assert_eq!(admitted, 25);
        }
    }
}
