// =============================================================================
// store.rs - THE SHARED COUNTER
// =============================================================================
//
// Several gateway instances share one provider credential, so they share one
// budget. The budget lives in an external key-value store behind a deliberately
// tiny interface:
//
//   get                   read the stored bucket state
//   conditional_decrement refill, then take N iff N are there. Atomically.
//   set_with_ttl          overwrite the state
//
// Redis implements it with a Lua script (atomic server-side). Tests use the
// in-process fake, which can be told to "go down".
// =============================================================================

use async_trait::async_trait;
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, Ordering};
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("token store unreachable: {0}")]
    Unavailable(String),
    #[error("token store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("token store returned malformed data: {0}")]
    Malformed(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Shape of the shared bucket, sent with every decrement so the store can
/// refill without knowing anything about endpoints.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSpec {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

/// Raw stored state. `updated_ms` is the wall-clock millisecond timestamp of
/// the last write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoredTokens {
    pub tokens: f64,
    pub updated_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecrementOutcome {
    pub allowed: bool,
    pub remaining: f64,
}

#[async_trait]
pub trait TokenStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<StoredTokens>, StoreError>;

    /// Refill `key` to `now_ms` per `spec`, then take `requested` tokens iff
    /// that many are available. A missing key starts full.
    async fn conditional_decrement(
        &self,
        key: &str,
        spec: BucketSpec,
        requested: f64,
        now_ms: i64,
    ) -> Result<DecrementOutcome, StoreError>;

    async fn set_with_ttl(
        &self,
        key: &str,
        value: StoredTokens,
        ttl: Duration,
    ) -> Result<(), StoreError>;
}

/// Refill arithmetic shared by every store implementation.
fn refill(state: Option<StoredTokens>, spec: BucketSpec, now_ms: i64) -> f64 {
    match state {
        None => spec.capacity,
        Some(s) => {
            let elapsed = (now_ms - s.updated_ms).max(0) as f64 / 1000.0;
            (s.tokens + elapsed * spec.refill_per_sec).min(spec.capacity)
        }
    }
}

// -----------------------------------------------------------------------------
// In-process fake
// -----------------------------------------------------------------------------

/// In-process store for tests and single-instance deployments. TTLs are
/// accepted and ignored.
#[derive(Debug)]
pub struct InMemoryTokenStore {
    entries: Mutex<HashMap<String, StoredTokens>>,
    reachable: AtomicBool,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            reachable: AtomicBool::new(true),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("simulated outage".to_string()))
        }
    }
}

impl Default for InMemoryTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn get(&self, key: &str) -> Result<Option<StoredTokens>, StoreError> {
        self.check()?;
        Ok(self.entries.lock().get(key).copied())
    }

    async fn conditional_decrement(
        &self,
        key: &str,
        spec: BucketSpec,
        requested: f64,
        now_ms: i64,
    ) -> Result<DecrementOutcome, StoreError> {
        self.check()?;
        let mut entries = self.entries.lock();
        let previous = entries.get(key).copied();
        let mut tokens = refill(previous, spec, now_ms);
        let allowed = tokens >= requested;
        if allowed {
            tokens -= requested;
        }
        let updated_ms = previous.map_or(now_ms, |p| p.updated_ms.max(now_ms));
        entries.insert(key.to_string(), StoredTokens { tokens, updated_ms });
        Ok(DecrementOutcome {
            allowed,
            remaining: tokens,
        })
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: StoredTokens,
        _ttl: Duration,
    ) -> Result<(), StoreError> {
        self.check()?;
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Redis
// -----------------------------------------------------------------------------

const DECREMENT_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local requested = tonumber(ARGV[3])
local now_ms = tonumber(ARGV[4])
local ttl_ms = tonumber(ARGV[5])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
  tokens = capacity
  ts = now_ms
end

local elapsed = math.max(0, now_ms - ts) / 1000.0
tokens = math.min(capacity, tokens + elapsed * rate)

local allowed = 0
if tokens >= requested then
  tokens = tokens - requested
  allowed = 1
end

redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'ts', tostring(math.max(ts, now_ms)))
redis.call('PEXPIRE', KEYS[1], ttl_ms)
return {allowed, tostring(tokens)}
"#;

/// Redis-backed shared counter. Every operation runs under `op_timeout`; a
/// slow store is treated the same as a dead one.
pub struct RedisTokenStore {
    client: redis::Client,
    conn: Mutex<Option<ConnectionManager>>,
    script: redis::Script,
    op_timeout: Duration,
    /// How long an idle bucket survives in Redis.
    key_ttl: Duration,
}

impl std::fmt::Debug for RedisTokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTokenStore")
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

impl RedisTokenStore {
    /// Does not connect. The first operation does, so a Redis outage at boot
    /// only degrades rate limiting to local partitions.
    pub fn new(redis_url: &str, op_timeout: Duration) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            conn: Mutex::new(None),
            script: redis::Script::new(DECREMENT_SCRIPT),
            op_timeout,
            key_ttl: Duration::from_secs(3600),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let cached = self.conn.lock().clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }
        let conn = ConnectionManager::new(self.client.clone()).await?;
        debug!("Token store connected to Redis");
        *self.conn.lock() = Some(conn.clone());
        Ok(conn)
    }

    async fn with_timeout<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.op_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.op_timeout)),
        }
    }
}

#[async_trait]
impl TokenStore for RedisTokenStore {
    async fn get(&self, key: &str) -> Result<Option<StoredTokens>, StoreError> {
        self.with_timeout(async {
            let mut con = self.connection().await?;
            let (tokens, ts): (Option<String>, Option<String>) = redis::cmd("HMGET")
                .arg(key)
                .arg("tokens")
                .arg("ts")
                .query_async(&mut con)
                .await?;
            match (tokens, ts) {
                (Some(t), Some(ts)) => {
                    let tokens = t
                        .parse::<f64>()
                        .map_err(|e| StoreError::Malformed(e.to_string()))?;
                    let updated_ms = ts
                        .parse::<f64>()
                        .map_err(|e| StoreError::Malformed(e.to_string()))?
                        as i64;
                    Ok(Some(StoredTokens { tokens, updated_ms }))
                }
                _ => Ok(None),
            }
        })
        .await
    }

    async fn conditional_decrement(
        &self,
        key: &str,
        spec: BucketSpec,
        requested: f64,
        now_ms: i64,
    ) -> Result<DecrementOutcome, StoreError> {
        self.with_timeout(async {
            let mut con = self.connection().await?;
            let (allowed, remaining): (i64, String) = self
                .script
                .key(key)
                .arg(spec.capacity)
                .arg(spec.refill_per_sec)
                .arg(requested)
                .arg(now_ms)
                .arg(self.key_ttl.as_millis() as i64)
                .invoke_async(&mut con)
                .await?;
            let remaining = remaining
                .parse::<f64>()
                .map_err(|e| StoreError::Malformed(e.to_string()))?;
            Ok(DecrementOutcome {
                allowed: allowed == 1,
                remaining,
            })
        })
        .await
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: StoredTokens,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.with_timeout(async {
            let mut con = self.connection().await?;
            let _: () = redis::pipe()
                .atomic()
                .cmd("HSET")
                .arg(key)
                .arg("tokens")
                .arg(value.tokens.to_string())
                .arg("ts")
                .arg(value.updated_ms)
                .ignore()
                .cmd("PEXPIRE")
                .arg(key)
                .arg(ttl.as_millis() as i64)
                .ignore()
                .query_async(&mut con)
                .await?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: BucketSpec = BucketSpec {
        capacity: 30.0,
        refill_per_sec: 0.5,
    };

    #[tokio::test]
    async fn test_missing_key_starts_full() {
        let store = InMemoryTokenStore::new();
        let out = store.conditional_decrement("k", SPEC, 1.0, 0).await.unwrap();
        assert!(out.allowed);
        assert_eq!(out.remaining, 29.0);
    }

    #[tokio::test]
    async fn test_decrement_is_conditional() {
        let store = InMemoryTokenStore::new();
        store
            .set_with_ttl(
                "k",
                StoredTokens { tokens: 0.5, updated_ms: 0 },
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        let out = store.conditional_decrement("k", SPEC, 1.0, 0).await.unwrap();
        assert!(!out.allowed);
        assert_eq!(out.remaining, 0.5);

        // One second later the half token has become one.
        let out = store.conditional_decrement("k", SPEC, 1.0, 1000).await.unwrap();
        assert!(out.allowed);
        assert_eq!(out.remaining, 0.0);
    }

    #[tokio::test]
    async fn test_outage_fails_closed() {
        let store = InMemoryTokenStore::new();
        store.set_reachable(false);
        assert!(store.conditional_decrement("k", SPEC, 1.0, 0).await.is_err());
        assert!(store.get("k").await.is_err());
        store.set_reachable(true);
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_decrements_never_overshoot() {
        let store = std::sync::Arc::new(InMemoryTokenStore::new());
        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .conditional_decrement("k", SPEC, 1.0, 0)
                        .await
                        .map(|o| o.allowed)
                        .unwrap_or(false)
                })
            })
            .collect();
        let granted = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(true)))
            .count();
        assert_eq!(granted, 30);
    }
}
