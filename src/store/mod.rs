//! Shared directory: the key-value store every worker coordinates through
//!
//! All cross-worker routing state (procedures, registrations,
//! subscriptions, call correlation, sessions, id counters) lives behind
//! [`SharedStore`]. Backends implement this one narrow interface; nothing
//! else in the crate talks to a store directly.
//!
//! Values are JSON. Hashes whose last field is removed disappear, as they
//! do in Redis.

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use std::time::Duration;

pub mod keys;
pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Delay between two lock attempts
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(10);
const LOCK_RETRY_MAX_DELAY: Duration = Duration::from_millis(100);

/// Atomic key/hash/set/counter/lock/pub-sub primitives over a shared store
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Whether a key exists (of any type)
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Delete a key, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Keys matching a glob pattern (`*`, `?`, `[..]`)
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Set one hash field
    async fn hset(&self, key: &str, field: &str, value: &Value) -> Result<()>;

    /// Set several hash fields at once
    async fn hset_all(&self, key: &str, fields: &[(String, Value)]) -> Result<()>;

    /// Read one hash field
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Value>>;

    /// Read a whole hash; empty when the key is absent
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Value)>>;

    /// Field names of a hash
    async fn hkeys(&self, key: &str) -> Result<Vec<String>>;

    /// Number of fields of a hash
    async fn hlen(&self, key: &str) -> Result<usize>;

    /// Remove one hash field, returning whether it existed
    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;

    /// Atomically add `by` to an integer hash field (missing counts as 0)
    async fn hincr(&self, key: &str, field: &str, by: i64) -> Result<i64>;

    /// Atomically replace a hash field if it still holds `expected`
    async fn hcompare_and_set(
        &self,
        key: &str,
        field: &str,
        expected: &Value,
        new: &Value,
    ) -> Result<bool>;

    /// Add a set member, returning whether it was newly added
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;

    /// Members of a set
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// Take an advisory lock if nobody holds it; it expires after `ttl`
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Release a lock, only if `token` still owns it
    async fn unlock(&self, key: &str, token: &str) -> Result<bool>;

    /// Publish a notification on a channel
    async fn publish(&self, channel: &str, payload: &Value) -> Result<()>;

    /// Stream of notifications published on a channel from now on
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Value>>;

    /// Backend name (e.g., "memory", "redis")
    fn name(&self) -> &str;

    /// Acquire a lock, retrying with backoff for at most `wait`
    ///
    /// Returns `false` when the lock could not be taken in time.
    async fn lock(&self, key: &str, token: &str, ttl: Duration, wait: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + wait;
        let mut delay = LOCK_RETRY_DELAY;
        loop {
            if self.try_lock(key, token, ttl).await? {
                return Ok(true);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                tracing::warn!(key = %key, waited_ms = wait.as_millis() as u64, "Lock wait expired");
                return Ok(false);
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(LOCK_RETRY_MAX_DELAY);
        }
    }

    /// Every hash whose key matches `pattern`, with its fields
    async fn find(&self, pattern: &str) -> Result<Vec<(String, Vec<(String, Value)>)>> {
        let mut found = Vec::new();
        for key in self.keys(pattern).await? {
            let fields = self.hgetall(&key).await?;
            if !fields.is_empty() {
                found.push((key, fields));
            }
        }
        Ok(found)
    }
}

/// Decode a hash into a serde record
pub fn decode_record<T: serde::de::DeserializeOwned>(fields: Vec<(String, Value)>) -> Result<T> {
    let map: serde_json::Map<String, Value> = fields.into_iter().collect();
    Ok(serde_json::from_value(Value::Object(map))?)
}

/// Encode a serde record into hash fields
pub fn encode_record<T: serde::Serialize>(record: &T) -> Result<Vec<(String, Value)>> {
    match serde_json::to_value(record)? {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Ok(vec![("value".to_string(), other)]),
    }
}
