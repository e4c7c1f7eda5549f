//! Redis shared store
//!
//! Uses one multiplexed `ConnectionManager` for commands and a dedicated
//! pub/sub connection per subscription. Hash values are JSON text so
//! integers stay usable by `HINCRBY`.

use super::SharedStore;
use crate::config::RedisConfig;
use crate::error::{Result, RouterError};
use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client, Script};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use std::time::Duration;

const UNLOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const COMPARE_AND_SET_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then
    redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
    return 1
end
return 0
"#;

/// Redis-backed [`SharedStore`]
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| RouterError::Config(format!("Invalid Redis URL '{}': {}", config.url, e)))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| RouterError::Connection(format!("Failed to connect to Redis: {}", e)))?;

        tracing::info!(url = %config.url, "Connected to Redis");

        Ok(Self { client, conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn encode(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn decode(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        let found: bool = self.conn().exists(key).await?;
        Ok(found)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed: usize = self.conn().del(key).await?;
        Ok(removed > 0)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.conn().keys(pattern).await?;
        keys.sort();
        Ok(keys)
    }

    async fn hset(&self, key: &str, field: &str, value: &Value) -> Result<()> {
        let _: () = self.conn().hset(key, field, encode(value)?).await?;
        Ok(())
    }

    async fn hset_all(&self, key: &str, fields: &[(String, Value)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let encoded = fields
            .iter()
            .map(|(field, value)| Ok((field.clone(), encode(value)?)))
            .collect::<Result<Vec<(String, String)>>>()?;
        let _: () = self.conn().hset_multiple(key, encoded.as_slice()).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Value>> {
        let raw: Option<String> = self.conn().hget(key, field).await?;
        Ok(raw.map(decode))
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Value)>> {
        let flat: Vec<String> = self.conn().hgetall(key).await?;
        let mut flat = flat.into_iter();
        let mut fields = Vec::new();
        while let (Some(field), Some(raw)) = (flat.next(), flat.next()) {
            fields.push((field, decode(raw)));
        }
        Ok(fields)
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>> {
        let fields: Vec<String> = self.conn().hkeys(key).await?;
        Ok(fields)
    }

    async fn hlen(&self, key: &str) -> Result<usize> {
        let len: usize = self.conn().hlen(key).await?;
        Ok(len)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let removed: usize = self.conn().hdel(key, field).await?;
        Ok(removed > 0)
    }

    async fn hincr(&self, key: &str, field: &str, by: i64) -> Result<i64> {
        let value: i64 = self.conn().hincr(key, field, by).await?;
        Ok(value)
    }

    async fn hcompare_and_set(
        &self,
        key: &str,
        field: &str,
        expected: &Value,
        new: &Value,
    ) -> Result<bool> {
        let mut conn = self.conn();
        let swapped: i32 = Script::new(COMPARE_AND_SET_SCRIPT)
            .key(key)
            .arg(field)
            .arg(encode(expected)?)
            .arg(encode(new)?)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let added: usize = self.conn().sadd(key, member).await?;
        Ok(added > 0)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let members: Vec<String> = self.conn().smembers(key).await?;
        Ok(members)
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i32 = Script::new(UNLOCK_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn publish(&self, channel: &str, payload: &Value) -> Result<()> {
        let _: i64 = self.conn().publish(channel, encode(payload)?).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Value>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        tracing::debug!(channel = %channel, "Subscribed to Redis channel");

        Ok(pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                match msg.get_payload::<String>() {
                    Ok(raw) => Some(decode(raw)),
                    Err(e) => {
                        tracing::warn!(error = %e, "Unreadable notification payload");
                        None
                    }
                }
            })
            .boxed())
    }

    fn name(&self) -> &str {
        "redis"
    }
}
