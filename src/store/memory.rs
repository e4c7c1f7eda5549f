//! In-memory shared store
//!
//! Backs a single process (several workers sharing one `Arc`) and the
//! test suites. Hashes keep field insertion order.

use super::SharedStore;
use crate::error::{Result, RouterError};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use globset::GlobBuilder;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum Entry {
    Hash(Vec<(String, Value)>),
    Set(Vec<String>),
    Lock {
        token: String,
        expires_at: Instant,
    },
}

/// In-memory [`SharedStore`]
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
    channels: RwLock<HashMap<String, broadcast::Sender<Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys
    pub async fn len(&self) -> usize {
        let mut entries = self.entries.write().await;
        purge_expired(&mut entries);
        entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn purge_expired(entries: &mut HashMap<String, Entry>) {
    let now = Instant::now();
    entries.retain(|_, entry| match entry {
        Entry::Lock { expires_at, .. } => *expires_at > now,
        _ => true,
    });
}

fn wrong_type(key: &str) -> RouterError {
    RouterError::Store(format!(
        "WRONGTYPE operation against key '{}' holding the wrong kind of value",
        key
    ))
}

fn hash_mut<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut Vec<(String, Value)>> {
    match entries
        .entry(key.to_string())
        .or_insert_with(|| Entry::Hash(Vec::new()))
    {
        Entry::Hash(fields) => Ok(fields),
        _ => Err(wrong_type(key)),
    }
}

fn hash_ref<'a>(
    entries: &'a HashMap<String, Entry>,
    key: &str,
) -> Result<Option<&'a Vec<(String, Value)>>> {
    match entries.get(key) {
        None => Ok(None),
        Some(Entry::Hash(fields)) => Ok(Some(fields)),
        Some(_) => Err(wrong_type(key)),
    }
}

fn upsert(fields: &mut Vec<(String, Value)>, field: &str, value: Value) {
    match fields.iter_mut().find(|(name, _)| name == field) {
        Some(slot) => slot.1 = value,
        None => fields.push((field.to_string(), value)),
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.write().await;
        purge_expired(&mut entries);
        Ok(entries.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.write().await;
        purge_expired(&mut entries);
        Ok(entries.remove(key).is_some())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = GlobBuilder::new(pattern)
            .literal_separator(false)
            .build()
            .map_err(|e| RouterError::Store(format!("Invalid key pattern '{}': {}", pattern, e)))?
            .compile_matcher();

        let mut entries = self.entries.write().await;
        purge_expired(&mut entries);
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|key| matcher.is_match(key.as_str()))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn hset(&self, key: &str, field: &str, value: &Value) -> Result<()> {
        let mut entries = self.entries.write().await;
        let fields = hash_mut(&mut entries, key)?;
        upsert(fields, field, value.clone());
        Ok(())
    }

    async fn hset_all(&self, key: &str, values: &[(String, Value)]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let mut entries = self.entries.write().await;
        let fields = hash_mut(&mut entries, key)?;
        for (field, value) in values {
            upsert(fields, field, value.clone());
        }
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Value>> {
        let entries = self.entries.read().await;
        Ok(hash_ref(&entries, key)?.and_then(|fields| {
            fields
                .iter()
                .find(|(name, _)| name == field)
                .map(|(_, value)| value.clone())
        }))
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Value)>> {
        let entries = self.entries.read().await;
        Ok(hash_ref(&entries, key)?.cloned().unwrap_or_default())
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>> {
        let entries = self.entries.read().await;
        Ok(hash_ref(&entries, key)?
            .map(|fields| fields.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default())
    }

    async fn hlen(&self, key: &str) -> Result<usize> {
        let entries = self.entries.read().await;
        Ok(hash_ref(&entries, key)?.map(Vec::len).unwrap_or(0))
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let (removed, now_empty) = match entries.get_mut(key) {
            None => return Ok(false),
            Some(Entry::Hash(fields)) => {
                let before = fields.len();
                fields.retain(|(name, _)| name != field);
                (fields.len() != before, fields.is_empty())
            }
            Some(_) => return Err(wrong_type(key)),
        };
        if now_empty {
            entries.remove(key);
        }
        Ok(removed)
    }

    async fn hincr(&self, key: &str, field: &str, by: i64) -> Result<i64> {
        let mut entries = self.entries.write().await;
        let fields = hash_mut(&mut entries, key)?;
        let current = match fields.iter().find(|(name, _)| name == field) {
            None => 0,
            Some((_, value)) => value.as_i64().ok_or_else(|| {
                RouterError::Store(format!("hash value {}.{} is not an integer", key, field))
            })?,
        };
        let next = current + by;
        upsert(fields, field, Value::from(next));
        Ok(next)
    }

    async fn hcompare_and_set(
        &self,
        key: &str,
        field: &str,
        expected: &Value,
        new: &Value,
    ) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let fields = match entries.get_mut(key) {
            None => return Ok(false),
            Some(Entry::Hash(fields)) => fields,
            Some(_) => return Err(wrong_type(key)),
        };
        match fields.iter_mut().find(|(name, _)| name == field) {
            Some(slot) if slot.1 == *expected => {
                slot.1 = new.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut entries = self.entries.write().await;
        match entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Set(Vec::new()))
        {
            Entry::Set(members) => {
                if members.iter().any(|m| m == member) {
                    Ok(false)
                } else {
                    members.push(member.to_string());
                    Ok(true)
                }
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            None => Ok(Vec::new()),
            Some(Entry::Set(members)) => Ok(members.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.write().await;
        purge_expired(&mut entries);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry::Lock {
                token: token.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool> {
        let mut entries = self.entries.write().await;
        purge_expired(&mut entries);
        match entries.get(key) {
            Some(Entry::Lock { token: owner, .. }) if owner == token => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn publish(&self, channel: &str, payload: &Value) -> Result<()> {
        let channels = self.channels.read().await;
        if let Some(sender) = channels.get(channel) {
            // No receivers is not an error
            let _ = sender.send(payload.clone());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Value>> {
        let receiver = {
            let mut channels = self.channels.write().await;
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };
        let name = channel.to_string();
        Ok(BroadcastStream::new(receiver)
            .filter_map(move |item| {
                let name = name.clone();
                async move {
                    match item {
                        Ok(value) => Some(value),
                        Err(e) => {
                            tracing::warn!(channel = %name, error = %e, "Notification dropped");
                            None
                        }
                    }
                }
            })
            .boxed())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
