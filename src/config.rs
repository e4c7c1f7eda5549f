//! Router and shared-store configuration

use crate::error::{Result, RouterError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration of one router worker
///
/// Every worker of a cluster shares the same store; only `server_id`
/// differs between them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterConfig {
    /// Unique worker id. A random UUID is used when absent.
    pub server_id: Option<String>,

    /// Realms created when the worker starts
    pub realms: Vec<String>,

    /// TTL of the procedure-creation lock in milliseconds
    pub lock_ttl_ms: u64,

    /// Maximum wait for the procedure-creation lock in milliseconds
    pub lock_wait_ms: u64,

    /// How long a ping may take before the peer is declared dead
    pub ping_timeout_ms: u64,

    /// Attempts made to resolve a closing session before giving up
    pub close_retry_attempts: u32,

    /// Delay between close attempts in milliseconds
    pub close_retry_backoff_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            server_id: None,
            realms: vec!["realm1".to_string()],
            lock_ttl_ms: 2000,
            lock_wait_ms: 2000,
            ping_timeout_ms: 5000,
            close_retry_attempts: 10,
            close_retry_backoff_ms: 1000,
        }
    }
}

impl RouterConfig {
    /// Config with an explicit worker id
    pub fn with_server_id(server_id: impl Into<String>) -> Self {
        Self {
            server_id: Some(server_id.into()),
            ..Default::default()
        }
    }

    /// Reject values the router cannot run with
    pub fn validate(&self) -> Result<()> {
        if let Some(id) = &self.server_id {
            if id.is_empty() || id.contains(':') {
                return Err(RouterError::Config(format!(
                    "server id '{}' must be non-empty and must not contain ':'",
                    id
                )));
            }
        }
        if self.realms.iter().any(|r| r.is_empty()) {
            return Err(RouterError::Config("realm names must not be empty".to_string()));
        }
        if self.lock_ttl_ms == 0 {
            return Err(RouterError::Config("lockTtlMs must be positive".to_string()));
        }
        if self.ping_timeout_ms == 0 {
            return Err(RouterError::Config("pingTimeoutMs must be positive".to_string()));
        }
        if self.close_retry_attempts == 0 {
            return Err(RouterError::Config(
                "closeRetryAttempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The configured worker id, or a fresh random one
    pub fn resolve_server_id(&self) -> String {
        self.server_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn close_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.close_retry_backoff_ms)
    }
}

/// Redis shared-store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RedisConfig {
    /// Connection URL
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}
