//! Id generation backed by the shared store
//!
//! Ids are minted from counters in the shared store so they are unique
//! across every worker of the cluster.

use crate::error::{Result, RouterError};
use crate::message::Id;
use crate::store::keys;
use crate::store::SharedStore;
use std::sync::Arc;

/// Mints cluster-unique ids for one worker
#[derive(Clone)]
pub struct IdGenerator {
    store: Arc<dyn SharedStore>,
    server_id: String,
}

impl IdGenerator {
    pub fn new(store: Arc<dyn SharedStore>, server_id: impl Into<String>) -> Self {
        Self {
            store,
            server_id: server_id.into(),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Next value of the cluster-wide sequence
    ///
    /// Used for registration, subscription, publication and invocation ids.
    pub async fn global(&self) -> Result<Id> {
        let next = self
            .store
            .hincr(keys::ID_COUNTERS, keys::GLOBAL_ID_FIELD, 1)
            .await?;
        to_id(next)
    }

    /// Next worker-scoped id, formatted `<serverId>:<n>`
    pub async fn router_scoped(&self) -> Result<String> {
        let next = self.store.hincr(keys::ID_COUNTERS, &self.server_id, 1).await?;
        Ok(format!("{}:{}", self.server_id, next))
    }

    /// Next session id: the UTC day (`YYYYMMDD`) followed by a
    /// zero-padded six digit counter for that day
    pub async fn session_id(&self) -> Result<Id> {
        let prefix = chrono::Utc::now().format("%Y%m%d").to_string();
        let next = self
            .store
            .hincr(keys::SESSION_ID_SEQUENCE, &prefix, 1)
            .await?;
        format_session_id(&prefix, next)
    }
}

fn to_id(value: i64) -> Result<Id> {
    Id::try_from(value)
        .map_err(|_| RouterError::Invariant(format!("id counter went negative: {}", value)))
}

fn format_session_id(prefix: &str, counter: i64) -> Result<Id> {
    let formatted = format!("{}{:06}", prefix, to_id(counter)?);
    formatted
        .parse()
        .map_err(|_| RouterError::Invariant(format!("session id '{}' is not numeric", formatted)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_global_ids_are_shared_between_workers() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let a = IdGenerator::new(store.clone(), "a");
        let b = IdGenerator::new(store.clone(), "b");

        assert_eq!(a.global().await.unwrap(), 1);
        assert_eq!(b.global().await.unwrap(), 2);
        assert_eq!(a.global().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_router_scoped_ids() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let a = IdGenerator::new(store.clone(), "a");
        let b = IdGenerator::new(store.clone(), "b");

        assert_eq!(a.router_scoped().await.unwrap(), "a:1");
        assert_eq!(a.router_scoped().await.unwrap(), "a:2");
        assert_eq!(b.router_scoped().await.unwrap(), "b:1");
    }

    #[tokio::test]
    async fn test_session_id_format() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let ids = IdGenerator::new(store, "a");
        let first = ids.session_id().await.unwrap();
        let second = ids.session_id().await.unwrap();

        let text = first.to_string();
        assert_eq!(text.len(), 14);
        assert!(text.ends_with("000001"));
        assert_eq!(second, first + 1);
    }

    #[test]
    fn test_format_session_id() {
        assert_eq!(format_session_id("20240131", 42).unwrap(), 20240131000042);
        assert!(format_session_id("20240131", -1).is_err());
    }
}
