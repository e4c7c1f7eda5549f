//! Session directory
//!
//! Keeps this worker's sessions by transport id and mirrors every one of
//! them as a `ses:<sessionId>:<base64(transportId)>` record so other
//! workers can reach them.

use super::{AuthenticationDetails, Session};
use crate::error::Result;
use crate::ids::IdGenerator;
use crate::message::{Dict, Id};
use crate::realm::{Realm, RealmManager};
use crate::store::{decode_record, encode_record, keys, SharedStore};
use crate::transport::{Connector, NullTransport, Transport};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;

/// Shared-store image of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: Id,
    pub transport_id: String,
    pub authenticated: bool,
    pub realm: Option<String>,
    pub trusted: bool,
    pub server_id: String,
    pub websocket_protocol: String,
    #[serde(default)]
    pub roles: Option<Value>,
    #[serde(default)]
    pub auth_details: Option<AuthenticationDetails>,
}

impl SessionRecord {
    pub fn from_session(session: &Session) -> Self {
        Self {
            id: session.id(),
            transport_id: session.transport_id().to_string(),
            authenticated: session.is_authenticated(),
            realm: session.realm_name().map(str::to_string),
            trusted: session.is_trusted(),
            server_id: session.server_id().to_string(),
            websocket_protocol: session.transport().protocol().to_string(),
            roles: session.roles().cloned(),
            auth_details: session.authentication_details().cloned(),
        }
    }
}

/// Directory of sessions, local and remote
pub struct SessionStorage {
    server_id: String,
    store: Arc<dyn SharedStore>,
    ids: IdGenerator,
    connector: Arc<dyn Connector>,
    realms: Weak<RealmManager>,
    local: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionStorage {
    pub fn new(
        store: Arc<dyn SharedStore>,
        ids: IdGenerator,
        connector: Arc<dyn Connector>,
        realms: Weak<RealmManager>,
    ) -> Self {
        Self {
            server_id: ids.server_id().to_string(),
            store,
            ids,
            connector,
            realms,
            local: RwLock::new(HashMap::new()),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// New session for a connection accepted by this worker
    pub async fn create_session(&self, transport: Arc<dyn Transport>) -> Result<Arc<Session>> {
        let session = Session::new(transport, self.server_id.clone());
        session.set_id(self.ids.session_id().await?)?;
        Ok(session)
    }

    /// The router's own session for `realm`, used to publish meta events
    pub async fn create_meta(&self, realm: &Arc<Realm>) -> Result<Arc<Session>> {
        let transport = Arc::new(NullTransport::new(format!(
            "meta:{}:{}",
            self.server_id,
            realm.name()
        )));
        let session = Session::new_meta(transport, self.server_id.clone());
        session.set_id(self.ids.session_id().await?)?;
        session.set_realm(realm)?;
        session.set_authenticated(true);
        session.set_trusted(true);
        self.save_session(&session).await?;
        Ok(session)
    }

    /// Persist a session; sessions owned by other workers are left alone
    pub async fn save_session(&self, session: &Arc<Session>) -> Result<()> {
        if session.server_id() != self.server_id && !session.is_meta() {
            return Ok(());
        }
        self.local
            .write()
            .await
            .insert(session.transport_id().to_string(), Arc::clone(session));

        let key = keys::session(session.id(), session.transport_id());
        let record = SessionRecord::from_session(session);
        self.store.hset_all(&key, &encode_record(&record)?).await?;

        tracing::debug!(
            session_id = session.id(),
            transport_id = %session.transport_id(),
            realm = ?session.realm_name(),
            "Session saved"
        );
        Ok(())
    }

    pub async fn remove_session(&self, session: &Session) -> Result<()> {
        {
            let mut local = self.local.write().await;
            let owned = local
                .get(session.transport_id())
                .map(|s| s.id() == session.id())
                .unwrap_or(false);
            if owned {
                local.remove(session.transport_id());
            }
        }
        self.store
            .delete(&keys::session(session.id(), session.transport_id()))
            .await?;
        Ok(())
    }

    /// Session of a connection owned by this worker
    pub async fn get_local(&self, transport_id: &str) -> Option<Arc<Session>> {
        self.local.read().await.get(transport_id).cloned()
    }

    pub async fn in_local(&self, transport_id: &str) -> bool {
        self.local.read().await.contains_key(transport_id)
    }

    /// Resolve a session by transport id, falling back to the shared
    /// record when `global` is set
    pub async fn get_by_transport_id(
        &self,
        transport_id: &str,
        global: bool,
    ) -> Result<Option<Arc<Session>>> {
        if let Some(session) = self.get_local(transport_id).await {
            return Ok(Some(session));
        }
        if !global {
            return Ok(None);
        }

        let found = self
            .store
            .keys(&keys::session_by_transport(transport_id))
            .await?;
        let Some(key) = found.first() else {
            return Ok(None);
        };
        let fields = self.store.hgetall(key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let record: SessionRecord = decode_record(fields)?;
        self.from_record(record).await
    }

    /// Shorthand for a global lookup
    pub async fn resolve(&self, transport_id: &str) -> Result<Option<Arc<Session>>> {
        self.get_by_transport_id(transport_id, true).await
    }

    /// Rebuild a proxy session from its shared record
    pub async fn from_record(&self, record: SessionRecord) -> Result<Option<Arc<Session>>> {
        if let Some(session) = self.get_local(&record.transport_id).await {
            return Ok(Some(session));
        }
        let Some(transport) = self.connector.connect(
            &record.transport_id,
            &record.server_id,
            &record.websocket_protocol,
        ) else {
            tracing::debug!(
                session_id = record.id,
                transport_id = %record.transport_id,
                server_id = %record.server_id,
                "Session record has no reachable connection"
            );
            return Ok(None);
        };

        let session = Session::new(transport, record.server_id.clone());
        session.set_id(record.id)?;
        session.set_authenticated(record.authenticated);
        session.set_trusted(record.trusted);
        if let Some(roles) = record.roles {
            let mut details = Dict::new();
            details.insert("roles".to_string(), roles);
            session.set_hello_details(details)?;
        }
        if let Some(auth) = record.auth_details {
            session.set_authentication_details(auth)?;
        }
        if let Some(name) = record.realm.as_deref() {
            if let Some(realm) = self.realm(name).await {
                session.set_realm(&realm)?;
            }
        }
        Ok(Some(session))
    }

    /// Wait until a connection's session is registered locally
    pub async fn wait_for_local(
        &self,
        transport_id: &str,
        attempts: u32,
        backoff: Duration,
    ) -> Option<Arc<Session>> {
        for attempt in 0..attempts {
            if let Some(session) = self.get_local(transport_id).await {
                return Some(session);
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(backoff).await;
            }
        }
        None
    }

    /// Number of sessions owned by this worker
    pub async fn local_count(&self) -> usize {
        self.local.read().await.len()
    }

    async fn realm(&self, name: &str) -> Option<Arc<Realm>> {
        match self.realms.upgrade() {
            Some(manager) => manager.get_realm(name).await,
            None => None,
        }
    }
}
