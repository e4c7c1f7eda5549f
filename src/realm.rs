//! Realms and the per-worker realm manager
//!
//! [`RealmManager`] is the entry point for inbound messages: it opens and
//! closes sessions, attaches sessions to realms on HELLO and hands every
//! other message to the session's [`Realm`].

use crate::broker::Broker;
use crate::config::RouterConfig;
use crate::dealer::Dealer;
use crate::error::{Result, RouterError};
use crate::ids::IdGenerator;
use crate::message::{Dict, Message};
use crate::router::{Role, Router, RouterContext, RouterEvent};
use crate::session::{AuthenticationDetails, Session, SessionStorage};
use crate::store::{keys, SharedStore};
use crate::transport::{Connector, Relay, RelayConnector, Transport};
use crate::uri;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::{OnceCell, RwLock};
use tokio::task::JoinHandle;

/// A named routing domain
pub struct Realm {
    name: String,
    ctx: RouterContext,
    router: Router,
    meta_session: OnceCell<Arc<Session>>,
}

impl Realm {
    /// Realm with the broker and dealer roles
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(name: impl Into<String>, ctx: RouterContext) -> Arc<Self> {
        let name = name.into();
        let roles: Vec<Arc<dyn Role>> = vec![
            Arc::new(Broker::new(ctx.clone(), name.clone())),
            Arc::new(Dealer::new(ctx.clone(), name.clone())),
        ];
        Arc::new(Self {
            name,
            ctx,
            router: Router::new(roles),
            meta_session: OnceCell::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Attach a session and persist the attachment
    pub async fn add_session(self: &Arc<Self>, session: &Arc<Session>) -> Result<()> {
        session.set_realm(self)?;
        self.ctx.sessions.save_session(session).await
    }

    /// Handle a message or event for a session of this realm
    pub async fn handle(self: &Arc<Self>, session: &Arc<Session>, event: &RouterEvent) -> Result<()> {
        match event {
            RouterEvent::Message(Message::Hello { .. }) => return self.on_hello(session).await,
            RouterEvent::LeaveRealm => self.on_leave(session).await?,
            _ => {}
        }
        self.router.handle(session, event).await
    }

    async fn on_hello(self: &Arc<Self>, session: &Arc<Session>) -> Result<()> {
        if session.is_authenticated() {
            tracing::debug!(session_id = session.id(), "Repeated HELLO ignored");
            return Ok(());
        }

        let auth = AuthenticationDetails::anonymous();
        let mut details = Dict::new();
        details.insert("authid".to_string(), json!(auth.authid));
        details.insert("authrole".to_string(), json!(auth.authrole));
        details.insert("authmethod".to_string(), json!(auth.authmethod));
        details.insert("roles".to_string(), router_roles());

        session.set_authentication_details(auth)?;
        session.set_authenticated(true);
        session
            .send(Message::Welcome {
                session: session.id(),
                details,
            })
            .await;
        self.ctx.sessions.save_session(session).await?;

        tracing::info!(realm = %self.name, session_id = session.id(), "Session joined realm");
        self.publish_meta(uri::SESSION_ON_JOIN, vec![session.meta_info()])
            .await
    }

    async fn on_leave(self: &Arc<Self>, session: &Arc<Session>) -> Result<()> {
        if session.is_authenticated() {
            self.publish_meta(uri::SESSION_ON_LEAVE, vec![session.meta_info()])
                .await?;
        }
        self.ctx.sessions.remove_session(session).await?;
        tracing::info!(realm = %self.name, session_id = session.id(), "Session left realm");
        Ok(())
    }

    /// The router's own session in this realm
    pub async fn meta_session(self: &Arc<Self>) -> Result<Arc<Session>> {
        self.meta_session
            .get_or_try_init(|| self.ctx.sessions.create_meta(self))
            .await
            .cloned()
    }

    /// Publish a router-originated event on `topic`
    pub async fn publish_meta(self: &Arc<Self>, topic: &str, args: Vec<Value>) -> Result<()> {
        let meta = self.meta_session().await?;
        let publish = Message::Publish {
            request: self.ctx.ids.global().await?,
            options: Dict::new(),
            topic: topic.to_string(),
            args,
            kwargs: Dict::new(),
        };
        self.router
            .handle(&meta, &RouterEvent::Message(publish))
            .await
    }
}

impl std::fmt::Debug for Realm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Realm")
            .field("name", &self.name)
            .field("roles", &self.router.role_names())
            .finish()
    }
}

/// Roles and features advertised in WELCOME
fn router_roles() -> Value {
    json!({
        "broker": {
            "features": {
                "publisher_exclusion": true,
                "publisher_identification": true,
            }
        },
        "dealer": {
            "features": {
                "progressive_call_results": true,
                "call_canceling": true,
                "caller_identification": true,
            }
        }
    })
}

/// Realms of one worker and the entry point for inbound traffic
pub struct RealmManager {
    ctx: RouterContext,
    realms: RwLock<HashMap<String, Arc<Realm>>>,
    relay_task: OnceLock<JoinHandle<()>>,
}

impl RealmManager {
    /// Start a worker: session storage, the cross-worker relay and the
    /// configured realms
    pub async fn new(config: RouterConfig, store: Arc<dyn SharedStore>) -> Result<Arc<Self>> {
        let server_id = config.resolve_server_id();
        let relay = Relay::new(store.clone(), server_id.clone());
        let inbox = relay.listen().await?;
        let connector = Arc::new(RelayConnector::new(Arc::clone(&relay)));

        let manager = Self::with_connector(config, store, server_id, connector).await?;
        let sessions = Arc::downgrade(&manager.ctx.sessions);
        let task = tokio::spawn(relay.serve(inbox, sessions));
        let _ = manager.relay_task.set(task);
        Ok(manager)
    }

    /// Start a worker that reaches remote sessions through `connector`
    pub async fn with_connector(
        mut config: RouterConfig,
        store: Arc<dyn SharedStore>,
        server_id: impl Into<String>,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<Self>> {
        let server_id = server_id.into();
        config.server_id = Some(server_id.clone());
        config.validate()?;

        let ids = IdGenerator::new(store.clone(), server_id.clone());
        let realms_to_create = config.realms.clone();
        let config = Arc::new(config);
        let manager = Arc::new_cyclic(|weak| {
            let sessions = Arc::new(SessionStorage::new(
                store.clone(),
                ids.clone(),
                connector,
                weak.clone(),
            ));
            Self {
                ctx: RouterContext {
                    store,
                    sessions,
                    ids,
                    config,
                },
                realms: RwLock::new(HashMap::new()),
                relay_task: OnceLock::new(),
            }
        });

        for name in realms_to_create {
            manager.add_realm(&name).await?;
        }
        tracing::info!(server_id = %server_id, "Router worker started");
        Ok(manager)
    }

    pub fn server_id(&self) -> &str {
        self.ctx.ids.server_id()
    }

    pub fn sessions(&self) -> &Arc<SessionStorage> {
        &self.ctx.sessions
    }

    pub fn context(&self) -> &RouterContext {
        &self.ctx
    }

    pub async fn get_realm(&self, name: &str) -> Option<Arc<Realm>> {
        self.realms.read().await.get(name).cloned()
    }

    pub async fn has_realm(&self, name: &str) -> bool {
        self.realms.read().await.contains_key(name)
    }

    pub async fn realm_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.realms.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Create a realm on this worker and advertise it to the cluster
    pub async fn add_realm(&self, name: &str) -> Result<Arc<Realm>> {
        let realm = self.adopt_realm(name).await;
        if self.ctx.store.sadd(keys::REALMS, name).await? {
            self.ctx
                .store
                .publish(keys::REALMS_ADDED, &json!(name))
                .await?;
            tracing::info!(realm = %name, "Realm added");
        }
        Ok(realm)
    }

    /// Create a realm locally without advertising it
    async fn adopt_realm(&self, name: &str) -> Arc<Realm> {
        let mut realms = self.realms.write().await;
        if let Some(realm) = realms.get(name) {
            return Arc::clone(realm);
        }
        let realm = Realm::new(name, self.ctx.clone());
        realms.insert(name.to_string(), Arc::clone(&realm));
        tracing::debug!(realm = %name, server_id = %self.server_id(), "Realm created");
        realm
    }

    /// Adopt every realm listed in the shared `realms` set
    pub async fn sync_realms(&self) -> Result<usize> {
        let mut adopted = 0;
        for name in self.ctx.store.smembers(keys::REALMS).await? {
            if !self.has_realm(&name).await {
                self.adopt_realm(&name).await;
                adopted += 1;
            }
        }
        Ok(adopted)
    }

    /// Adopt realms announced on `realms:added` until the manager is gone
    pub async fn watch_realms(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let mut announcements = self.ctx.store.subscribe(keys::REALMS_ADDED).await?;
        let manager = Arc::downgrade(self);
        Ok(tokio::spawn(async move {
            while let Some(payload) = announcements.next().await {
                let Some(name) = payload.as_str() else {
                    tracing::warn!(payload = %payload, "Malformed realm announcement");
                    continue;
                };
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.adopt_realm(name).await;
            }
        }))
    }

    /// Create and persist the session of a newly opened connection
    ///
    /// The session record is visible cluster-wide before this returns.
    pub async fn open_session(&self, transport: Arc<dyn Transport>) -> Result<Arc<Session>> {
        let session = self.ctx.sessions.create_session(transport).await?;
        self.ctx.sessions.save_session(&session).await?;
        tracing::debug!(
            session_id = session.id(),
            transport_id = %session.transport_id(),
            "Session opened"
        );
        Ok(session)
    }

    /// Route one inbound message
    pub async fn dispatch(&self, session: &Arc<Session>, message: Message) -> Result<()> {
        if let Message::Hello { realm, mut details } = message {
            let Some(target) = self.get_realm(&realm).await else {
                return self
                    .reject(session, format!("realm '{}' does not exist", realm))
                    .await;
            };
            details.insert(
                "transport".to_string(),
                Value::Object(session.transport().details()),
            );
            if session.realm().is_none() {
                session.set_hello_details(details.clone())?;
                target.add_session(session).await?;
            }
            let hello = Message::Hello { realm, details };
            return target.handle(session, &RouterEvent::Message(hello)).await;
        }

        match session.realm() {
            Some(realm) => realm.handle(session, &RouterEvent::Message(message)).await,
            None => {
                self.reject(session, "session is not attached to a realm".to_string())
                    .await
            }
        }
    }

    async fn reject(&self, session: &Arc<Session>, reason: String) -> Result<()> {
        tracing::debug!(session_id = session.id(), reason = %reason, "Session aborted");
        let mut details = Dict::new();
        details.insert("message".to_string(), json!(reason));
        session.abort(details, uri::NO_SUCH_REALM).await?;
        session.shutdown().await;
        Ok(())
    }

    /// Clean up after a connection closed
    ///
    /// Retries while the session is not yet visible locally.
    pub async fn close_session(&self, transport_id: &str) -> Result<()> {
        let config = &self.ctx.config;
        let Some(session) = self
            .ctx
            .sessions
            .wait_for_local(
                transport_id,
                config.close_retry_attempts,
                config.close_retry_backoff(),
            )
            .await
        else {
            tracing::warn!(transport_id = %transport_id, "Closed connection has no session");
            return Err(RouterError::SessionNotFound(transport_id.to_string()));
        };

        session.on_close().await;
        if session.realm().is_none() {
            self.ctx.sessions.remove_session(&session).await?;
        }
        tracing::debug!(session_id = session.id(), "Session closed");
        Ok(())
    }
}

impl Drop for RealmManager {
    fn drop(&mut self) {
        if let Some(task) = self.relay_task.get() {
            task.abort();
        }
    }
}
