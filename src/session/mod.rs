//! Sessions: one peer attached to the router
//!
//! A session wraps the peer's [`Transport`]. Sessions owned by this worker
//! carry a real connection; proxy sessions rebuilt from the shared store
//! reach a connection owned by another worker.

use crate::error::{Result, RouterError};
use crate::message::{Dict, Id, Message, MessageKind};
use crate::realm::Realm;
use crate::router::RouterEvent;
use crate::transport::Transport;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

mod storage;

pub use storage::{SessionRecord, SessionStorage};

/// Who the peer is, as established at HELLO
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationDetails {
    pub authid: String,
    pub authrole: String,
    pub authroles: Vec<String>,
    pub authmethod: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authextra: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authprovider: Option<String>,
}

impl AuthenticationDetails {
    /// Details of an anonymous peer
    pub fn anonymous() -> Self {
        Self {
            authid: "anonymous".to_string(),
            authrole: "anonymous".to_string(),
            authroles: vec!["anonymous".to_string()],
            authmethod: "anonymous".to_string(),
            authextra: None,
            authprovider: None,
        }
    }
}

/// A peer attached to the router
pub struct Session {
    id: OnceLock<Id>,
    transport: Arc<dyn Transport>,
    server_id: String,
    meta: bool,
    realm: OnceLock<(String, Weak<Realm>)>,
    hello_details: OnceLock<Dict>,
    auth: OnceLock<AuthenticationDetails>,
    authenticated: AtomicBool,
    trusted: AtomicBool,
    pending_calls: AtomicU64,
    last_outbound: AtomicI64,
    goodbye_sent: AtomicBool,
    closed: AtomicBool,
}

impl Session {
    /// Session over `transport`, owned by worker `server_id`
    pub fn new(transport: Arc<dyn Transport>, server_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::build(transport, server_id.into(), false))
    }

    /// The router's own session used to publish meta events
    pub(crate) fn new_meta(transport: Arc<dyn Transport>, server_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::build(transport, server_id.into(), true))
    }

    fn build(transport: Arc<dyn Transport>, server_id: String, meta: bool) -> Self {
        Self {
            id: OnceLock::new(),
            transport,
            server_id,
            meta,
            realm: OnceLock::new(),
            hello_details: OnceLock::new(),
            auth: OnceLock::new(),
            authenticated: AtomicBool::new(false),
            trusted: AtomicBool::new(false),
            pending_calls: AtomicU64::new(0),
            last_outbound: AtomicI64::new(0),
            goodbye_sent: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Session id; 0 until assigned
    pub fn id(&self) -> Id {
        self.id.get().copied().unwrap_or_default()
    }

    /// Assign the session id. It can only be set once.
    pub fn set_id(&self, id: Id) -> Result<()> {
        self.id
            .set(id)
            .map_err(|_| RouterError::Invariant(format!("session {} already has an id", self.id())))
    }

    pub fn transport_id(&self) -> &str {
        self.transport.id()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Worker owning the connection
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn is_meta(&self) -> bool {
        self.meta
    }

    /// Attach the session to its realm. It can only be set once.
    pub fn set_realm(&self, realm: &Arc<Realm>) -> Result<()> {
        self.realm
            .set((realm.name().to_string(), Arc::downgrade(realm)))
            .map_err(|_| {
                RouterError::Invariant(format!(
                    "session {} is already attached to realm {}",
                    self.id(),
                    self.realm_name().unwrap_or_default()
                ))
            })
    }

    pub fn realm(&self) -> Option<Arc<Realm>> {
        self.realm.get().and_then(|(_, realm)| realm.upgrade())
    }

    pub fn realm_name(&self) -> Option<&str> {
        self.realm.get().map(|(name, _)| name.as_str())
    }

    /// Record the HELLO details. They can only be set once.
    pub fn set_hello_details(&self, details: Dict) -> Result<()> {
        self.hello_details.set(details).map_err(|_| {
            RouterError::Invariant(format!("session {} already said HELLO", self.id()))
        })
    }

    pub fn hello_details(&self) -> Option<&Dict> {
        self.hello_details.get()
    }

    /// Roles the peer advertised in HELLO
    pub fn roles(&self) -> Option<&Value> {
        self.hello_details.get().and_then(|details| details.get("roles"))
    }

    pub fn set_authentication_details(&self, details: AuthenticationDetails) -> Result<()> {
        self.auth.set(details).map_err(|_| {
            RouterError::Invariant(format!("session {} is already authenticated", self.id()))
        })
    }

    pub fn authentication_details(&self) -> Option<&AuthenticationDetails> {
        self.auth.get()
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub fn set_trusted(&self, trusted: bool) {
        self.trusted.store(trusted, Ordering::SeqCst);
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted.load(Ordering::SeqCst)
    }

    pub fn set_goodbye_sent(&self, sent: bool) {
        self.goodbye_sent.store(sent, Ordering::SeqCst);
    }

    pub fn goodbye_sent(&self) -> bool {
        self.goodbye_sent.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Calls issued by this session still waiting for their final answer
    pub fn pending_calls(&self) -> u64 {
        self.pending_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn begin_call(&self) {
        self.pending_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn end_call(&self) {
        let _ = self
            .pending_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Millisecond timestamp of the last outbound message
    pub fn last_outbound_activity(&self) -> i64 {
        self.last_outbound.load(Ordering::SeqCst)
    }

    /// Whether the peer declared `roles.callee.features.call_canceling`
    pub fn supports_call_canceling(&self) -> bool {
        self.roles()
            .and_then(|roles| roles.pointer("/callee/features/call_canceling"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Deliver a message; failures are logged, never surfaced
    pub async fn send(&self, message: Message) {
        self.last_outbound.store(now_millis(), Ordering::SeqCst);
        if ends_call(&message) {
            self.end_call();
        }
        let kind = message.kind();
        if let Err(e) = self.transport.send(message).await {
            tracing::warn!(
                session_id = self.id(),
                transport_id = %self.transport_id(),
                kind = ?kind,
                error = %e,
                "Failed to deliver message"
            );
        }
    }

    /// Reject the session before authentication completes
    pub async fn abort(&self, details: Dict, reason: impl Into<String>) -> Result<()> {
        if self.is_authenticated() {
            return Err(RouterError::Invariant(format!(
                "abort called on authenticated session {}",
                self.id()
            )));
        }
        self.send(Message::Abort {
            details,
            reason: reason.into(),
        })
        .await;
        Ok(())
    }

    /// Liveness probe through the transport
    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        self.transport.ping(timeout).await
    }

    /// Leave the realm and close the connection
    pub async fn shutdown(self: &Arc<Self>) {
        self.on_close().await;
        if let Err(e) = self.transport.close().await {
            tracing::warn!(session_id = self.id(), error = %e, "Failed to close transport");
        }
    }

    /// Realm-leave cleanup; runs at most once per session
    pub fn on_close(self: &Arc<Self>) -> BoxFuture<'static, ()> {
        let session = Arc::clone(self);
        async move {
            if session.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            let Some(realm) = session.realm() else {
                return;
            };
            if let Err(e) = realm.handle(&session, &RouterEvent::LeaveRealm).await {
                tracing::warn!(session_id = session.id(), error = %e, "Realm leave failed");
            }
        }
        .boxed()
    }

    /// Description published with session meta events
    pub fn meta_info(&self) -> Value {
        let auth = self
            .authentication_details()
            .cloned()
            .unwrap_or_else(AuthenticationDetails::anonymous);
        json!({
            "realm": self.realm_name(),
            "authprovider": auth.authprovider,
            "authid": auth.authid,
            "authrole": auth.authrole,
            "authroles": auth.authroles,
            "authmethod": auth.authmethod,
            "session": self.id(),
            "role_features": self.roles().cloned().unwrap_or_else(|| json!({})),
        })
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("transport_id", &self.transport_id())
            .field("server_id", &self.server_id)
            .field("realm", &self.realm_name())
            .finish()
    }
}

/// Final answers to a CALL
fn ends_call(message: &Message) -> bool {
    match message {
        Message::Result { details, .. } => !crate::message::flag(details, "progress"),
        Message::Error { request_type, .. } => *request_type == MessageKind::Call,
        _ => false,
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
