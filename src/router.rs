//! Per-realm dispatch of messages and events to roles
//!
//! Each [`Role`] declares the event kinds it handles; the [`Router`]
//! builds a kind → roles table once and walks it in registration order.
//! GOODBYE is answered by the router itself.

use crate::config::RouterConfig;
use crate::error::Result;
use crate::ids::IdGenerator;
use crate::message::{Dict, Message, MessageKind};
use crate::session::{Session, SessionStorage};
use crate::store::SharedStore;
use crate::uri;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Something delivered to a realm on behalf of a session
#[derive(Debug, Clone, PartialEq)]
pub enum RouterEvent {
    /// Inbound WAMP message
    Message(Message),
    /// The session is leaving its realm (GOODBYE or connection close)
    LeaveRealm,
}

impl RouterEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RouterEvent::Message(message) => EventKind::Message(message.kind()),
            RouterEvent::LeaveRealm => EventKind::LeaveRealm,
        }
    }
}

/// Dispatch key of a [`RouterEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message(MessageKind),
    LeaveRealm,
}

/// A router role (broker, dealer, ...)
#[async_trait]
pub trait Role: Send + Sync {
    /// Role name, used in logs
    fn name(&self) -> &'static str;

    /// Event kinds this role handles
    fn kinds(&self) -> &'static [EventKind];

    /// Handle one event
    async fn handle(&self, session: &Arc<Session>, event: &RouterEvent) -> Result<()>;
}

/// Collaborators shared by every role of a worker
#[derive(Clone)]
pub struct RouterContext {
    pub store: Arc<dyn SharedStore>,
    pub sessions: Arc<SessionStorage>,
    pub ids: IdGenerator,
    pub config: Arc<RouterConfig>,
}

/// Dispatches events to roles
pub struct Router {
    roles: Vec<Arc<dyn Role>>,
    table: HashMap<EventKind, Vec<usize>>,
}

impl Router {
    pub fn new(roles: Vec<Arc<dyn Role>>) -> Self {
        let mut table: HashMap<EventKind, Vec<usize>> = HashMap::new();
        for (index, role) in roles.iter().enumerate() {
            for kind in role.kinds() {
                table.entry(*kind).or_default().push(index);
            }
        }
        Self { roles, table }
    }

    /// Names of the registered roles, in dispatch order
    pub fn role_names(&self) -> Vec<&'static str> {
        self.roles.iter().map(|role| role.name()).collect()
    }

    /// Dispatch an event to every role handling its kind
    ///
    /// Every role runs even if an earlier one fails; the first failure is
    /// returned.
    pub async fn handle(&self, session: &Arc<Session>, event: &RouterEvent) -> Result<()> {
        if let RouterEvent::Message(Message::Goodbye { .. }) = event {
            self.on_goodbye(session).await;
        }

        let mut first_error = None;
        if let Some(indices) = self.table.get(&event.kind()) {
            for &index in indices {
                let role = &self.roles[index];
                if let Err(e) = role.handle(session, event).await {
                    tracing::warn!(
                        role = role.name(),
                        session_id = session.id(),
                        event = ?event.kind(),
                        error = %e,
                        "Role failed to handle event"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn on_goodbye(&self, session: &Arc<Session>) {
        session
            .send(Message::Goodbye {
                details: Dict::new(),
                reason: uri::GOODBYE_AND_OUT.to_string(),
            })
            .await;
        session.set_goodbye_sent(true);
        session.shutdown().await;
    }
}
