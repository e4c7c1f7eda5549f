//! Registrations: one callee serving one procedure

use super::procedure::InvokePolicy;
use crate::message::{Dict, Id, Message};
use crate::session::{now_millis, Session};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Shared-store image of a registration, stored under
/// `proc:<name>:regs` field `<transportId>:<registrationId>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRecord {
    pub id: Id,
    pub session_id: Id,
    pub transport_id: String,
    /// The REGISTER message that created the registration
    pub message: Value,
    #[serde(default)]
    pub realm: Option<String>,
    #[serde(default)]
    pub server_id: Option<String>,
}

/// Usage statistics, kept by the callee's worker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationStats {
    pub invocation_count: u64,
    pub busy_time_ms: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

impl RegistrationStats {
    /// Mean time from dispatch to final answer
    pub fn average_completion_ms(&self) -> f64 {
        if self.invocation_count == 0 {
            return 0.0;
        }
        self.busy_time_ms as f64 / self.invocation_count as f64
    }
}

/// A (session, procedure) binding owned by this worker
pub struct Registration {
    id: Id,
    procedure: String,
    session: Arc<Session>,
    policy: InvokePolicy,
    options: Dict,
    registered_at: DateTime<Utc>,
    stats: Mutex<RegistrationStats>,
}

impl Registration {
    pub fn new(
        id: Id,
        procedure: impl Into<String>,
        session: Arc<Session>,
        policy: InvokePolicy,
        options: Dict,
    ) -> Self {
        Self {
            id,
            procedure: procedure.into(),
            session,
            policy,
            options,
            registered_at: Utc::now(),
            stats: Mutex::new(RegistrationStats::default()),
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn policy(&self) -> InvokePolicy {
        self.policy
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    pub fn is_owned_by(&self, session: &Session) -> bool {
        self.session.id() == session.id() && self.session.transport_id() == session.transport_id()
    }

    /// Shared-store field name of this registration
    pub fn field(&self) -> String {
        crate::store::keys::registration_field(self.session.transport_id(), self.id)
    }

    pub fn to_record(&self) -> RegistrationRecord {
        RegistrationRecord {
            id: self.id,
            session_id: self.session.id(),
            transport_id: self.session.transport_id().to_string(),
            message: Message::Register {
                request: 0,
                options: self.options.clone(),
                procedure: self.procedure.clone(),
            }
            .to_value(),
            realm: self.session.realm_name().map(str::to_string),
            server_id: Some(self.session.server_id().to_string()),
        }
    }

    /// Account for an invocation that received its final answer
    pub async fn record_completion(&self, started_at: i64) {
        let elapsed = (now_millis() - started_at).max(0) as u64;
        let mut stats = self.stats.lock().await;
        stats.invocation_count += 1;
        stats.busy_time_ms += elapsed;
        stats.last_activity = Some(Utc::now());
    }

    pub async fn stats(&self) -> RegistrationStats {
        self.stats.lock().await.clone()
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("procedure", &self.procedure)
            .field("session", &self.session.id())
            .field("policy", &self.policy)
            .finish()
    }
}
