//! In-flight calls and their shared correlation records

use crate::error::{Result, RouterError};
use crate::message::{flag, Dict, Id, Message};
use crate::session::{now_millis, Session};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Shared-store correlation of one dispatched call, stored under
/// `invoc:<callerId>:<calleeId>:<registrationId>:<requestId>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRecord {
    pub call_request_id: Id,
    pub call_session_id: Id,
    pub call_transport_id: String,
    pub callee_session_id: Id,
    pub callee_transport_id: String,
    pub invocation_id: Id,
    pub registration_id: Id,
    #[serde(default)]
    pub has_response: bool,
    #[serde(default)]
    pub has_sent_result: bool,
    #[serde(default)]
    pub receive_progress: bool,
    #[serde(default)]
    pub procedure: String,
    #[serde(default)]
    pub started_at: i64,
}

/// Where a call stands on the caller's worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Accepted, no callee reached yet
    Queued,
    /// INVOCATION sent to a callee
    Dispatched,
    /// Canceled before reaching a callee
    Canceled,
}

struct Binding {
    registration: Id,
    callee: Arc<Session>,
    invocation: Option<Message>,
}

/// One RPC in flight
pub struct Call {
    caller: Arc<Session>,
    request: Id,
    procedure: String,
    options: Dict,
    args: Vec<Value>,
    kwargs: Dict,
    invocation_id: Id,
    started_at: i64,
    binding: Mutex<Option<Binding>>,
    state: Mutex<CallState>,
}

impl Call {
    pub fn new(
        caller: Arc<Session>,
        request: Id,
        procedure: impl Into<String>,
        options: Dict,
        args: Vec<Value>,
        kwargs: Dict,
        invocation_id: Id,
    ) -> Self {
        Self {
            caller,
            request,
            procedure: procedure.into(),
            options,
            args,
            kwargs,
            invocation_id,
            started_at: now_millis(),
            binding: Mutex::new(None),
            state: Mutex::new(CallState::Queued),
        }
    }

    pub fn caller(&self) -> &Arc<Session> {
        &self.caller
    }

    /// Request id of the CALL
    pub fn request_id(&self) -> Id {
        self.request
    }

    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    pub fn invocation_id(&self) -> Id {
        self.invocation_id
    }

    pub fn started_at(&self) -> i64 {
        self.started_at
    }

    /// Whether the caller asked for progressive results
    pub fn wants_progress(&self) -> bool {
        flag(&self.options, "receive_progress")
    }

    /// Bind the call to a registration and its callee
    pub async fn bind(&self, registration: Id, callee: Arc<Session>) -> Result<()> {
        let mut binding = self.binding.lock().await;
        if let Some(existing) = binding.as_ref() {
            return Err(RouterError::Invariant(format!(
                "call {} is already bound to registration {}",
                self.invocation_id, existing.registration
            )));
        }
        *binding = Some(Binding {
            registration,
            callee,
            invocation: None,
        });
        Ok(())
    }

    /// Release the binding; the cached INVOCATION goes with it
    pub async fn unbind(&self) {
        *self.binding.lock().await = None;
    }

    pub async fn registration_id(&self) -> Option<Id> {
        self.binding.lock().await.as_ref().map(|b| b.registration)
    }

    pub async fn callee(&self) -> Option<Arc<Session>> {
        self.binding.lock().await.as_ref().map(|b| Arc::clone(&b.callee))
    }

    /// INVOCATION for the bound registration, built once and cached
    pub async fn invocation_message(&self, disclose_caller: bool) -> Result<Message> {
        let mut guard = self.binding.lock().await;
        let Some(binding) = guard.as_mut() else {
            return Err(RouterError::Invariant(format!(
                "call {} has no registration",
                self.invocation_id
            )));
        };
        if let Some(invocation) = &binding.invocation {
            return Ok(invocation.clone());
        }

        let invocation = Message::Invocation {
            request: self.invocation_id,
            registration: binding.registration,
            details: self.invocation_details(disclose_caller),
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
        };
        binding.invocation = Some(invocation.clone());
        Ok(invocation)
    }

    fn invocation_details(&self, disclose_caller: bool) -> Dict {
        let mut details = Dict::new();
        if disclose_caller || flag(&self.options, "disclose_me") {
            details.insert("caller".to_string(), json!(self.caller.id()));
            if let Some(auth) = self.caller.authentication_details() {
                details.insert("authid".to_string(), json!(auth.authid));
                details.insert("authrole".to_string(), json!(auth.authrole));
                details.insert("authroles".to_string(), json!(auth.authroles));
                details.insert("authmethod".to_string(), json!(auth.authmethod));
                if let Some(extra) = &auth.authextra {
                    details.insert("authextra".to_string(), extra.clone());
                }
            }
        }
        if self.wants_progress() {
            details.insert("receive_progress".to_string(), json!(true));
        }
        details
    }

    /// Correlation record for the current binding
    pub async fn record(&self) -> Result<InvocationRecord> {
        let guard = self.binding.lock().await;
        let Some(binding) = guard.as_ref() else {
            return Err(RouterError::Invariant(format!(
                "call {} has no registration",
                self.invocation_id
            )));
        };
        Ok(InvocationRecord {
            call_request_id: self.request,
            call_session_id: self.caller.id(),
            call_transport_id: self.caller.transport_id().to_string(),
            callee_session_id: binding.callee.id(),
            callee_transport_id: binding.callee.transport_id().to_string(),
            invocation_id: self.invocation_id,
            registration_id: binding.registration,
            has_response: false,
            has_sent_result: false,
            receive_progress: self.wants_progress(),
            procedure: self.procedure.clone(),
            started_at: self.started_at,
        })
    }

    pub async fn state(&self) -> CallState {
        *self.state.lock().await
    }

    /// Queued → Dispatched; false if the call was canceled meanwhile
    pub async fn mark_dispatched(&self) -> bool {
        let mut state = self.state.lock().await;
        match *state {
            CallState::Canceled => false,
            _ => {
                *state = CallState::Dispatched;
                true
            }
        }
    }

    /// Queued → Canceled; false once a callee has been reached
    pub async fn cancel(&self) -> bool {
        let mut state = self.state.lock().await;
        match *state {
            CallState::Queued => {
                *state = CallState::Canceled;
                true
            }
            CallState::Canceled => true,
            CallState::Dispatched => false,
        }
    }

    pub async fn is_canceled(&self) -> bool {
        self.state().await == CallState::Canceled
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("caller", &self.caller.id())
            .field("request", &self.request)
            .field("procedure", &self.procedure)
            .field("invocation_id", &self.invocation_id)
            .finish()
    }
}
