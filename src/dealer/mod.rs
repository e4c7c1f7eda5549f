//! Dealer role: REGISTER / UNREGISTER / CALL / CANCEL / YIELD / ERROR
//!
//! Procedure descriptors, registration directories and call correlation
//! records live in the shared store, so a YIELD can be answered by
//! whichever worker owns the callee's connection while the caller sits
//! on another one. Local maps only track what this worker owns.

mod call;
mod procedure;
mod registration;

pub use call::{Call, CallState, InvocationRecord};
pub use procedure::{live_registrations, InvokePolicy, Procedure, ProcedureDescriptor};
pub use registration::{Registration, RegistrationRecord, RegistrationStats};

use crate::error::{Result, RouterError};
use crate::message::{flag, Dict, Id, Message, MessageKind};
use crate::router::{EventKind, Role, RouterContext, RouterEvent};
use crate::session::Session;
use crate::store::{decode_record, keys};
use crate::uri;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Rounds of lock, check and ping before a REGISTER on a contested
/// single-policy procedure gives up
const REGISTER_ATTEMPTS: usize = 3;

/// Outcome of one locked registration attempt
enum Attempt {
    Registered,
    Mismatch(String),
    Held(RegistrationRecord, Arc<Session>),
}

/// Answer a request with `wamp.error.unknown` and hand the failure back
async fn reply_unknown(
    session: &Session,
    request_type: MessageKind,
    request: Id,
    err: RouterError,
) -> Result<()> {
    session
        .send(Message::error(request_type, request, uri::UNKNOWN))
        .await;
    Err(err)
}

/// RPC role of one realm
pub struct Dealer {
    ctx: RouterContext,
    realm: String,
    procedures: RwLock<HashMap<String, Arc<Procedure>>>,
    queued: RwLock<HashMap<(Id, Id), Arc<Call>>>,
}

impl Dealer {
    pub fn new(ctx: RouterContext, realm: impl Into<String>) -> Self {
        Self {
            ctx,
            realm: realm.into(),
            procedures: RwLock::new(HashMap::new()),
            queued: RwLock::new(HashMap::new()),
        }
    }

    /// Procedures with a registration owned by this worker
    pub async fn procedure_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.procedures.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn procedure(&self, name: &str) -> Option<Arc<Procedure>> {
        self.procedures.read().await.get(name).cloned()
    }

    /// Local registration by id
    pub async fn registration(&self, id: Id) -> Option<Arc<Registration>> {
        let procedures = self.procedures.read().await;
        for procedure in procedures.values() {
            if let Some(registration) = procedure.local_registration(id).await {
                return Some(registration);
            }
        }
        None
    }

    // ─── CALL ──────────────────────────────────────────────────────

    async fn on_call(
        &self,
        session: &Arc<Session>,
        request: Id,
        options: &Dict,
        name: &str,
        args: &[Value],
        kwargs: &Dict,
    ) -> Result<()> {
        session.begin_call();
        if !uri::is_valid_uri(name, false, false) {
            session
                .send(Message::error(MessageKind::Call, request, uri::INVALID_URI))
                .await;
            return Ok(());
        }

        let procedure = match self.lookup(name).await {
            Ok(Some(procedure)) => procedure,
            Ok(None) => {
                session
                    .send(Message::error(MessageKind::Call, request, uri::NO_SUCH_PROCEDURE))
                    .await;
                return Ok(());
            }
            Err(e) => return reply_unknown(session, MessageKind::Call, request, e).await,
        };

        let invocation_id = match self.ctx.ids.global().await {
            Ok(id) => id,
            Err(e) => return reply_unknown(session, MessageKind::Call, request, e).await,
        };
        let call = Arc::new(Call::new(
            Arc::clone(session),
            request,
            name,
            options.clone(),
            args.to_vec(),
            kwargs.clone(),
            invocation_id,
        ));
        let queue_key = (session.id(), request);
        self.queued.write().await.insert(queue_key, Arc::clone(&call));
        let result = procedure.process_call(&call).await;
        self.queued.write().await.remove(&queue_key);

        match result {
            Ok(true) => Ok(()),
            Ok(false) => {
                if !call.is_canceled().await {
                    session
                        .send(Message::error(MessageKind::Call, request, uri::NO_SUCH_PROCEDURE))
                        .await;
                }
                Ok(())
            }
            Err(e) => reply_unknown(session, MessageKind::Call, request, e).await,
        }
    }

    /// Local procedure, or one rehydrated from its shared descriptor
    async fn lookup(&self, name: &str) -> Result<Option<Arc<Procedure>>> {
        if let Some(procedure) = self.procedure(name).await {
            return Ok(Some(procedure));
        }
        let Some(descriptor) = ProcedureDescriptor::load(&self.ctx, name).await? else {
            return Ok(None);
        };
        Ok(Some(Arc::new(Procedure::new(
            self.ctx.clone(),
            self.realm.clone(),
            name,
            &descriptor,
        ))))
    }

    // ─── REGISTER / UNREGISTER ─────────────────────────────────────

    async fn on_register(
        &self,
        session: &Arc<Session>,
        request: Id,
        options: &Dict,
        name: &str,
    ) -> Result<()> {
        if !uri::is_valid_uri(name, false, false) {
            session
                .send(Message::error(MessageKind::Register, request, uri::INVALID_URI))
                .await;
            return Ok(());
        }

        let policy = InvokePolicy::from_options(options);
        let disclose_caller = flag(options, "disclose_caller");
        let registration_id = match self.ctx.ids.global().await {
            Ok(id) => id,
            Err(e) => return reply_unknown(session, MessageKind::Register, request, e).await,
        };
        let registration = Arc::new(Registration::new(
            registration_id,
            name,
            Arc::clone(session),
            policy,
            options.clone(),
        ));

        for _ in 0..REGISTER_ATTEMPTS {
            let attempt = self
                .with_procedure_lock(
                    name,
                    self.try_register(name, policy, disclose_caller, &registration),
                )
                .await;
            let attempt = match attempt {
                Ok(Some(Ok(attempt))) => attempt,
                Ok(None) => {
                    session
                        .send(
                            Message::error(MessageKind::Register, request, uri::UNKNOWN)
                                .with_error_args(vec![json!("procedure is locked, try again")]),
                        )
                        .await;
                    return Ok(());
                }
                Ok(Some(Err(e))) | Err(e) => {
                    return reply_unknown(session, MessageKind::Register, request, e).await
                }
            };

            match attempt {
                Attempt::Registered => {
                    tracing::info!(
                        procedure = %name,
                        registration_id,
                        session_id = session.id(),
                        policy = policy.as_str(),
                        "Registration created"
                    );
                    session
                        .send(Message::Registered {
                            request,
                            registration: registration_id,
                        })
                        .await;
                    return Ok(());
                }
                Attempt::Mismatch(reason) => {
                    session
                        .send(
                            Message::error(
                                MessageKind::Register,
                                request,
                                uri::PROCEDURE_ALREADY_EXISTS,
                            )
                            .with_error_args(vec![json!(reason)]),
                        )
                        .await;
                    return Ok(());
                }
                Attempt::Held(record, holder) => {
                    match self.replace_if_dead(name, &record, &holder).await {
                        Ok(true) => continue,
                        Ok(false) => break,
                        Err(e) => {
                            return reply_unknown(session, MessageKind::Register, request, e).await
                        }
                    }
                }
            }
        }

        session
            .send(Message::error(
                MessageKind::Register,
                request,
                uri::PROCEDURE_ALREADY_EXISTS,
            ))
            .await;
        Ok(())
    }

    /// The locked part of REGISTER: settle the descriptor, check the
    /// requested settings and the current single-policy holder, then
    /// write the registration
    async fn try_register(
        &self,
        name: &str,
        policy: InvokePolicy,
        disclose_caller: bool,
        registration: &Arc<Registration>,
    ) -> Result<Attempt> {
        let descriptor = self.load_or_create(name, policy, disclose_caller).await?;
        let procedure = self.local_procedure(name, &descriptor).await;
        if !procedure.accepts(policy, disclose_caller) {
            return Ok(Attempt::Mismatch(format!(
                "procedure {} is registered with invoke={} disclose_caller={}",
                name,
                procedure.policy().as_str(),
                procedure.disclose_caller()
            )));
        }

        if !policy.allows_multiple() {
            let regs_key = keys::registrations(name);
            for record in procedure.live_registrations().await? {
                match self.ctx.sessions.resolve(&record.transport_id).await? {
                    Some(holder) => return Ok(Attempt::Held(record, holder)),
                    None => {
                        let field = keys::registration_field(&record.transport_id, record.id);
                        self.ctx.store.hdel(&regs_key, &field).await?;
                    }
                }
            }
        }

        procedure.add_registration(Arc::clone(registration)).await?;
        Ok(Attempt::Registered)
    }

    /// Run `work` while holding `proc:<name>:lock`
    ///
    /// `Ok(None)` means the lock could not be taken in time.
    async fn with_procedure_lock<T, F>(&self, name: &str, work: F) -> Result<Option<T>>
    where
        F: std::future::Future<Output = T>,
    {
        let key = keys::procedure_lock(name);
        let token = self.ctx.ids.router_scoped().await?;
        let config = &self.ctx.config;
        let locked = self
            .ctx
            .store
            .lock(&key, &token, config.lock_ttl(), config.lock_wait())
            .await?;
        if !locked {
            let err = RouterError::LockTimeout {
                key,
                waited_ms: config.lock_wait().as_millis() as u64,
            };
            tracing::warn!(procedure = %name, error = %err, "Procedure lock unavailable");
            return Ok(None);
        }

        let output = work.await;
        if let Err(e) = self.ctx.store.unlock(&key, &token).await {
            tracing::warn!(procedure = %name, error = %e, "Failed to release procedure lock");
        }
        Ok(Some(output))
    }

    /// Existing descriptor if the procedure has registrations anywhere,
    /// otherwise a fresh one derived from this registration
    async fn load_or_create(
        &self,
        name: &str,
        policy: InvokePolicy,
        disclose_caller: bool,
    ) -> Result<ProcedureDescriptor> {
        let existing = ProcedureDescriptor::load(&self.ctx, name).await?;
        let registered = self.ctx.store.hlen(&keys::registrations(name)).await?;
        match existing {
            Some(descriptor) if registered > 0 => Ok(descriptor),
            _ => {
                let descriptor = ProcedureDescriptor::new(policy, disclose_caller);
                descriptor.save(&self.ctx, name).await?;
                tracing::info!(
                    procedure = %name,
                    policy = policy.as_str(),
                    disclose_caller,
                    "Procedure created"
                );
                Ok(descriptor)
            }
        }
    }

    async fn local_procedure(&self, name: &str, descriptor: &ProcedureDescriptor) -> Arc<Procedure> {
        let mut procedures = self.procedures.write().await;
        if let Some(existing) = procedures.get(name) {
            if existing.has_local_registrations().await {
                return Arc::clone(existing);
            }
        }
        let procedure = Arc::new(Procedure::new(
            self.ctx.clone(),
            self.realm.clone(),
            name,
            descriptor,
        ));
        procedures.insert(name.to_string(), Arc::clone(&procedure));
        procedure
    }

    /// Ping the holder of a single-policy procedure; one that does not
    /// answer is shut down and its registration dropped. Runs outside the
    /// procedure lock since the holder's realm leave takes it.
    async fn replace_if_dead(
        &self,
        name: &str,
        record: &RegistrationRecord,
        holder: &Arc<Session>,
    ) -> Result<bool> {
        match holder.ping(self.ctx.config.ping_timeout()).await {
            Ok(()) => Ok(false),
            Err(RouterError::Timeout(reason)) => {
                tracing::warn!(
                    procedure = %name,
                    registration_id = record.id,
                    session_id = holder.id(),
                    reason = %reason,
                    "Replacing registration of unresponsive session"
                );
                holder.shutdown().await;
                let field = keys::registration_field(&record.transport_id, record.id);
                self.ctx
                    .store
                    .hdel(&keys::registrations(name), &field)
                    .await?;
                if let Some(procedure) = self.procedure(name).await {
                    procedure.remove_registration(record.id).await?;
                }
                cancel_registration_calls(&self.ctx, record.id).await?;
                Ok(true)
            }
            Err(e) => {
                tracing::debug!(
                    procedure = %name,
                    session_id = holder.id(),
                    error = %e,
                    "Registration holder could not be probed"
                );
                Ok(false)
            }
        }
    }

    async fn on_unregister(&self, session: &Arc<Session>, request: Id, id: Id) -> Result<()> {
        let owner = {
            let procedures = self.procedures.read().await;
            let mut owner = None;
            for procedure in procedures.values() {
                if let Some(registration) = procedure.local_registration(id).await {
                    if registration.is_owned_by(session) {
                        owner = Some(Arc::clone(procedure));
                        break;
                    }
                }
            }
            owner
        };

        let Some(procedure) = owner else {
            session
                .send(Message::error(
                    MessageKind::Unregister,
                    request,
                    uri::NO_SUCH_REGISTRATION,
                ))
                .await;
            return Ok(());
        };

        procedure.remove_registration(id).await?;
        self.spawn_cancel(id);
        tracing::info!(procedure = %procedure.name(), registration_id = id, "Registration removed");

        session.send(Message::Unregistered { request }).await;
        self.retire_if_unused(procedure.name()).await
    }

    fn spawn_cancel(&self, registration: Id) {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = cancel_registration_calls(&ctx, registration).await {
                tracing::warn!(registration_id = registration, error = %e, "Failed to cancel outstanding calls");
            }
        });
    }

    /// Forget a procedure without local registrations and drop its
    /// descriptor once no worker has one
    async fn retire_if_unused(&self, name: &str) -> Result<()> {
        {
            let mut procedures = self.procedures.write().await;
            if let Some(procedure) = procedures.get(name) {
                if procedure.has_local_registrations().await {
                    return Ok(());
                }
            }
            procedures.remove(name);
        }

        let retired = self
            .with_procedure_lock(name, async {
                if self.ctx.store.hlen(&keys::registrations(name)).await? == 0 {
                    self.ctx.store.delete(&keys::procedure(name)).await?;
                    return Ok(true);
                }
                Ok::<bool, RouterError>(false)
            })
            .await?;
        if let Some(retired) = retired {
            if retired? {
                tracing::info!(procedure = %name, "Procedure retired");
            }
        }
        Ok(())
    }

    // ─── YIELD / ERROR ─────────────────────────────────────────────

    async fn on_yield(
        &self,
        session: &Arc<Session>,
        request: Id,
        options: &Dict,
        args: &[Value],
        kwargs: &Dict,
    ) -> Result<()> {
        let Some((key, record)) = self.find_invocation(session, request).await? else {
            session
                .send(Message::error(MessageKind::Yield, request, uri::UNKNOWN))
                .await;
            return Ok(());
        };
        if record.has_response {
            session
                .send(Message::error(
                    MessageKind::Yield,
                    request,
                    uri::INVOCATION_ALREADY_RECEIVED_YIELD,
                ))
                .await;
            return Ok(());
        }

        let caller = self.ctx.sessions.resolve(&record.call_transport_id).await?;
        if flag(options, "progress") {
            if !record.receive_progress {
                tracing::debug!(
                    invocation_id = request,
                    "Progressive result dropped, caller did not ask for progress"
                );
                return Ok(());
            }
            let mut details = Dict::new();
            details.insert("progress".to_string(), json!(true));
            if let Some(caller) = caller {
                caller
                    .send(Message::Result {
                        request: record.call_request_id,
                        details,
                        args: args.to_vec(),
                        kwargs: kwargs.clone(),
                    })
                    .await;
            }
            return Ok(());
        }

        if !self.mark_answered(&key).await? {
            session
                .send(Message::error(
                    MessageKind::Yield,
                    request,
                    uri::INVOCATION_ALREADY_RECEIVED_YIELD,
                ))
                .await;
            return Ok(());
        }

        match caller {
            Some(caller) => {
                caller
                    .send(Message::Result {
                        request: record.call_request_id,
                        details: Dict::new(),
                        args: args.to_vec(),
                        kwargs: kwargs.clone(),
                    })
                    .await;
                self.ctx
                    .store
                    .hset(&key, "hasSentResult", &json!(true))
                    .await?;
            }
            None => tracing::debug!(
                transport_id = %record.call_transport_id,
                "Caller gone before result"
            ),
        }
        self.ctx.store.delete(&key).await?;
        self.record_completion(&record).await;
        Ok(())
    }

    async fn on_callee_error(&self, session: &Arc<Session>, error: &Message) -> Result<()> {
        let Message::Error {
            request,
            details,
            error: uri_text,
            args,
            kwargs,
            ..
        } = error
        else {
            return Ok(());
        };

        let found = self.find_invocation(session, *request).await?;
        let answerable = match &found {
            Some((key, record)) if !record.has_response && !record.has_sent_result => {
                self.mark_answered(key).await?
            }
            _ => false,
        };
        let Some((key, record)) = found.filter(|_| answerable) else {
            session.send(error.error_reply(uri::NO_SUCH_PROCEDURE)).await;
            return Ok(());
        };

        self.ctx.store.delete(&key).await?;
        if let Some(caller) = self.ctx.sessions.resolve(&record.call_transport_id).await? {
            caller
                .send(Message::Error {
                    request_type: MessageKind::Call,
                    request: record.call_request_id,
                    details: details.clone(),
                    error: uri_text.clone(),
                    args: args.clone(),
                    kwargs: kwargs.clone(),
                })
                .await;
        }
        self.record_completion(&record).await;
        Ok(())
    }

    /// Correlation record of the invocation `request` sent to `callee`
    async fn find_invocation(
        &self,
        callee: &Session,
        request: Id,
    ) -> Result<Option<(String, InvocationRecord)>> {
        let pattern = keys::invocation(keys::WILDCARD, callee.id(), keys::WILDCARD, request);
        for (key, fields) in self.ctx.store.find(&pattern).await? {
            let record: InvocationRecord = decode_record(fields)?;
            if record.callee_session_id == callee.id() && record.invocation_id == request {
                return Ok(Some((key, record)));
            }
        }
        Ok(None)
    }

    /// Flip `hasResponse` false → true; false if another answer won
    async fn mark_answered(&self, key: &str) -> Result<bool> {
        self.ctx
            .store
            .hcompare_and_set(key, "hasResponse", &json!(false), &json!(true))
            .await
    }

    async fn record_completion(&self, record: &InvocationRecord) {
        if let Some(registration) = self.registration(record.registration_id).await {
            registration.record_completion(record.started_at).await;
        }
    }

    // ─── CANCEL ────────────────────────────────────────────────────

    async fn on_cancel(&self, session: &Arc<Session>, request: Id, options: &Dict) -> Result<()> {
        let mode = options
            .get("mode")
            .and_then(Value::as_str)
            .unwrap_or("kill")
            .to_string();

        let queued = self.queued.read().await.get(&(session.id(), request)).cloned();
        if let Some(call) = queued {
            if call.cancel().await {
                let mut details = Dict::new();
                details.insert("_thruway_removed_from_queue".to_string(), json!(true));
                session
                    .send(Message::Error {
                        request_type: MessageKind::Call,
                        request,
                        details,
                        error: uri::CANCELED.to_string(),
                        args: Vec::new(),
                        kwargs: Dict::new(),
                    })
                    .await;
                return Ok(());
            }
        }

        let pattern = keys::invocation(session.id(), keys::WILDCARD, keys::WILDCARD, keys::WILDCARD);
        let mut found = None;
        for (key, fields) in self.ctx.store.find(&pattern).await? {
            let record: InvocationRecord = decode_record(fields)?;
            if record.call_session_id == session.id()
                && record.call_request_id == request
                && !record.has_response
            {
                found = Some((key, record));
                break;
            }
        }
        let Some((key, record)) = found else {
            tracing::debug!(session_id = session.id(), request, "Nothing to cancel");
            return Ok(());
        };

        let callee = self.ctx.sessions.resolve(&record.callee_transport_id).await?;
        let callee = match callee {
            Some(callee) if mode != "skip" => callee,
            _ => {
                self.ctx.store.delete(&key).await?;
                session
                    .send(Message::error(MessageKind::Call, request, uri::CANCELED))
                    .await;
                return Ok(());
            }
        };

        if !callee.supports_call_canceling() {
            session
                .send(Message::error(MessageKind::Cancel, request, uri::NOT_SUPPORTED))
                .await;
            return Ok(());
        }

        let mut interrupt_options = Dict::new();
        interrupt_options.insert("mode".to_string(), json!(mode));
        callee
            .send(Message::Interrupt {
                request: record.invocation_id,
                options: interrupt_options,
            })
            .await;

        if mode == "killnowait" {
            self.ctx.store.delete(&key).await?;
            session
                .send(Message::error(MessageKind::Call, request, uri::CANCELED))
                .await;
        }
        Ok(())
    }

    // ─── Realm leave ───────────────────────────────────────────────

    async fn on_leave(&self, session: &Arc<Session>) -> Result<()> {
        let procedures: Vec<Arc<Procedure>> =
            self.procedures.read().await.values().cloned().collect();
        for procedure in procedures {
            let removed = procedure.leave(session).await?;
            if removed.is_empty() {
                continue;
            }
            for registration in &removed {
                tracing::info!(
                    procedure = %procedure.name(),
                    registration_id = registration.id(),
                    "Registration removed"
                );
                self.spawn_cancel(registration.id());
            }
            self.retire_if_unused(procedure.name()).await?;
        }

        let pattern = keys::invocation(session.id(), keys::WILDCARD, keys::WILDCARD, keys::WILDCARD);
        for (key, fields) in self.ctx.store.find(&pattern).await? {
            let record: InvocationRecord = decode_record(fields)?;
            if record.call_session_id != session.id() {
                continue;
            }
            self.ctx.store.delete(&key).await?;
            if record.has_response {
                continue;
            }
            if let Some(callee) = self.ctx.sessions.resolve(&record.callee_transport_id).await? {
                if callee.supports_call_canceling() {
                    let mut options = Dict::new();
                    options.insert("mode".to_string(), json!("killnowait"));
                    callee
                        .send(Message::Interrupt {
                            request: record.invocation_id,
                            options,
                        })
                        .await;
                }
            }
        }

        let queued = self.queued.read().await;
        for ((caller, _), call) in queued.iter() {
            if *caller == session.id() {
                call.cancel().await;
            }
        }
        Ok(())
    }
}

/// Delete the correlation records of every call still outstanding on a
/// registration and tell each caller its call was cancelled
pub async fn cancel_registration_calls(ctx: &RouterContext, registration: Id) -> Result<()> {
    let pattern = keys::invocation(keys::WILDCARD, keys::WILDCARD, registration, keys::WILDCARD);
    for (key, fields) in ctx.store.find(&pattern).await? {
        let record: InvocationRecord = decode_record(fields)?;
        if record.registration_id != registration {
            continue;
        }
        ctx.store.delete(&key).await?;
        if record.has_response {
            continue;
        }
        if let Some(caller) = ctx.sessions.resolve(&record.call_transport_id).await? {
            caller
                .send(Message::error(
                    MessageKind::Call,
                    record.call_request_id,
                    uri::CANCELLED,
                ))
                .await;
        }
    }
    Ok(())
}

const DEALER_EVENTS: &[EventKind] = &[
    EventKind::Message(MessageKind::Call),
    EventKind::Message(MessageKind::Cancel),
    EventKind::Message(MessageKind::Register),
    EventKind::Message(MessageKind::Unregister),
    EventKind::Message(MessageKind::Yield),
    EventKind::Message(MessageKind::Error),
    EventKind::LeaveRealm,
];

#[async_trait]
impl Role for Dealer {
    fn name(&self) -> &'static str {
        "dealer"
    }

    fn kinds(&self) -> &'static [EventKind] {
        DEALER_EVENTS
    }

    async fn handle(&self, session: &Arc<Session>, event: &RouterEvent) -> Result<()> {
        let RouterEvent::Message(message) = event else {
            return self.on_leave(session).await;
        };
        match message {
            Message::Call {
                request,
                options,
                procedure,
                args,
                kwargs,
            } => {
                self.on_call(session, *request, options, procedure, args, kwargs)
                    .await
            }
            Message::Cancel { request, options } => self.on_cancel(session, *request, options).await,
            Message::Register {
                request,
                options,
                procedure,
            } => self.on_register(session, *request, options, procedure).await,
            Message::Unregister {
                request,
                registration,
            } => self.on_unregister(session, *request, *registration).await,
            Message::Yield {
                request,
                options,
                args,
                kwargs,
            } => self.on_yield(session, *request, options, args, kwargs).await,
            Message::Error {
                request_type: MessageKind::Invocation,
                ..
            } => self.on_callee_error(session, message).await,
            _ => Ok(()),
        }
    }
}
