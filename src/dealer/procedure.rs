//! Procedures: routable RPC names and their invocation policies
//!
//! The `proc:<name>` descriptor and the `proc:<name>:regs` directory in the
//! shared store are authoritative. A [`Procedure`] only caches the
//! registrations owned by this worker; every routing decision is made
//! against the shared directory.

use super::call::Call;
use super::registration::{Registration, RegistrationRecord};
use crate::error::Result;
use crate::message::{flag, Dict, Id};
use crate::router::RouterContext;
use crate::session::Session;
use crate::store::{decode_record, keys};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::RwLock;

/// How a call picks among the registrations of a procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvokePolicy {
    #[default]
    Single,
    First,
    Last,
    Random,
    RoundRobin,
    /// Fewest outstanding invocations, ties to the earliest registration
    Thruway,
}

impl InvokePolicy {
    /// Parse an `invoke` option; unknown names fall back to `Single`
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "first" => InvokePolicy::First,
            "last" => InvokePolicy::Last,
            "random" => InvokePolicy::Random,
            "roundrobin" => InvokePolicy::RoundRobin,
            "_thruway" => InvokePolicy::Thruway,
            _ => InvokePolicy::Single,
        }
    }

    /// Policy requested by REGISTER options
    pub fn from_options(options: &Dict) -> Self {
        match options.get("invoke").and_then(Value::as_str) {
            Some(name) => Self::parse(name),
            None if flag(options, "thruway_multiregister") => InvokePolicy::Thruway,
            None => InvokePolicy::Single,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InvokePolicy::Single => "single",
            InvokePolicy::First => "first",
            InvokePolicy::Last => "last",
            InvokePolicy::Random => "random",
            InvokePolicy::RoundRobin => "roundrobin",
            InvokePolicy::Thruway => "_thruway",
        }
    }

    pub fn allows_multiple(self) -> bool {
        self != InvokePolicy::Single
    }
}

/// Shared-store image of a procedure, stored under `proc:<name>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcedureDescriptor {
    #[serde(default)]
    pub disclose_caller: bool,
    #[serde(default)]
    pub allow_multiple_registrations: bool,
    #[serde(default)]
    pub invoke_type: Option<String>,
    #[serde(default = "initial_call_index")]
    pub last_call_index: i64,
}

fn initial_call_index() -> i64 {
    -1
}

impl ProcedureDescriptor {
    pub fn new(policy: InvokePolicy, disclose_caller: bool) -> Self {
        Self {
            disclose_caller,
            allow_multiple_registrations: policy.allows_multiple(),
            invoke_type: Some(policy.as_str().to_string()),
            last_call_index: initial_call_index(),
        }
    }

    pub fn policy(&self) -> InvokePolicy {
        match self.invoke_type.as_deref() {
            Some(name) => InvokePolicy::parse(name),
            None if self.allow_multiple_registrations => InvokePolicy::Thruway,
            None => InvokePolicy::Single,
        }
    }

    /// Write a fresh descriptor, resetting the round-robin counter
    pub async fn save(&self, ctx: &RouterContext, name: &str) -> Result<()> {
        let fields = vec![
            ("discloseCaller".to_string(), json!(self.disclose_caller)),
            (
                "allowMultipleRegistrations".to_string(),
                json!(self.allow_multiple_registrations),
            ),
            ("invokeType".to_string(), json!(self.invoke_type)),
            (keys::LAST_CALL_INDEX.to_string(), json!(self.last_call_index)),
        ];
        ctx.store.hset_all(&keys::procedure(name), &fields).await
    }

    /// Read the descriptor; `None` when the procedure is unknown
    pub async fn load(ctx: &RouterContext, name: &str) -> Result<Option<Self>> {
        let fields = ctx.store.hgetall(&keys::procedure(name)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(decode_record(fields)?))
    }
}

/// One procedure of a realm
pub struct Procedure {
    name: String,
    realm: String,
    policy: InvokePolicy,
    disclose_caller: bool,
    ctx: RouterContext,
    registrations: RwLock<Vec<Arc<Registration>>>,
}

impl Procedure {
    pub fn new(
        ctx: RouterContext,
        realm: impl Into<String>,
        name: impl Into<String>,
        descriptor: &ProcedureDescriptor,
    ) -> Self {
        Self {
            name: name.into(),
            realm: realm.into(),
            policy: descriptor.policy(),
            disclose_caller: descriptor.disclose_caller,
            ctx,
            registrations: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> InvokePolicy {
        self.policy
    }

    pub fn disclose_caller(&self) -> bool {
        self.disclose_caller
    }

    /// Whether a REGISTER with these settings is compatible
    pub fn accepts(&self, policy: InvokePolicy, disclose_caller: bool) -> bool {
        self.policy == policy && self.disclose_caller == disclose_caller
    }

    /// Registrations owned by this worker
    pub async fn local_registrations(&self) -> Vec<Arc<Registration>> {
        self.registrations.read().await.clone()
    }

    pub async fn local_registration(&self, id: Id) -> Option<Arc<Registration>> {
        self.registrations
            .read()
            .await
            .iter()
            .find(|r| r.id() == id)
            .cloned()
    }

    pub async fn has_local_registrations(&self) -> bool {
        !self.registrations.read().await.is_empty()
    }

    pub async fn add_registration(&self, registration: Arc<Registration>) -> Result<()> {
        let record = serde_json::to_value(registration.to_record())?;
        self.ctx
            .store
            .hset(&keys::registrations(&self.name), &registration.field(), &record)
            .await?;
        self.registrations.write().await.push(registration);
        Ok(())
    }

    pub async fn remove_registration(&self, id: Id) -> Result<Option<Arc<Registration>>> {
        let removed = {
            let mut registrations = self.registrations.write().await;
            let index = registrations.iter().position(|r| r.id() == id);
            index.map(|index| registrations.remove(index))
        };
        if let Some(registration) = &removed {
            self.ctx
                .store
                .hdel(&keys::registrations(&self.name), &registration.field())
                .await?;
        }
        Ok(removed)
    }

    /// Remove every local registration owned by `session`
    pub async fn leave(&self, session: &Session) -> Result<Vec<Arc<Registration>>> {
        let removed: Vec<Arc<Registration>> = {
            let mut registrations = self.registrations.write().await;
            let (gone, kept) = registrations
                .drain(..)
                .partition(|r: &Arc<Registration>| r.is_owned_by(session));
            *registrations = kept;
            gone
        };
        for registration in &removed {
            self.ctx
                .store
                .hdel(&keys::registrations(&self.name), &registration.field())
                .await?;
        }
        Ok(removed)
    }

    /// Registrations of this realm from the shared directory, oldest first
    pub async fn live_registrations(&self) -> Result<Vec<RegistrationRecord>> {
        live_registrations(&self.ctx, &self.name, &self.realm).await
    }

    /// Pick a registration for a call and resolve its callee
    ///
    /// Registrations whose session no longer resolves anywhere are pruned
    /// from the shared directory and selection starts over.
    pub async fn select(&self) -> Result<Option<(RegistrationRecord, Arc<Session>)>> {
        loop {
            let records = self.live_registrations().await?;
            if records.is_empty() {
                return Ok(None);
            }
            let index = self.pick(&records).await?;
            let record = records[index].clone();
            match self.ctx.sessions.resolve(&record.transport_id).await? {
                Some(callee) => return Ok(Some((record, callee))),
                None => {
                    tracing::warn!(
                        procedure = %self.name,
                        registration_id = record.id,
                        transport_id = %record.transport_id,
                        "Pruning orphaned registration"
                    );
                    self.ctx
                        .store
                        .hdel(
                            &keys::registrations(&self.name),
                            &keys::registration_field(&record.transport_id, record.id),
                        )
                        .await?;
                }
            }
        }
    }

    async fn pick(&self, records: &[RegistrationRecord]) -> Result<usize> {
        let n = records.len();
        let index = match self.policy {
            InvokePolicy::Single | InvokePolicy::First => 0,
            InvokePolicy::Last => n - 1,
            InvokePolicy::Random => rand::thread_rng().gen_range(0..n),
            InvokePolicy::RoundRobin => self.next_round_robin(n).await?,
            InvokePolicy::Thruway => self.least_busy(records).await?,
        };
        Ok(index)
    }

    /// Shared rotation counter; an index at or past `n` wraps and the
    /// counter is reset with compare-and-set so a concurrent increment
    /// is never lost
    async fn next_round_robin(&self, n: usize) -> Result<usize> {
        let key = keys::procedure(&self.name);
        let current = self.ctx.store.hincr(&key, keys::LAST_CALL_INDEX, 1).await?;
        let count = n as i64;
        if (0..count).contains(&current) {
            return Ok(current as usize);
        }
        let wrapped = current.rem_euclid(count);
        let reset = self
            .ctx
            .store
            .hcompare_and_set(&key, keys::LAST_CALL_INDEX, &json!(current), &json!(wrapped))
            .await?;
        if !reset {
            tracing::debug!(procedure = %self.name, index = current, "Round-robin counter moved on");
        }
        Ok(wrapped as usize)
    }

    async fn least_busy(&self, records: &[RegistrationRecord]) -> Result<usize> {
        let mut best = (0, usize::MAX);
        for (index, record) in records.iter().enumerate() {
            let pattern = keys::invocation(keys::WILDCARD, keys::WILDCARD, record.id, keys::WILDCARD);
            let outstanding = self.ctx.store.keys(&pattern).await?.len();
            if outstanding < best.1 {
                best = (index, outstanding);
            }
        }
        Ok(best.0)
    }

    /// Route a call to a registration and send the INVOCATION
    ///
    /// Returns `false` when no registration is left to serve it.
    pub async fn process_call(&self, call: &Arc<Call>) -> Result<bool> {
        let Some((record, callee)) = self.select().await? else {
            return Ok(false);
        };

        call.bind(record.id, Arc::clone(&callee)).await?;
        let invocation = call.invocation_message(self.disclose_caller).await?;
        let key = keys::invocation(
            call.caller().id(),
            callee.id(),
            record.id,
            call.invocation_id(),
        );
        let fields = crate::store::encode_record(&call.record().await?)?;
        self.ctx.store.hset_all(&key, &fields).await?;

        if !call.mark_dispatched().await {
            self.ctx.store.delete(&key).await?;
            tracing::debug!(procedure = %self.name, request = call.request_id(), "Call canceled before dispatch");
            return Ok(true);
        }

        tracing::debug!(
            procedure = %self.name,
            registration_id = record.id,
            invocation_id = call.invocation_id(),
            callee = callee.id(),
            "Invocation dispatched"
        );
        callee.send(invocation).await;
        Ok(true)
    }
}

/// Registrations of `name` visible in `realm`, oldest first
pub async fn live_registrations(
    ctx: &RouterContext,
    name: &str,
    realm: &str,
) -> Result<Vec<RegistrationRecord>> {
    let mut records = Vec::new();
    for (field, value) in ctx.store.hgetall(&keys::registrations(name)).await? {
        match serde_json::from_value::<RegistrationRecord>(value) {
            Ok(record) if record.realm.as_deref().map_or(true, |r| r == realm) => {
                records.push(record)
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(procedure = %name, field = %field, error = %e, "Unreadable registration record")
            }
        }
    }
    records.sort_by_key(|record| record.id);
    Ok(records)
}

impl std::fmt::Debug for Procedure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Procedure")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("disclose_caller", &self.disclose_caller)
            .finish()
    }
}
