//! Shared-store key namespace
//!
//! These names are a stable contract between workers; every key the
//! router reads or writes is built here.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::fmt::Display;

/// Hash of id counters (`global` and one field per worker)
pub const ID_COUNTERS: &str = "wamp:id";
/// Field of [`ID_COUNTERS`] backing the cluster-wide id sequence
pub const GLOBAL_ID_FIELD: &str = "global";
/// Set of realm names
pub const REALMS: &str = "realms";
/// Channel announcing newly added realms
pub const REALMS_ADDED: &str = "realms:added";
/// Hash of session-id counters, one field per day prefix
pub const SESSION_ID_SEQUENCE: &str = "sesid:current";
/// Glob over every subscription group
pub const SUBSCRIPTION_GROUPS: &str = "sub:*";
/// Glob segment matching any id
pub const WILDCARD: &str = "*";

/// Procedure descriptor field holding the round-robin counter
pub const LAST_CALL_INDEX: &str = "lastCallIndex";

const SUBSCRIPTION_PREFIX: &str = "sub:";

/// `proc:<name>`
pub fn procedure(name: &str) -> String {
    format!("proc:{}", name)
}

/// `proc:<name>:regs`
pub fn registrations(name: &str) -> String {
    format!("proc:{}:regs", name)
}

/// `proc:<name>:lock`
pub fn procedure_lock(name: &str) -> String {
    format!("proc:{}:lock", name)
}

/// Field of a registrations hash: `<transportId>:<registrationId>`
pub fn registration_field(transport_id: &str, registration_id: u64) -> String {
    format!("{}:{}", transport_id, registration_id)
}

/// `sub:<uri>`
pub fn subscriptions(uri: &str) -> String {
    format!("{}{}", SUBSCRIPTION_PREFIX, uri)
}

/// Topic URI of a `sub:<uri>` key
pub fn topic_of(key: &str) -> Option<&str> {
    key.strip_prefix(SUBSCRIPTION_PREFIX)
}

/// `invoc:<callerId>:<calleeId>:<registrationId>:<requestId>`
///
/// Any part may be [`WILDCARD`] to build a search pattern.
pub fn invocation(
    caller: impl Display,
    callee: impl Display,
    registration: impl Display,
    request: impl Display,
) -> String {
    format!("invoc:{}:{}:{}:{}", caller, callee, registration, request)
}

/// `ses:<sessionId>:<base64(transportId)>`
pub fn session(session_id: impl Display, transport_id: &str) -> String {
    format!("ses:{}:{}", session_id, STANDARD.encode(transport_id))
}

/// Pattern resolving a session record from its transport id alone
pub fn session_by_transport(transport_id: &str) -> String {
    session(WILDCARD, transport_id)
}

/// Channel carrying frames for connections owned by a worker
pub fn relay(server_id: &str) -> String {
    format!("relay:{}", server_id)
}
