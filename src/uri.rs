//! WAMP URI validation and the well-known URIs the router emits

/// Router could not find the realm named in HELLO
pub const NO_SUCH_REALM: &str = "wamp.error.no_such_realm";
/// CALL to a procedure without any registration in the cluster
pub const NO_SUCH_PROCEDURE: &str = "wamp.error.no_such_procedure";
/// UNREGISTER of an unknown or foreign registration
pub const NO_SUCH_REGISTRATION: &str = "wamp.error.no_such_registration";
/// UNSUBSCRIBE of an unknown or foreign subscription
pub const NO_SUCH_SUBSCRIPTION: &str = "wamp.error.no_such_subscription";
/// REGISTER conflicts with an existing procedure
pub const PROCEDURE_ALREADY_EXISTS: &str = "wamp.error.procedure_already_exists";
/// Malformed procedure or topic URI
pub const INVALID_URI: &str = "wamp.error.invalid_uri";
/// Feature not supported by the peer
pub const NOT_SUPPORTED: &str = "wamp.error.not_supported";
/// Call canceled by its caller
pub const CANCELED: &str = "wamp.error.canceled";
/// Call cancelled because its registration went away
pub const CANCELLED: &str = "wamp.error.cancelled";
/// YIELD or ERROR for an invocation that was already answered
pub const INVOCATION_ALREADY_RECEIVED_YIELD: &str = "wamp.error.invocation_already_recieved_yield";
/// Fallback error
pub const UNKNOWN: &str = "wamp.error.unknown";
/// Message received in a state where it is not allowed
pub const PROTOCOL_VIOLATION: &str = "wamp.error.protocol_violation";

/// GOODBYE reason sent back to a departing peer
pub const GOODBYE_AND_OUT: &str = "wamp.close.goodbye_and_out";

/// Meta topic published when a session joins a realm
pub const SESSION_ON_JOIN: &str = "wamp.session.on_join";
/// Meta topic published when a session leaves a realm
pub const SESSION_ON_LEAVE: &str = "wamp.session.on_leave";

/// Check a URI against the WAMP URI component rules.
///
/// Loose components are any run of characters other than whitespace, `.`
/// and `#`; strict components are `[0-9a-z_]+`. With `allow_empty`, empty
/// components (and the empty URI) are accepted, as used by pattern-based
/// subscriptions and registrations.
pub fn is_valid_uri(uri: &str, allow_empty: bool, strict: bool) -> bool {
    if uri.is_empty() {
        return allow_empty;
    }

    uri.split('.').all(|component| {
        if component.is_empty() {
            return allow_empty;
        }
        if strict {
            component
                .chars()
                .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase() || c == '_')
        } else {
            !component.chars().any(|c| c.is_whitespace() || c == '#')
        }
    })
}
