//! WAMP message model
//!
//! Every message kind the router consumes or produces is one variant of
//! [`Message`]. Messages travel as the standard WAMP array layout
//! (`[code, ...]`); trailing empty positional/keyword arguments are
//! omitted on encode and optional on decode.

use crate::error::{Result, RouterError};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Numeric WAMP identifier (session, request, registration, ...)
pub type Id = u64;

/// Options / details dictionary
pub type Dict = serde_json::Map<String, Value>;

/// Message kind with its WAMP message code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Hello,
    Welcome,
    Abort,
    Goodbye,
    Error,
    Publish,
    Published,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    Event,
    Call,
    Cancel,
    Result,
    Register,
    Registered,
    Unregister,
    Unregistered,
    Invocation,
    Interrupt,
    Yield,
}

impl MessageKind {
    /// WAMP message code
    pub fn code(self) -> u64 {
        match self {
            MessageKind::Hello => 1,
            MessageKind::Welcome => 2,
            MessageKind::Abort => 3,
            MessageKind::Goodbye => 6,
            MessageKind::Error => 8,
            MessageKind::Publish => 16,
            MessageKind::Published => 17,
            MessageKind::Subscribe => 32,
            MessageKind::Subscribed => 33,
            MessageKind::Unsubscribe => 34,
            MessageKind::Unsubscribed => 35,
            MessageKind::Event => 36,
            MessageKind::Call => 48,
            MessageKind::Cancel => 49,
            MessageKind::Result => 50,
            MessageKind::Register => 64,
            MessageKind::Registered => 65,
            MessageKind::Unregister => 66,
            MessageKind::Unregistered => 67,
            MessageKind::Invocation => 68,
            MessageKind::Interrupt => 69,
            MessageKind::Yield => 70,
        }
    }

    /// Look up a kind by its WAMP message code
    pub fn from_code(code: u64) -> Option<Self> {
        let kind = match code {
            1 => MessageKind::Hello,
            2 => MessageKind::Welcome,
            3 => MessageKind::Abort,
            6 => MessageKind::Goodbye,
            8 => MessageKind::Error,
            16 => MessageKind::Publish,
            17 => MessageKind::Published,
            32 => MessageKind::Subscribe,
            33 => MessageKind::Subscribed,
            34 => MessageKind::Unsubscribe,
            35 => MessageKind::Unsubscribed,
            36 => MessageKind::Event,
            48 => MessageKind::Call,
            49 => MessageKind::Cancel,
            50 => MessageKind::Result,
            64 => MessageKind::Register,
            65 => MessageKind::Registered,
            66 => MessageKind::Unregister,
            67 => MessageKind::Unregistered,
            68 => MessageKind::Invocation,
            69 => MessageKind::Interrupt,
            70 => MessageKind::Yield,
            _ => return None,
        };
        Some(kind)
    }
}

/// A WAMP message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello {
        realm: String,
        details: Dict,
    },
    Welcome {
        session: Id,
        details: Dict,
    },
    Abort {
        details: Dict,
        reason: String,
    },
    Goodbye {
        details: Dict,
        reason: String,
    },
    Error {
        request_type: MessageKind,
        request: Id,
        details: Dict,
        error: String,
        args: Vec<Value>,
        kwargs: Dict,
    },
    Publish {
        request: Id,
        options: Dict,
        topic: String,
        args: Vec<Value>,
        kwargs: Dict,
    },
    Published {
        request: Id,
        publication: Id,
    },
    Subscribe {
        request: Id,
        options: Dict,
        topic: String,
    },
    Subscribed {
        request: Id,
        subscription: Id,
    },
    Unsubscribe {
        request: Id,
        subscription: Id,
    },
    Unsubscribed {
        request: Id,
    },
    Event {
        subscription: Id,
        publication: Id,
        details: Dict,
        args: Vec<Value>,
        kwargs: Dict,
    },
    Call {
        request: Id,
        options: Dict,
        procedure: String,
        args: Vec<Value>,
        kwargs: Dict,
    },
    Cancel {
        request: Id,
        options: Dict,
    },
    Result {
        request: Id,
        details: Dict,
        args: Vec<Value>,
        kwargs: Dict,
    },
    Register {
        request: Id,
        options: Dict,
        procedure: String,
    },
    Registered {
        request: Id,
        registration: Id,
    },
    Unregister {
        request: Id,
        registration: Id,
    },
    Unregistered {
        request: Id,
    },
    Invocation {
        request: Id,
        registration: Id,
        details: Dict,
        args: Vec<Value>,
        kwargs: Dict,
    },
    Interrupt {
        request: Id,
        options: Dict,
    },
    Yield {
        request: Id,
        options: Dict,
        args: Vec<Value>,
        kwargs: Dict,
    },
}

impl Message {
    /// The kind of this message
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Hello { .. } => MessageKind::Hello,
            Message::Welcome { .. } => MessageKind::Welcome,
            Message::Abort { .. } => MessageKind::Abort,
            Message::Goodbye { .. } => MessageKind::Goodbye,
            Message::Error { .. } => MessageKind::Error,
            Message::Publish { .. } => MessageKind::Publish,
            Message::Published { .. } => MessageKind::Published,
            Message::Subscribe { .. } => MessageKind::Subscribe,
            Message::Subscribed { .. } => MessageKind::Subscribed,
            Message::Unsubscribe { .. } => MessageKind::Unsubscribe,
            Message::Unsubscribed { .. } => MessageKind::Unsubscribed,
            Message::Event { .. } => MessageKind::Event,
            Message::Call { .. } => MessageKind::Call,
            Message::Cancel { .. } => MessageKind::Cancel,
            Message::Result { .. } => MessageKind::Result,
            Message::Register { .. } => MessageKind::Register,
            Message::Registered { .. } => MessageKind::Registered,
            Message::Unregister { .. } => MessageKind::Unregister,
            Message::Unregistered { .. } => MessageKind::Unregistered,
            Message::Invocation { .. } => MessageKind::Invocation,
            Message::Interrupt { .. } => MessageKind::Interrupt,
            Message::Yield { .. } => MessageKind::Yield,
        }
    }

    /// Request id carried by request/response messages
    pub fn request_id(&self) -> Option<Id> {
        match self {
            Message::Error { request, .. }
            | Message::Publish { request, .. }
            | Message::Published { request, .. }
            | Message::Subscribe { request, .. }
            | Message::Subscribed { request, .. }
            | Message::Unsubscribe { request, .. }
            | Message::Unsubscribed { request }
            | Message::Call { request, .. }
            | Message::Cancel { request, .. }
            | Message::Result { request, .. }
            | Message::Register { request, .. }
            | Message::Registered { request, .. }
            | Message::Unregister { request, .. }
            | Message::Unregistered { request }
            | Message::Invocation { request, .. }
            | Message::Interrupt { request, .. }
            | Message::Yield { request, .. } => Some(*request),
            _ => None,
        }
    }

    /// Options dictionary of request messages
    pub fn options(&self) -> Option<&Dict> {
        match self {
            Message::Publish { options, .. }
            | Message::Subscribe { options, .. }
            | Message::Call { options, .. }
            | Message::Cancel { options, .. }
            | Message::Register { options, .. }
            | Message::Interrupt { options, .. }
            | Message::Yield { options, .. } => Some(options),
            _ => None,
        }
    }

    /// Build an ERROR answering this request message
    pub fn error_reply(&self, uri: impl Into<String>) -> Message {
        Message::error(self.kind(), self.request_id().unwrap_or_default(), uri)
    }

    /// Build an ERROR for a request of the given kind
    pub fn error(request_type: MessageKind, request: Id, uri: impl Into<String>) -> Message {
        Message::Error {
            request_type,
            request,
            details: Dict::new(),
            error: uri.into(),
            args: Vec::new(),
            kwargs: Dict::new(),
        }
    }

    /// Attach positional arguments to an ERROR
    pub fn with_error_args(mut self, values: Vec<Value>) -> Message {
        if let Message::Error { args, .. } = &mut self {
            *args = values;
        }
        self
    }

    /// Encode into the WAMP array layout
    pub fn to_value(&self) -> Value {
        let mut parts = vec![Value::from(self.kind().code())];
        match self {
            Message::Hello { realm, details } => {
                parts.push(Value::from(realm.as_str()));
                parts.push(Value::Object(details.clone()));
            }
            Message::Welcome { session, details } => {
                parts.push(Value::from(*session));
                parts.push(Value::Object(details.clone()));
            }
            Message::Abort { details, reason } | Message::Goodbye { details, reason } => {
                parts.push(Value::Object(details.clone()));
                parts.push(Value::from(reason.as_str()));
            }
            Message::Error {
                request_type,
                request,
                details,
                error,
                args,
                kwargs,
            } => {
                parts.push(Value::from(request_type.code()));
                parts.push(Value::from(*request));
                parts.push(Value::Object(details.clone()));
                parts.push(Value::from(error.as_str()));
                push_payload(&mut parts, args, kwargs);
            }
            Message::Publish {
                request,
                options,
                topic,
                args,
                kwargs,
            } => {
                parts.push(Value::from(*request));
                parts.push(Value::Object(options.clone()));
                parts.push(Value::from(topic.as_str()));
                push_payload(&mut parts, args, kwargs);
            }
            Message::Published {
                request,
                publication,
            } => {
                parts.push(Value::from(*request));
                parts.push(Value::from(*publication));
            }
            Message::Subscribe {
                request,
                options,
                topic,
            } => {
                parts.push(Value::from(*request));
                parts.push(Value::Object(options.clone()));
                parts.push(Value::from(topic.as_str()));
            }
            Message::Subscribed {
                request,
                subscription,
            }
            | Message::Unsubscribe {
                request,
                subscription,
            } => {
                parts.push(Value::from(*request));
                parts.push(Value::from(*subscription));
            }
            Message::Unsubscribed { request } | Message::Unregistered { request } => {
                parts.push(Value::from(*request));
            }
            Message::Event {
                subscription,
                publication,
                details,
                args,
                kwargs,
            } => {
                parts.push(Value::from(*subscription));
                parts.push(Value::from(*publication));
                parts.push(Value::Object(details.clone()));
                push_payload(&mut parts, args, kwargs);
            }
            Message::Call {
                request,
                options,
                procedure,
                args,
                kwargs,
            } => {
                parts.push(Value::from(*request));
                parts.push(Value::Object(options.clone()));
                parts.push(Value::from(procedure.as_str()));
                push_payload(&mut parts, args, kwargs);
            }
            Message::Cancel { request, options } | Message::Interrupt { request, options } => {
                parts.push(Value::from(*request));
                parts.push(Value::Object(options.clone()));
            }
            Message::Result {
                request,
                details,
                args,
                kwargs,
            }
            | Message::Yield {
                request,
                options: details,
                args,
                kwargs,
            } => {
                parts.push(Value::from(*request));
                parts.push(Value::Object(details.clone()));
                push_payload(&mut parts, args, kwargs);
            }
            Message::Register {
                request,
                options,
                procedure,
            } => {
                parts.push(Value::from(*request));
                parts.push(Value::Object(options.clone()));
                parts.push(Value::from(procedure.as_str()));
            }
            Message::Registered {
                request,
                registration,
            }
            | Message::Unregister {
                request,
                registration,
            } => {
                parts.push(Value::from(*request));
                parts.push(Value::from(*registration));
            }
            Message::Invocation {
                request,
                registration,
                details,
                args,
                kwargs,
            } => {
                parts.push(Value::from(*request));
                parts.push(Value::from(*registration));
                parts.push(Value::Object(details.clone()));
                push_payload(&mut parts, args, kwargs);
            }
        }
        Value::Array(parts)
    }

    /// Decode from the WAMP array layout
    pub fn from_value(value: Value) -> Result<Message> {
        let Value::Array(items) = value else {
            return Err(RouterError::InvalidMessage(
                "message is not an array".to_string(),
            ));
        };
        let mut f = Fields::new(items);
        let code = f.id("message type")?;
        let kind = MessageKind::from_code(code).ok_or_else(|| {
            RouterError::InvalidMessage(format!("unknown message type {}", code))
        })?;

        let message = match kind {
            MessageKind::Hello => Message::Hello {
                realm: f.string("realm")?,
                details: f.dict("details")?,
            },
            MessageKind::Welcome => Message::Welcome {
                session: f.id("session")?,
                details: f.dict("details")?,
            },
            MessageKind::Abort => Message::Abort {
                details: f.dict("details")?,
                reason: f.string("reason")?,
            },
            MessageKind::Goodbye => Message::Goodbye {
                details: f.dict("details")?,
                reason: f.string("reason")?,
            },
            MessageKind::Error => {
                let code = f.id("request type")?;
                Message::Error {
                    request_type: MessageKind::from_code(code).ok_or_else(|| {
                        RouterError::InvalidMessage(format!("unknown request type {}", code))
                    })?,
                    request: f.id("request")?,
                    details: f.dict("details")?,
                    error: f.string("error")?,
                    args: f.args()?,
                    kwargs: f.kwargs()?,
                }
            }
            MessageKind::Publish => Message::Publish {
                request: f.id("request")?,
                options: f.dict("options")?,
                topic: f.string("topic")?,
                args: f.args()?,
                kwargs: f.kwargs()?,
            },
            MessageKind::Published => Message::Published {
                request: f.id("request")?,
                publication: f.id("publication")?,
            },
            MessageKind::Subscribe => Message::Subscribe {
                request: f.id("request")?,
                options: f.dict("options")?,
                topic: f.string("topic")?,
            },
            MessageKind::Subscribed => Message::Subscribed {
                request: f.id("request")?,
                subscription: f.id("subscription")?,
            },
            MessageKind::Unsubscribe => Message::Unsubscribe {
                request: f.id("request")?,
                subscription: f.id("subscription")?,
            },
            MessageKind::Unsubscribed => Message::Unsubscribed {
                request: f.id("request")?,
            },
            MessageKind::Event => Message::Event {
                subscription: f.id("subscription")?,
                publication: f.id("publication")?,
                details: f.dict("details")?,
                args: f.args()?,
                kwargs: f.kwargs()?,
            },
            MessageKind::Call => Message::Call {
                request: f.id("request")?,
                options: f.dict("options")?,
                procedure: f.string("procedure")?,
                args: f.args()?,
                kwargs: f.kwargs()?,
            },
            MessageKind::Cancel => Message::Cancel {
                request: f.id("request")?,
                options: f.dict("options")?,
            },
            MessageKind::Result => Message::Result {
                request: f.id("request")?,
                details: f.dict("details")?,
                args: f.args()?,
                kwargs: f.kwargs()?,
            },
            MessageKind::Register => Message::Register {
                request: f.id("request")?,
                options: f.dict("options")?,
                procedure: f.string("procedure")?,
            },
            MessageKind::Registered => Message::Registered {
                request: f.id("request")?,
                registration: f.id("registration")?,
            },
            MessageKind::Unregister => Message::Unregister {
                request: f.id("request")?,
                registration: f.id("registration")?,
            },
            MessageKind::Unregistered => Message::Unregistered {
                request: f.id("request")?,
            },
            MessageKind::Invocation => Message::Invocation {
                request: f.id("request")?,
                registration: f.id("registration")?,
                details: f.dict("details")?,
                args: f.args()?,
                kwargs: f.kwargs()?,
            },
            MessageKind::Interrupt => Message::Interrupt {
                request: f.id("request")?,
                options: f.dict("options")?,
            },
            MessageKind::Yield => Message::Yield {
                request: f.id("request")?,
                options: f.dict("options")?,
                args: f.args()?,
                kwargs: f.kwargs()?,
            },
        };
        Ok(message)
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Message::from_value(value).map_err(D::Error::custom)
    }
}

/// True when `key` is present in `dict` and set to boolean `true`
pub fn flag(dict: &Dict, key: &str) -> bool {
    matches!(dict.get(key), Some(Value::Bool(true)))
}

fn push_payload(parts: &mut Vec<Value>, args: &[Value], kwargs: &Dict) {
    if args.is_empty() && kwargs.is_empty() {
        return;
    }
    parts.push(Value::Array(args.to_vec()));
    if !kwargs.is_empty() {
        parts.push(Value::Object(kwargs.clone()));
    }
}

/// Positional reader over the elements of a message array
struct Fields {
    items: std::vec::IntoIter<Value>,
}

impl Fields {
    fn new(items: Vec<Value>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }

    fn next(&mut self, name: &str) -> Result<Value> {
        self.items
            .next()
            .ok_or_else(|| RouterError::InvalidMessage(format!("missing {}", name)))
    }

    fn id(&mut self, name: &str) -> Result<Id> {
        let value = self.next(name)?;
        value.as_u64().ok_or_else(|| {
            RouterError::InvalidMessage(format!("{} must be an unsigned integer, got {}", name, value))
        })
    }

    fn string(&mut self, name: &str) -> Result<String> {
        match self.next(name)? {
            Value::String(s) => Ok(s),
            other => Err(RouterError::InvalidMessage(format!(
                "{} must be a string, got {}",
                name, other
            ))),
        }
    }

    fn dict(&mut self, name: &str) -> Result<Dict> {
        match self.next(name)? {
            Value::Object(map) => Ok(map),
            other => Err(RouterError::InvalidMessage(format!(
                "{} must be a dictionary, got {}",
                name, other
            ))),
        }
    }

    fn args(&mut self) -> Result<Vec<Value>> {
        match self.items.next() {
            None => Ok(Vec::new()),
            Some(Value::Array(args)) => Ok(args),
            Some(other) => Err(RouterError::InvalidMessage(format!(
                "arguments must be a list, got {}",
                other
            ))),
        }
    }

    fn kwargs(&mut self) -> Result<Dict> {
        match self.items.next() {
            None => Ok(Dict::new()),
            Some(Value::Object(kwargs)) => Ok(kwargs),
            Some(other) => Err(RouterError::InvalidMessage(format!(
                "keyword arguments must be a dictionary, got {}",
                other
            ))),
        }
    }
}
