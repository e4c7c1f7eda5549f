//! Wire codecs and sub-protocol negotiation
//!
//! The router prefers `wamp.2.msgpack` and falls back to `wamp.2.json`.
//! The chosen codec decides whether outbound frames are binary or text.

use crate::error::{Result, RouterError};
use crate::message::Message;
use bytes::Bytes;
use std::sync::Arc;

pub const JSON_PROTOCOL: &str = "wamp.2.json";
pub const MSGPACK_PROTOCOL: &str = "wamp.2.msgpack";

/// Sub-protocols the router speaks, most preferred first
pub const SUPPORTED_PROTOCOLS: [&str; 2] = [MSGPACK_PROTOCOL, JSON_PROTOCOL];

/// Framing of an encoded message on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
}

/// Message codec bound to one WAMP sub-protocol
pub trait Serializer: Send + Sync {
    /// Sub-protocol name (e.g. `wamp.2.json`)
    fn protocol(&self) -> &'static str;

    /// Frame kind for encoded messages
    fn frame_kind(&self) -> FrameKind;

    /// Encode a message
    fn serialize(&self, message: &Message) -> Result<Bytes>;

    /// Decode a message
    fn deserialize(&self, data: &[u8]) -> Result<Message>;
}

/// JSON codec (`wamp.2.json`)
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn protocol(&self) -> &'static str {
        JSON_PROTOCOL
    }

    fn frame_kind(&self) -> FrameKind {
        FrameKind::Text
    }

    fn serialize(&self, message: &Message) -> Result<Bytes> {
        let data = serde_json::to_vec(&message.to_value())
            .map_err(|e| RouterError::Codec(e.to_string()))?;
        Ok(Bytes::from(data))
    }

    fn deserialize(&self, data: &[u8]) -> Result<Message> {
        let value: serde_json::Value =
            serde_json::from_slice(data).map_err(|e| RouterError::Codec(e.to_string()))?;
        Message::from_value(value)
    }
}

/// MessagePack codec (`wamp.2.msgpack`)
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgPackSerializer;

impl Serializer for MsgPackSerializer {
    fn protocol(&self) -> &'static str {
        MSGPACK_PROTOCOL
    }

    fn frame_kind(&self) -> FrameKind {
        FrameKind::Binary
    }

    fn serialize(&self, message: &Message) -> Result<Bytes> {
        let data = rmp_serde::to_vec(&message.to_value())
            .map_err(|e| RouterError::Codec(e.to_string()))?;
        Ok(Bytes::from(data))
    }

    fn deserialize(&self, data: &[u8]) -> Result<Message> {
        let value: serde_json::Value =
            rmp_serde::from_slice(data).map_err(|e| RouterError::Codec(e.to_string()))?;
        Message::from_value(value)
    }
}

/// Split a `Sec-WebSocket-Protocol` header into protocol names
pub fn parse_protocol_header(header: &str) -> Vec<String> {
    header
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// First router-preferred protocol the client offered
pub fn negotiate<S: AsRef<str>>(offered: &[S]) -> Option<&'static str> {
    SUPPORTED_PROTOCOLS
        .iter()
        .copied()
        .find(|supported| offered.iter().any(|o| o.as_ref() == *supported))
}

/// Codec for a negotiated protocol
pub fn serializer_for(protocol: &str) -> Option<Arc<dyn Serializer>> {
    match protocol {
        JSON_PROTOCOL => Some(Arc::new(JsonSerializer)),
        MSGPACK_PROTOCOL => Some(Arc::new(MsgPackSerializer)),
        _ => None,
    }
}
