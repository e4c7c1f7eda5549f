//! Outbound side of a peer connection
//!
//! The router never touches sockets. A [`Transport`] is whatever can carry
//! messages back to one connected peer: an in-process channel, a no-op
//! sink for the router's own meta session, or a relay through the shared
//! store to the worker that owns the real connection.

use crate::codec::JSON_PROTOCOL;
use crate::error::{Result, RouterError};
use crate::message::{Dict, Message};
use crate::session::SessionStorage;
use crate::store::keys;
use crate::store::SharedStore;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};

/// Outbound channel to one peer
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connection id, unique within the owning worker
    fn id(&self) -> &str;

    /// Deliver a message to the peer
    async fn send(&self, message: Message) -> Result<()>;

    /// Round-trip liveness probe; fails with `RouterError::Timeout` when
    /// no answer arrives within `timeout`
    async fn ping(&self, _timeout: Duration) -> Result<()> {
        Err(RouterError::PingNotSupported(self.id().to_string()))
    }

    /// Close the connection
    async fn close(&self) -> Result<()>;

    /// Connection details attached to HELLO (peer address, etc.)
    fn details(&self) -> Dict {
        Dict::new()
    }

    /// Negotiated WAMP sub-protocol
    fn protocol(&self) -> &str {
        JSON_PROTOCOL
    }
}

/// Correlates pings with their pongs by sequence number
#[derive(Default)]
pub struct PingTracker {
    next_seq: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<()>>>,
}

impl PingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new outstanding ping
    pub async fn start(&self) -> (u64, oneshot::Receiver<()>) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(seq, tx);
        (seq, rx)
    }

    /// Resolve the ping with this sequence number
    pub async fn resolve(&self, seq: u64) -> bool {
        match self.pending.lock().await.remove(&seq) {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Wait for the pong, giving up after `timeout`
    pub async fn wait(&self, seq: u64, rx: oneshot::Receiver<()>, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RouterError::Transport(format!("ping {} abandoned", seq))),
            Err(_) => {
                self.pending.lock().await.remove(&seq);
                Err(RouterError::Timeout(format!(
                    "no pong for ping {} within {}ms",
                    seq,
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Number of pings still waiting for an answer
    pub async fn outstanding(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// What a [`ChannelTransport`] hands to its connection task
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(Message),
    /// Send a ping carrying this sequence; answer with [`ChannelTransport::on_pong`]
    Ping(u64),
    Close,
}

/// Transport backed by an unbounded mpsc channel
///
/// The receiving half belongs to whatever drives the real connection
/// (a WebSocket task, or a test peer).
pub struct ChannelTransport {
    id: String,
    protocol: String,
    details: Dict,
    tx: mpsc::UnboundedSender<Outbound>,
    pings: PingTracker,
    closed: AtomicBool,
}

impl ChannelTransport {
    /// New transport with a random id speaking `wamp.2.json`
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        Self::with_details(uuid::Uuid::new_v4().to_string(), JSON_PROTOCOL, Dict::new())
    }

    pub fn with_details(
        id: impl Into<String>,
        protocol: impl Into<String>,
        details: Dict,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            id: id.into(),
            protocol: protocol.into(),
            details,
            tx,
            pings: PingTracker::new(),
            closed: AtomicBool::new(false),
        });
        (transport, rx)
    }

    /// Report a pong received from the peer
    pub async fn on_pong(&self, seq: u64) -> bool {
        self.pings.resolve(seq).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn push(&self, item: Outbound) -> Result<()> {
        if self.is_closed() {
            return Err(RouterError::Transport(format!("transport {} is closed", self.id)));
        }
        self.tx
            .send(item)
            .map_err(|_| RouterError::Transport(format!("transport {} receiver dropped", self.id)))
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.push(Outbound::Message(message))
    }

    async fn ping(&self, timeout: Duration) -> Result<()> {
        let (seq, rx) = self.pings.start().await;
        if let Err(e) = self.push(Outbound::Ping(seq)) {
            self.pings.resolve(seq).await;
            return Err(e);
        }
        self.pings.wait(seq, rx, timeout).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.tx.send(Outbound::Close);
        Ok(())
    }

    fn details(&self) -> Dict {
        self.details.clone()
    }

    fn protocol(&self) -> &str {
        &self.protocol
    }
}

/// Sink for the router's internal meta session
pub struct NullTransport {
    id: String,
}

impl NullTransport {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl Transport for NullTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, _message: Message) -> Result<()> {
        Ok(())
    }

    async fn ping(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Envelope exchanged on `relay:<serverId>` channels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum RelayEnvelope {
    /// Deliver a message to a local connection
    Send {
        #[serde(rename = "transportId")]
        transport_id: String,
        frame: Value,
    },
    /// Probe a local connection, answering on `relay:<replyTo>`
    Ping {
        #[serde(rename = "transportId")]
        transport_id: String,
        seq: u64,
        #[serde(rename = "replyTo")]
        reply_to: String,
        #[serde(rename = "timeoutMs")]
        timeout_ms: u64,
    },
    /// Answer to a relayed ping
    Pong { seq: u64 },
    /// Shut a local connection down
    Close {
        #[serde(rename = "transportId")]
        transport_id: String,
    },
}

/// Per-worker endpoint of the cross-worker relay
///
/// Sessions owned by another worker are reached by publishing envelopes
/// on that worker's relay channel; [`Relay::serve`] delivers envelopes
/// addressed to this worker.
pub struct Relay {
    server_id: String,
    store: Arc<dyn SharedStore>,
    pings: PingTracker,
}

impl Relay {
    pub fn new(store: Arc<dyn SharedStore>, server_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            server_id: server_id.into(),
            store,
            pings: PingTracker::new(),
        })
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Transport reaching `transport_id` on worker `owner`
    pub fn transport(
        self: &Arc<Self>,
        transport_id: impl Into<String>,
        owner: impl Into<String>,
        protocol: impl Into<String>,
    ) -> Arc<RelayTransport> {
        Arc::new(RelayTransport {
            id: transport_id.into(),
            owner: owner.into(),
            protocol: protocol.into(),
            relay: Arc::clone(self),
        })
    }

    async fn post(&self, owner: &str, envelope: &RelayEnvelope) -> Result<()> {
        let payload = serde_json::to_value(envelope)?;
        self.store.publish(&keys::relay(owner), &payload).await
    }

    /// Subscribe to this worker's relay channel
    pub async fn listen(&self) -> Result<BoxStream<'static, Value>> {
        self.store.subscribe(&keys::relay(&self.server_id)).await
    }

    /// Deliver incoming envelopes until the stream ends or the session
    /// storage is gone
    pub async fn serve(self: Arc<Self>, mut inbox: BoxStream<'static, Value>, sessions: Weak<SessionStorage>) {
        while let Some(payload) = inbox.next().await {
            let envelope: RelayEnvelope = match serde_json::from_value(payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!(server_id = %self.server_id, error = %e, "Malformed relay envelope");
                    continue;
                }
            };
            let Some(storage) = sessions.upgrade() else {
                break;
            };
            // pings wait on the peer; everything else keeps arrival order
            if matches!(envelope, RelayEnvelope::Ping { .. }) {
                let relay = Arc::clone(&self);
                tokio::spawn(async move { relay.deliver(envelope, storage).await });
            } else {
                self.deliver(envelope, storage).await;
            }
        }
        tracing::debug!(server_id = %self.server_id, "Relay stopped");
    }

    async fn deliver(&self, envelope: RelayEnvelope, sessions: Arc<SessionStorage>) {
        match envelope {
            RelayEnvelope::Send {
                transport_id,
                frame,
            } => {
                let message = match Message::from_value(frame) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!(transport_id = %transport_id, error = %e, "Undecodable relayed frame");
                        return;
                    }
                };
                match sessions.get_local(&transport_id).await {
                    Some(session) => session.send(message).await,
                    None => {
                        tracing::debug!(transport_id = %transport_id, "Relayed message for unknown connection dropped")
                    }
                }
            }
            RelayEnvelope::Ping {
                transport_id,
                seq,
                reply_to,
                timeout_ms,
            } => {
                let Some(session) = sessions.get_local(&transport_id).await else {
                    return;
                };
                if session.ping(Duration::from_millis(timeout_ms)).await.is_ok() {
                    if let Err(e) = self.post(&reply_to, &RelayEnvelope::Pong { seq }).await {
                        tracing::warn!(reply_to = %reply_to, error = %e, "Failed to answer relayed ping");
                    }
                }
            }
            RelayEnvelope::Pong { seq } => {
                self.pings.resolve(seq).await;
            }
            RelayEnvelope::Close { transport_id } => {
                if let Some(session) = sessions.get_local(&transport_id).await {
                    session.shutdown().await;
                }
            }
        }
    }
}

/// Transport for a connection owned by another worker
pub struct RelayTransport {
    id: String,
    owner: String,
    protocol: String,
    relay: Arc<Relay>,
}

impl RelayTransport {
    /// Worker that owns the real connection
    pub fn owner(&self) -> &str {
        &self.owner
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, message: Message) -> Result<()> {
        let envelope = RelayEnvelope::Send {
            transport_id: self.id.clone(),
            frame: message.to_value(),
        };
        self.relay.post(&self.owner, &envelope).await
    }

    async fn ping(&self, timeout: Duration) -> Result<()> {
        let (seq, rx) = self.relay.pings.start().await;
        let envelope = RelayEnvelope::Ping {
            transport_id: self.id.clone(),
            seq,
            reply_to: self.relay.server_id.clone(),
            timeout_ms: timeout.as_millis() as u64,
        };
        if let Err(e) = self.relay.post(&self.owner, &envelope).await {
            self.relay.pings.resolve(seq).await;
            return Err(e);
        }
        self.relay.pings.wait(seq, rx, timeout).await
    }

    async fn close(&self) -> Result<()> {
        let envelope = RelayEnvelope::Close {
            transport_id: self.id.clone(),
        };
        self.relay.post(&self.owner, &envelope).await
    }

    fn protocol(&self) -> &str {
        &self.protocol
    }
}

/// Binds proxy sessions to connections owned by other workers
pub trait Connector: Send + Sync {
    /// Transport reaching `transport_id` on worker `owner`, if reachable
    fn connect(&self, transport_id: &str, owner: &str, protocol: &str) -> Option<Arc<dyn Transport>>;
}

/// [`Connector`] that reaches remote connections through the relay
pub struct RelayConnector {
    relay: Arc<Relay>,
}

impl RelayConnector {
    pub fn new(relay: Arc<Relay>) -> Self {
        Self { relay }
    }
}

impl Connector for RelayConnector {
    fn connect(&self, transport_id: &str, owner: &str, protocol: &str) -> Option<Arc<dyn Transport>> {
        if owner == self.relay.server_id() {
            return None;
        }
        Some(self.relay.transport(transport_id, owner, protocol))
    }
}
