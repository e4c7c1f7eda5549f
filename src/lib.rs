//! # a3s-wamp
//!
//! Horizontally scaled WAMP router core for the A3S ecosystem.
//!
//! ## Overview
//!
//! `a3s-wamp` implements the routing half of a WAMP v2 router: a broker
//! for publish/subscribe and a dealer for routed RPC. Any number of
//! router workers share one key-value store (Redis in production, an
//! in-memory store for tests and single-process use). A client connected
//! to one worker can subscribe to events published on another, and call
//! procedures registered by a callee connected to a third.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use a3s_wamp::{ChannelTransport, Message, MemoryStore, RealmManager, RouterConfig};
//!
//! # async fn example() -> a3s_wamp::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let manager = RealmManager::new(RouterConfig::with_server_id("worker-1"), store).await?;
//!
//! // One transport per accepted connection
//! let (transport, _outbound) = ChannelTransport::new();
//! let session = manager.open_session(transport).await?;
//!
//! manager
//!     .dispatch(&session, Message::Hello {
//!         realm: "realm1".to_string(),
//!         details: Default::default(),
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **SharedStore** trait — the only place cross-worker state lives
//! - **RealmManager** — per-worker entry point: opens, dispatches and closes sessions
//! - **Realm** — routing domain; runs the broker and dealer roles
//! - **Broker** / **Dealer** — pub/sub and RPC over the shared directory
//! - **Relay** — delivers frames to sessions owned by other workers

pub mod broker;
pub mod codec;
pub mod config;
pub mod dealer;
pub mod error;
pub mod ids;
pub mod message;
pub mod realm;
pub mod router;
pub mod session;
pub mod store;
pub mod transport;
pub mod uri;

// Re-export core types
pub use broker::{Broker, Subscription, SubscriptionRecord};
pub use codec::{negotiate, JsonSerializer, MsgPackSerializer, Serializer};
pub use config::{RedisConfig, RouterConfig};
pub use dealer::{
    Call, CallState, Dealer, InvocationRecord, InvokePolicy, Procedure, ProcedureDescriptor,
    Registration, RegistrationRecord,
};
pub use error::{Result, RouterError};
pub use ids::IdGenerator;
pub use message::{Dict, Id, Message, MessageKind};
pub use realm::{Realm, RealmManager};
pub use router::{Role, Router, RouterContext, RouterEvent};
pub use session::{AuthenticationDetails, Session, SessionStorage};
pub use store::{MemoryStore, RedisStore, SharedStore};
pub use transport::{ChannelTransport, Outbound, Relay, Transport};
