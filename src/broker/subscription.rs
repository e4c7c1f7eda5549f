//! Subscriptions and their pause/replay queue

use crate::error::{Result, RouterError};
use crate::message::{Dict, Id, Message};
use crate::session::Session;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Shared-store image of a subscription, stored under `sub:<uri>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRecord {
    pub session_id: Id,
    pub transport_id: String,
    pub subscription_id: Id,
    /// The SUBSCRIBE message that created the subscription
    pub message: Value,
    #[serde(default)]
    pub realm: Option<String>,
}

#[derive(Default)]
struct PauseState {
    paused: bool,
    queue: Vec<(Id, Message)>,
}

/// One (session, topic) binding
pub struct Subscription {
    id: Id,
    topic: String,
    session: Arc<Session>,
    options: Dict,
    disclose_publisher: bool,
    pause: Mutex<PauseState>,
}

impl Subscription {
    pub fn new(id: Id, topic: impl Into<String>, session: Arc<Session>, options: Dict) -> Self {
        let disclose_publisher = crate::message::flag(&options, "disclose_publisher");
        Self {
            id,
            topic: topic.into(),
            session,
            options,
            disclose_publisher,
            pause: Mutex::new(PauseState::default()),
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn options(&self) -> &Dict {
        &self.options
    }

    pub fn disclose_publisher(&self) -> bool {
        self.disclose_publisher
    }

    /// Whether `session` owns this subscription
    pub fn is_owned_by(&self, session: &Session) -> bool {
        self.session.id() == session.id() && self.session.transport_id() == session.transport_id()
    }

    /// Shared-store record for this subscription
    pub fn to_record(&self) -> SubscriptionRecord {
        SubscriptionRecord {
            session_id: self.session.id(),
            transport_id: self.session.transport_id().to_string(),
            subscription_id: self.id,
            message: Message::Subscribe {
                request: 0,
                options: self.options.clone(),
                topic: self.topic.clone(),
            }
            .to_value(),
            realm: self.session.realm_name().map(str::to_string),
        }
    }

    /// Deliver one publication, or queue it while paused
    pub async fn send_event(&self, publication: Id, details: Dict, args: Vec<Value>, kwargs: Dict) {
        let event = Message::Event {
            subscription: self.id,
            publication,
            details,
            args,
            kwargs,
        };
        {
            let mut state = self.pause.lock().await;
            if state.paused {
                state.queue.push((publication, event));
                return;
            }
        }
        self.session.send(event).await;
    }

    pub async fn is_paused(&self) -> bool {
        self.pause.lock().await.paused
    }

    /// Hold events while the subscriber synchronizes its state
    pub async fn pause_for_state(&self) -> Result<()> {
        let mut state = self.pause.lock().await;
        if state.paused {
            return Err(RouterError::Invariant(format!(
                "subscription {} is already paused",
                self.id
            )));
        }
        state.paused = true;
        Ok(())
    }

    /// Resume delivery, replaying the events queued after
    /// `last_publication`; everything is replayed when that publication
    /// was never queued
    pub async fn unpause_for_state(&self, last_publication: Option<Id>) -> Result<usize> {
        let queued = {
            let mut state = self.pause.lock().await;
            if !state.paused {
                return Err(RouterError::Invariant(format!(
                    "subscription {} is not paused",
                    self.id
                )));
            }
            state.paused = false;
            std::mem::take(&mut state.queue)
        };

        let start = last_publication
            .and_then(|last| queued.iter().position(|(id, _)| *id == last))
            .map(|index| index + 1)
            .unwrap_or(0);
        let replayed = queued.len() - start;
        for (_, event) in queued.into_iter().skip(start) {
            self.session.send(event).await;
        }
        Ok(replayed)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("session", &self.session.id())
            .finish()
    }
}
