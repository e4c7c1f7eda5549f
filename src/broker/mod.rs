//! Broker role: PUBLISH / SUBSCRIBE / UNSUBSCRIBE
//!
//! Subscriptions owned by this worker live in per-topic groups; every
//! subscription is mirrored in the shared store under `sub:<uri>` so a
//! publish on any worker reaches subscribers everywhere.
//!
//! Group creation and retirement are funneled through one task per broker
//! that consumes a capacity-1 queue, so two first subscribers of a topic
//! cannot both create its group and a retire cannot race a create.

mod subscription;

pub use subscription::{Subscription, SubscriptionRecord};

use crate::error::{Result, RouterError};
use crate::message::{flag, Dict, Id, Message, MessageKind};
use crate::router::{EventKind, Role, RouterContext, RouterEvent};
use crate::session::Session;
use crate::store::keys;
use crate::uri;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;

type Groups = RwLock<HashMap<String, HashMap<Id, Arc<Subscription>>>>;

enum GroupCommand {
    Create {
        topic: String,
        reply: oneshot::Sender<()>,
    },
    Retire {
        topic: String,
    },
}

struct BrokerState {
    ctx: RouterContext,
    realm: String,
    groups: Groups,
}

/// Pub/sub role of one realm
pub struct Broker {
    state: Arc<BrokerState>,
    commands: mpsc::Sender<GroupCommand>,
    groups_task: JoinHandle<()>,
}

impl Broker {
    /// Create the broker and start its group task
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(ctx: RouterContext, realm: impl Into<String>) -> Self {
        let state = Arc::new(BrokerState {
            ctx,
            realm: realm.into(),
            groups: RwLock::new(HashMap::new()),
        });
        let (commands, rx) = mpsc::channel(1);
        let groups_task = tokio::spawn(run_groups(Arc::clone(&state), rx));
        Self {
            state,
            commands,
            groups_task,
        }
    }

    /// Topics with a local subscription group
    pub async fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.state.groups.read().await.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Number of subscriptions owned by this worker
    pub async fn subscription_count(&self) -> usize {
        self.state.groups.read().await.values().map(HashMap::len).sum()
    }

    /// Local subscription by id
    pub async fn subscription(&self, id: Id) -> Option<Arc<Subscription>> {
        self.state
            .groups
            .read()
            .await
            .values()
            .find_map(|group| group.get(&id).cloned())
    }

    async fn on_publish(
        &self,
        session: &Arc<Session>,
        request: Id,
        options: &Dict,
        topic: &str,
        args: &[Value],
        kwargs: &Dict,
    ) -> Result<()> {
        if !uri::is_valid_uri(topic, false, false) {
            session
                .send(Message::error(MessageKind::Publish, request, uri::INVALID_URI))
                .await;
            return Ok(());
        }

        let ctx = &self.state.ctx;
        let publication = ctx.ids.global().await?;
        let exclude_me = options
            .get("exclude_me")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let exclude = id_list(options.get("exclude"));
        let eligible = options.get("eligible").map(|v| id_list(Some(v)));

        let mut details = Dict::new();
        let disclose_me = flag(options, "disclose_me");

        let mut targets = Vec::new();
        for key in ctx.store.keys(keys::SUBSCRIPTION_GROUPS).await? {
            if keys::topic_of(&key) != Some(topic) {
                continue;
            }
            for (field, value) in ctx.store.hgetall(&key).await? {
                let record: SubscriptionRecord = match serde_json::from_value(value) {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::warn!(key = %key, field = %field, error = %e, "Unreadable subscription record");
                        continue;
                    }
                };
                if record.realm.as_deref().is_some_and(|r| r != self.state.realm) {
                    continue;
                }
                if exclude_me && record.session_id == session.id() {
                    continue;
                }
                if exclude.contains(&record.session_id) {
                    continue;
                }
                if let Some(eligible) = &eligible {
                    if !eligible.contains(&record.session_id) {
                        continue;
                    }
                }
                if let Some(subscription) = self.resolve(&record).await? {
                    targets.push(subscription);
                }
            }
        }

        if disclose_me {
            details.insert("publisher".to_string(), json!(session.id()));
        }
        let deliveries = targets.iter().map(|subscription| {
            let mut details = details.clone();
            if subscription.disclose_publisher() && !details.contains_key("publisher") {
                details.insert("publisher".to_string(), json!(session.id()));
            }
            subscription.send_event(publication, details, args.to_vec(), kwargs.clone())
        });
        futures::future::join_all(deliveries).await;

        tracing::debug!(
            topic = %topic,
            publication,
            subscribers = targets.len(),
            "Publication fanned out"
        );

        if flag(options, "acknowledge") {
            session
                .send(Message::Published {
                    request,
                    publication,
                })
                .await;
        }
        Ok(())
    }

    /// Local subscription for a record, or a transient one bound to the
    /// subscriber's (possibly remote) session
    async fn resolve(&self, record: &SubscriptionRecord) -> Result<Option<Arc<Subscription>>> {
        if let Some(local) = self.subscription(record.subscription_id).await {
            return Ok(Some(local));
        }
        let Some(session) = self.state.ctx.sessions.resolve(&record.transport_id).await? else {
            tracing::debug!(
                subscription_id = record.subscription_id,
                transport_id = %record.transport_id,
                "Subscriber session not reachable"
            );
            return Ok(None);
        };
        let (topic, options) = match Message::from_value(record.message.clone()) {
            Ok(Message::Subscribe { topic, options, .. }) => (topic, options),
            _ => (String::new(), Dict::new()),
        };
        Ok(Some(Arc::new(Subscription::new(
            record.subscription_id,
            topic,
            session,
            options,
        ))))
    }

    async fn on_subscribe(
        &self,
        session: &Arc<Session>,
        request: Id,
        options: &Dict,
        topic: &str,
    ) -> Result<()> {
        if !uri::is_valid_uri(topic, false, false) {
            session
                .send(Message::error(MessageKind::Subscribe, request, uri::INVALID_URI))
                .await;
            return Ok(());
        }

        let known = self.state.groups.read().await.contains_key(topic);
        if !known {
            let (reply, created) = oneshot::channel();
            self.commands
                .send(GroupCommand::Create {
                    topic: topic.to_string(),
                    reply,
                })
                .await
                .map_err(|_| RouterError::Invariant("broker group task stopped".to_string()))?;
            created
                .await
                .map_err(|_| RouterError::Invariant("broker group task dropped a request".to_string()))?;
        }

        self.handle_subscribe(session, request, options, topic).await
    }

    async fn handle_subscribe(
        &self,
        session: &Arc<Session>,
        request: Id,
        options: &Dict,
        topic: &str,
    ) -> Result<()> {
        let ctx = &self.state.ctx;
        let id = ctx.ids.global().await?;
        let subscription = Arc::new(Subscription::new(
            id,
            topic,
            Arc::clone(session),
            options.clone(),
        ));

        self.state
            .groups
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .insert(id, Arc::clone(&subscription));

        let record = serde_json::to_value(subscription.to_record())?;
        ctx.store
            .hset(&keys::subscriptions(topic), &id.to_string(), &record)
            .await?;

        tracing::info!(
            topic = %topic,
            subscription_id = id,
            session_id = session.id(),
            "Subscription created"
        );

        session
            .send(Message::Subscribed {
                request,
                subscription: id,
            })
            .await;
        Ok(())
    }

    async fn on_unsubscribe(&self, session: &Arc<Session>, request: Id, id: Id) -> Result<()> {
        let removed = {
            let mut groups = self.state.groups.write().await;
            let owner = groups.iter().find_map(|(topic, group)| {
                group
                    .get(&id)
                    .filter(|subscription| subscription.is_owned_by(session))
                    .map(|_| topic.clone())
            });
            match owner {
                Some(topic) => {
                    let group = groups.get_mut(&topic);
                    let now_empty = match group {
                        Some(group) => {
                            group.remove(&id);
                            group.is_empty()
                        }
                        None => false,
                    };
                    Some((topic, now_empty))
                }
                None => None,
            }
        };

        let Some((topic, now_empty)) = removed else {
            session
                .send(Message::error(
                    MessageKind::Unsubscribe,
                    request,
                    uri::NO_SUCH_SUBSCRIPTION,
                ))
                .await;
            return Ok(());
        };

        self.forget(&topic, id, now_empty).await?;
        session.send(Message::Unsubscribed { request }).await;
        Ok(())
    }

    async fn on_leave(&self, session: &Arc<Session>) -> Result<()> {
        let removed: Vec<(String, Id, bool)> = {
            let mut groups = self.state.groups.write().await;
            let mut removed = Vec::new();
            for (topic, group) in groups.iter_mut() {
                let owned: Vec<Id> = group
                    .values()
                    .filter(|subscription| subscription.is_owned_by(session))
                    .map(|subscription| subscription.id())
                    .collect();
                for id in owned {
                    group.remove(&id);
                    removed.push((topic.clone(), id, group.is_empty()));
                }
            }
            removed
        };

        for (topic, id, now_empty) in removed {
            self.forget(&topic, id, now_empty).await?;
        }
        Ok(())
    }

    /// Drop the shared record and retire the group once empty
    async fn forget(&self, topic: &str, id: Id, retire: bool) -> Result<()> {
        self.state
            .ctx
            .store
            .hdel(&keys::subscriptions(topic), &id.to_string())
            .await?;
        if retire {
            let retire = GroupCommand::Retire {
                topic: topic.to_string(),
            };
            if self.commands.send(retire).await.is_err() {
                tracing::warn!(topic = %topic, "Broker group task stopped, empty group kept");
            }
        }
        tracing::info!(topic = %topic, subscription_id = id, "Subscription removed");
        Ok(())
    }
}

async fn run_groups(state: Arc<BrokerState>, mut rx: mpsc::Receiver<GroupCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            GroupCommand::Create { topic, reply } => {
                state.groups.write().await.entry(topic).or_default();
                let _ = reply.send(());
            }
            GroupCommand::Retire { topic } => {
                let mut groups = state.groups.write().await;
                if groups.get(&topic).is_some_and(HashMap::is_empty) {
                    groups.remove(&topic);
                    tracing::debug!(topic = %topic, "Subscription group retired");
                }
            }
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.groups_task.abort();
    }
}

fn id_list(value: Option<&Value>) -> Vec<Id> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_u64).collect())
        .unwrap_or_default()
}

const BROKER_EVENTS: &[EventKind] = &[
    EventKind::Message(MessageKind::Publish),
    EventKind::Message(MessageKind::Subscribe),
    EventKind::Message(MessageKind::Unsubscribe),
    EventKind::LeaveRealm,
];

#[async_trait]
impl Role for Broker {
    fn name(&self) -> &'static str {
        "broker"
    }

    fn kinds(&self) -> &'static [EventKind] {
        BROKER_EVENTS
    }

    async fn handle(&self, session: &Arc<Session>, event: &RouterEvent) -> Result<()> {
        match event {
            RouterEvent::Message(Message::Publish {
                request,
                options,
                topic,
                args,
                kwargs,
            }) => {
                self.on_publish(session, *request, options, topic, args, kwargs)
                    .await
            }
            RouterEvent::Message(Message::Subscribe {
                request,
                options,
                topic,
            }) => self.on_subscribe(session, *request, options, topic).await,
            RouterEvent::Message(Message::Unsubscribe {
                request,
                subscription,
            }) => self.on_unsubscribe(session, *request, *subscription).await,
            RouterEvent::LeaveRealm => self.on_leave(session).await,
            _ => Ok(()),
        }
    }
}
