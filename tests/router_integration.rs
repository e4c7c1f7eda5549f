//! Router integration tests
//!
//! End-to-end tests driving one or more router workers over a shared
//! in-memory store. Each peer is a channel transport with a pump task
//! that answers pings, so liveness probes behave like a real client.
//! Covers pub/sub, routed calls, invocation policies, cancellation,
//! progressive results, session lifecycle and cross-worker routing.

use a3s_wamp::store::keys;
use a3s_wamp::{
    uri, ChannelTransport, Dict, Id, MemoryStore, Message, MessageKind, Outbound, RealmManager,
    RouterConfig, Session, SharedStore,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);
const SILENCE: Duration = Duration::from_millis(150);

fn dict(value: Value) -> Dict {
    match value {
        Value::Object(map) => map,
        _ => Dict::new(),
    }
}

fn canceling_callee() -> Value {
    json!({"callee": {"features": {"call_canceling": true}}})
}

async fn worker(store: &Arc<dyn SharedStore>, server_id: &str) -> Arc<RealmManager> {
    let mut config = RouterConfig::with_server_id(server_id);
    config.ping_timeout_ms = 200;
    RealmManager::new(config, store.clone()).await.unwrap()
}

fn memory_store() -> Arc<dyn SharedStore> {
    Arc::new(MemoryStore::new())
}

/// In-memory store with a round-trip delay on every command and a much
/// longer one on writes to registration directories
struct SlowStore {
    inner: MemoryStore,
    delay: Duration,
    registration_write_delay: Duration,
}

impl SlowStore {
    fn shared() -> Arc<dyn SharedStore> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            delay: Duration::from_millis(5),
            registration_write_delay: Duration::from_millis(100),
        })
    }

    async fn round_trip(&self) {
        tokio::time::sleep(self.delay).await;
    }
}

#[async_trait]
impl SharedStore for SlowStore {
    async fn exists(&self, key: &str) -> a3s_wamp::Result<bool> {
        self.round_trip().await;
        self.inner.exists(key).await
    }

    async fn delete(&self, key: &str) -> a3s_wamp::Result<bool> {
        self.round_trip().await;
        self.inner.delete(key).await
    }

    async fn keys(&self, pattern: &str) -> a3s_wamp::Result<Vec<String>> {
        self.round_trip().await;
        self.inner.keys(pattern).await
    }

    async fn hset(&self, key: &str, field: &str, value: &Value) -> a3s_wamp::Result<()> {
        self.round_trip().await;
        if key.ends_with(":regs") {
            tokio::time::sleep(self.registration_write_delay).await;
        }
        self.inner.hset(key, field, value).await
    }

    async fn hset_all(&self, key: &str, fields: &[(String, Value)]) -> a3s_wamp::Result<()> {
        self.round_trip().await;
        self.inner.hset_all(key, fields).await
    }

    async fn hget(&self, key: &str, field: &str) -> a3s_wamp::Result<Option<Value>> {
        self.round_trip().await;
        self.inner.hget(key, field).await
    }

    async fn hgetall(&self, key: &str) -> a3s_wamp::Result<Vec<(String, Value)>> {
        self.round_trip().await;
        self.inner.hgetall(key).await
    }

    async fn hkeys(&self, key: &str) -> a3s_wamp::Result<Vec<String>> {
        self.round_trip().await;
        self.inner.hkeys(key).await
    }

    async fn hlen(&self, key: &str) -> a3s_wamp::Result<usize> {
        self.round_trip().await;
        self.inner.hlen(key).await
    }

    async fn hdel(&self, key: &str, field: &str) -> a3s_wamp::Result<bool> {
        self.round_trip().await;
        self.inner.hdel(key, field).await
    }

    async fn hincr(&self, key: &str, field: &str, by: i64) -> a3s_wamp::Result<i64> {
        self.round_trip().await;
        self.inner.hincr(key, field, by).await
    }

    async fn hcompare_and_set(
        &self,
        key: &str,
        field: &str,
        expected: &Value,
        new: &Value,
    ) -> a3s_wamp::Result<bool> {
        self.round_trip().await;
        self.inner.hcompare_and_set(key, field, expected, new).await
    }

    async fn sadd(&self, key: &str, member: &str) -> a3s_wamp::Result<bool> {
        self.round_trip().await;
        self.inner.sadd(key, member).await
    }

    async fn smembers(&self, key: &str) -> a3s_wamp::Result<Vec<String>> {
        self.round_trip().await;
        self.inner.smembers(key).await
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> a3s_wamp::Result<bool> {
        self.round_trip().await;
        self.inner.try_lock(key, token, ttl).await
    }

    async fn unlock(&self, key: &str, token: &str) -> a3s_wamp::Result<bool> {
        self.round_trip().await;
        self.inner.unlock(key, token).await
    }

    async fn publish(&self, channel: &str, payload: &Value) -> a3s_wamp::Result<()> {
        self.round_trip().await;
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> a3s_wamp::Result<BoxStream<'static, Value>> {
        self.inner.subscribe(channel).await
    }

    fn name(&self) -> &str {
        "slow-memory"
    }
}

/// A connected client
struct Peer {
    manager: Arc<RealmManager>,
    session: Arc<Session>,
    inbox: mpsc::UnboundedReceiver<Message>,
    answers_pings: Arc<AtomicBool>,
}

impl Peer {
    /// Connect and join `realm1`, advertising `roles`
    async fn join(manager: &Arc<RealmManager>, roles: Value) -> Self {
        let (transport, mut outbound) = ChannelTransport::new();
        let session = manager.open_session(transport.clone()).await.unwrap();
        let (tx, inbox) = mpsc::unbounded_channel();
        let answers_pings = Arc::new(AtomicBool::new(true));

        let pong = Arc::clone(&answers_pings);
        tokio::spawn(async move {
            while let Some(item) = outbound.recv().await {
                match item {
                    Outbound::Message(message) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Outbound::Ping(seq) => {
                        if pong.load(Ordering::SeqCst) {
                            transport.on_pong(seq).await;
                        }
                    }
                    Outbound::Close => break,
                }
            }
        });

        let mut peer = Self {
            manager: Arc::clone(manager),
            session,
            inbox,
            answers_pings,
        };
        peer.send(Message::Hello {
            realm: "realm1".to_string(),
            details: dict(json!({ "roles": roles })),
        })
        .await;
        match peer.recv().await {
            Message::Welcome { session, .. } => assert_eq!(session, peer.id()),
            other => panic!("expected WELCOME, got {:?}", other),
        }
        peer
    }

    fn id(&self) -> Id {
        self.session.id()
    }

    fn stop_answering_pings(&self) {
        self.answers_pings.store(false, Ordering::SeqCst);
    }

    async fn send(&self, message: Message) {
        self.manager.dispatch(&self.session, message).await.unwrap();
    }

    async fn recv(&mut self) -> Message {
        timeout(RECV_TIMEOUT, self.inbox.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("connection closed")
    }

    /// Nothing arrives for a short while
    async fn assert_silent(&mut self) {
        if let Ok(Some(message)) = timeout(SILENCE, self.inbox.recv()).await {
            panic!("unexpected message {:?}", message);
        }
    }

    /// The router closed the connection
    async fn assert_closed(&mut self) {
        loop {
            match timeout(RECV_TIMEOUT, self.inbox.recv()).await {
                Ok(None) => return,
                Ok(Some(_)) => continue,
                Err(_) => panic!("connection was not closed"),
            }
        }
    }

    async fn register(&mut self, request: Id, procedure: &str, options: Value) -> Message {
        self.send(Message::Register {
            request,
            options: dict(options),
            procedure: procedure.to_string(),
        })
        .await;
        self.recv().await
    }

    async fn register_ok(&mut self, request: Id, procedure: &str, options: Value) -> Id {
        match self.register(request, procedure, options).await {
            Message::Registered { registration, .. } => registration,
            other => panic!("expected REGISTERED, got {:?}", other),
        }
    }

    async fn subscribe(&mut self, request: Id, topic: &str) -> Id {
        self.send(Message::Subscribe {
            request,
            options: Dict::new(),
            topic: topic.to_string(),
        })
        .await;
        match self.recv().await {
            Message::Subscribed { subscription, .. } => subscription,
            other => panic!("expected SUBSCRIBED, got {:?}", other),
        }
    }

    async fn call(&self, request: Id, procedure: &str, options: Value, args: Vec<Value>) {
        self.send(Message::Call {
            request,
            options: dict(options),
            procedure: procedure.to_string(),
            args,
            kwargs: Dict::new(),
        })
        .await;
    }

    /// Next INVOCATION: (invocation id, details, args)
    async fn invocation(&mut self) -> (Id, Dict, Vec<Value>) {
        match self.recv().await {
            Message::Invocation {
                request,
                details,
                args,
                ..
            } => (request, details, args),
            other => panic!("expected INVOCATION, got {:?}", other),
        }
    }

    async fn yield_result(&self, invocation: Id, options: Value, args: Vec<Value>) {
        self.send(Message::Yield {
            request: invocation,
            options: dict(options),
            args,
            kwargs: Dict::new(),
        })
        .await;
    }

    async fn cancel(&self, request: Id, mode: &str) {
        self.send(Message::Cancel {
            request,
            options: dict(json!({ "mode": mode })),
        })
        .await;
    }
}

fn sum(args: &[Value]) -> i64 {
    args.iter().filter_map(Value::as_i64).sum()
}

async fn invocation_keys(store: &Arc<dyn SharedStore>) -> Vec<String> {
    store.keys("invoc:*").await.unwrap()
}

// ─── Session Lifecycle ───────────────────────────────────────────

#[tokio::test]
async fn test_welcome_advertises_roles() {
    let store = memory_store();
    let manager = worker(&store, "w1").await;
    let (transport, mut outbound) = ChannelTransport::new();
    let session = manager.open_session(transport).await.unwrap();

    manager
        .dispatch(
            &session,
            Message::Hello {
                realm: "realm1".to_string(),
                details: Dict::new(),
            },
        )
        .await
        .unwrap();

    match outbound.recv().await {
        Some(Outbound::Message(Message::Welcome { details, .. })) => {
            assert_eq!(details["authrole"], "anonymous");
            assert_eq!(
                details["roles"]["broker"]["features"]["publisher_exclusion"],
                json!(true)
            );
            assert_eq!(
                details["roles"]["dealer"]["features"]["progressive_call_results"],
                json!(true)
            );
        }
        other => panic!("expected WELCOME, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_realm_aborts_and_closes() {
    let store = memory_store();
    let manager = worker(&store, "w1").await;
    let (transport, mut outbound) = ChannelTransport::new();
    let session = manager.open_session(transport).await.unwrap();

    manager
        .dispatch(
            &session,
            Message::Hello {
                realm: "missing".to_string(),
                details: Dict::new(),
            },
        )
        .await
        .unwrap();

    match outbound.recv().await {
        Some(Outbound::Message(Message::Abort { reason, .. })) => {
            assert_eq!(reason, uri::NO_SUCH_REALM)
        }
        other => panic!("expected ABORT, got {:?}", other),
    }
    assert_eq!(outbound.recv().await, Some(Outbound::Close));
}

#[tokio::test]
async fn test_goodbye_is_answered_and_session_removed() {
    let store = memory_store();
    let manager = worker(&store, "w1").await;
    let mut peer = Peer::join(&manager, json!({})).await;
    let record = keys::session(peer.id(), peer.session.transport_id());
    assert!(store.exists(&record).await.unwrap());

    peer.send(Message::Goodbye {
        details: Dict::new(),
        reason: "wamp.close.system_shutdown".to_string(),
    })
    .await;
    match peer.recv().await {
        Message::Goodbye { reason, .. } => assert_eq!(reason, uri::GOODBYE_AND_OUT),
        other => panic!("expected GOODBYE, got {:?}", other),
    }
    peer.assert_closed().await;
    assert!(!store.exists(&record).await.unwrap());
}

#[tokio::test]
async fn test_join_and_leave_meta_events() {
    let store = memory_store();
    let manager = worker(&store, "w1").await;
    let mut watcher = Peer::join(&manager, json!({})).await;
    let on_join = watcher.subscribe(1, uri::SESSION_ON_JOIN).await;
    let on_leave = watcher.subscribe(2, uri::SESSION_ON_LEAVE).await;

    let visitor = Peer::join(&manager, json!({})).await;
    match watcher.recv().await {
        Message::Event {
            subscription, args, ..
        } => {
            assert_eq!(subscription, on_join);
            assert_eq!(args[0]["session"], json!(visitor.id()));
        }
        other => panic!("expected EVENT, got {:?}", other),
    }

    manager
        .close_session(visitor.session.transport_id())
        .await
        .unwrap();
    match watcher.recv().await {
        Message::Event { subscription, .. } => assert_eq!(subscription, on_leave),
        other => panic!("expected EVENT, got {:?}", other),
    }
}

// ─── Publish & Subscribe ─────────────────────────────────────────

#[tokio::test]
async fn test_publish_reaches_subscriber() {
    let store = memory_store();
    let manager = worker(&store, "w1").await;
    let mut subscriber = Peer::join(&manager, json!({})).await;
    let mut publisher = Peer::join(&manager, json!({})).await;
    let subscription = subscriber.subscribe(1, "chat.room1").await;

    publisher
        .send(Message::Publish {
            request: 7,
            options: dict(json!({"acknowledge": true})),
            topic: "chat.room1".to_string(),
            args: vec![json!("hello")],
            kwargs: Dict::new(),
        })
        .await;

    let publication = match publisher.recv().await {
        Message::Published { request, publication } => {
            assert_eq!(request, 7);
            publication
        }
        other => panic!("expected PUBLISHED, got {:?}", other),
    };
    match subscriber.recv().await {
        Message::Event {
            subscription: sub,
            publication: publ,
            args,
            details,
            ..
        } => {
            assert_eq!(sub, subscription);
            assert_eq!(publ, publication);
            assert_eq!(args, vec![json!("hello")]);
            assert!(details.get("publisher").is_none());
        }
        other => panic!("expected EVENT, got {:?}", other),
    }
}

#[tokio::test]
async fn test_publisher_excluded_unless_asked() {
    let store = memory_store();
    let manager = worker(&store, "w1").await;
    let mut peer = Peer::join(&manager, json!({})).await;
    peer.subscribe(1, "chat.room1").await;

    peer.send(Message::Publish {
        request: 2,
        options: Dict::new(),
        topic: "chat.room1".to_string(),
        args: vec![json!("echo?")],
        kwargs: Dict::new(),
    })
    .await;
    peer.assert_silent().await;

    peer.send(Message::Publish {
        request: 3,
        options: dict(json!({"exclude_me": false, "disclose_me": true})),
        topic: "chat.room1".to_string(),
        args: vec![json!("echo!")],
        kwargs: Dict::new(),
    })
    .await;
    match peer.recv().await {
        Message::Event { details, args, .. } => {
            assert_eq!(details["publisher"], json!(peer.id()));
            assert_eq!(args, vec![json!("echo!")]);
        }
        other => panic!("expected EVENT, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unsubscribe_leaves_no_residue() {
    let store = memory_store();
    let manager = worker(&store, "w1").await;
    let mut peer = Peer::join(&manager, json!({})).await;
    let subscription = peer.subscribe(1, "chat.room1").await;
    assert_eq!(store.hlen(&keys::subscriptions("chat.room1")).await.unwrap(), 1);

    peer.send(Message::Unsubscribe {
        request: 2,
        subscription,
    })
    .await;
    assert_eq!(peer.recv().await, Message::Unsubscribed { request: 2 });
    assert!(!store
        .exists(&keys::subscriptions("chat.room1"))
        .await
        .unwrap());

    peer.send(Message::Unsubscribe {
        request: 3,
        subscription,
    })
    .await;
    match peer.recv().await {
        Message::Error { error, request, .. } => {
            assert_eq!(request, 3);
            assert_eq!(error, uri::NO_SUCH_SUBSCRIPTION);
        }
        other => panic!("expected ERROR, got {:?}", other),
    }
}

#[tokio::test]
async fn test_invalid_topic_rejected() {
    let store = memory_store();
    let manager = worker(&store, "w1").await;
    let mut peer = Peer::join(&manager, json!({})).await;

    peer.send(Message::Publish {
        request: 4,
        options: Dict::new(),
        topic: "bad..topic".to_string(),
        args: Vec::new(),
        kwargs: Dict::new(),
    })
    .await;
    match peer.recv().await {
        Message::Error {
            request_type,
            error,
            ..
        } => {
            assert_eq!(request_type, MessageKind::Publish);
            assert_eq!(error, uri::INVALID_URI);
        }
        other => panic!("expected ERROR, got {:?}", other),
    }
}

// ─── Routed Calls ────────────────────────────────────────────────

#[tokio::test]
async fn test_call_and_yield() {
    let store = memory_store();
    let manager = worker(&store, "w1").await;
    let mut callee = Peer::join(&manager, json!({})).await;
    let mut caller = Peer::join(&manager, json!({})).await;
    let registration = callee.register_ok(1, "math.add", json!({})).await;

    caller.call(10, "math.add", json!({}), vec![json!(2), json!(3)]).await;
    let (invocation, details, args) = callee.invocation().await;
    assert!(details.get("caller").is_none());
    assert_eq!(invocation_keys(&store).await.len(), 1);

    callee
        .yield_result(invocation, json!({}), vec![json!(sum(&args))])
        .await;
    match caller.recv().await {
        Message::Result { request, args, .. } => {
            assert_eq!(request, 10);
            assert_eq!(args, vec![json!(5)]);
        }
        other => panic!("expected RESULT, got {:?}", other),
    }
    assert!(invocation_keys(&store).await.is_empty());
    assert_eq!(caller.session.pending_calls(), 0);

    let field = keys::registration_field(callee.session.transport_id(), registration);
    assert!(store
        .hget(&keys::registrations("math.add"), &field)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_call_without_registration() {
    let store = memory_store();
    let manager = worker(&store, "w1").await;
    let mut caller = Peer::join(&manager, json!({})).await;

    caller.call(3, "math.missing", json!({}), Vec::new()).await;
    match caller.recv().await {
        Message::Error {
            request_type,
            request,
            error,
            ..
        } => {
            assert_eq!(request_type, MessageKind::Call);
            assert_eq!(request, 3);
            assert_eq!(error, uri::NO_SUCH_PROCEDURE);
        }
        other => panic!("expected ERROR, got {:?}", other),
    }
}

#[tokio::test]
async fn test_disclose_caller() {
    let store = memory_store();
    let manager = worker(&store, "w1").await;
    let mut callee = Peer::join(&manager, json!({})).await;
    let caller = Peer::join(&manager, json!({})).await;
    callee
        .register_ok(1, "whoami", json!({"disclose_caller": true}))
        .await;

    caller.call(2, "whoami", json!({}), Vec::new()).await;
    let (_, details, _) = callee.invocation().await;
    assert_eq!(details["caller"], json!(caller.id()));
    assert_eq!(details["authid"], json!("anonymous"));
}

#[tokio::test]
async fn test_callee_error_forwarded_to_caller() {
    let store = memory_store();
    let manager = worker(&store, "w1").await;
    let mut callee = Peer::join(&manager, json!({})).await;
    let mut caller = Peer::join(&manager, json!({})).await;
    callee.register_ok(1, "math.div", json!({})).await;

    caller
        .call(5, "math.div", json!({}), vec![json!(1), json!(0)])
        .await;
    let (invocation, _, _) = callee.invocation().await;
    callee
        .send(Message::Error {
            request_type: MessageKind::Invocation,
            request: invocation,
            details: Dict::new(),
            error: "app.error.division_by_zero".to_string(),
            args: vec![json!("nope")],
            kwargs: Dict::new(),
        })
        .await;

    match caller.recv().await {
        Message::Error {
            request_type,
            request,
            error,
            args,
            ..
        } => {
            assert_eq!(request_type, MessageKind::Call);
            assert_eq!(request, 5);
            assert_eq!(error, "app.error.division_by_zero");
            assert_eq!(args, vec![json!("nope")]);
        }
        other => panic!("expected ERROR, got {:?}", other),
    }
    assert!(invocation_keys(&store).await.is_empty());
}

#[tokio::test]
async fn test_second_yield_rejected() {
    let store = memory_store();
    let manager = worker(&store, "w1").await;
    let mut callee = Peer::join(&manager, json!({})).await;
    let mut caller = Peer::join(&manager, json!({})).await;
    callee.register_ok(1, "math.add", json!({})).await;

    caller.call(1, "math.add", json!({}), vec![json!(1)]).await;
    let (invocation, _, _) = callee.invocation().await;
    callee.yield_result(invocation, json!({}), vec![json!(1)]).await;
    caller.recv().await;

    callee.yield_result(invocation, json!({}), vec![json!(1)]).await;
    match callee.recv().await {
        Message::Error {
            request_type,
            error,
            ..
        } => {
            assert_eq!(request_type, MessageKind::Yield);
            assert_eq!(error, uri::UNKNOWN);
        }
        other => panic!("expected ERROR, got {:?}", other),
    }
    caller.assert_silent().await;
}

// ─── Registration Policies ───────────────────────────────────────

#[tokio::test]
async fn test_single_registration_is_exclusive() {
    let store = memory_store();
    let manager = worker(&store, "w1").await;
    let mut first = Peer::join(&manager, json!({})).await;
    let mut second = Peer::join(&manager, json!({})).await;
    first.register_ok(1, "math.add", json!({})).await;

    match second.register(1, "math.add", json!({})).await {
        Message::Error { error, .. } => assert_eq!(error, uri::PROCEDURE_ALREADY_EXISTS),
        other => panic!("expected ERROR, got {:?}", other),
    }
    first.assert_silent().await;
}

#[tokio::test]
async fn test_unresponsive_holder_is_replaced() {
    let store = memory_store();
    let manager = worker(&store, "w1").await;
    let mut stale = Peer::join(&manager, json!({})).await;
    let mut fresh = Peer::join(&manager, json!({})).await;
    let mut caller = Peer::join(&manager, json!({})).await;
    stale.register_ok(1, "math.add", json!({})).await;
    stale.stop_answering_pings();

    let replacement = fresh.register_ok(1, "math.add", json!({})).await;
    stale.assert_closed().await;

    let records = a3s_wamp::dealer::live_registrations(manager.context(), "math.add", "realm1")
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, replacement);

    caller.call(2, "math.add", json!({}), vec![json!(4), json!(4)]).await;
    let (invocation, _, args) = fresh.invocation().await;
    fresh
        .yield_result(invocation, json!({}), vec![json!(sum(&args))])
        .await;
    match caller.recv().await {
        Message::Result { args, .. } => assert_eq!(args, vec![json!(8)]),
        other => panic!("expected RESULT, got {:?}", other),
    }
}

#[tokio::test]
async fn test_mismatched_policy_rejected() {
    let store = memory_store();
    let manager = worker(&store, "w1").await;
    let mut first = Peer::join(&manager, json!({})).await;
    let mut second = Peer::join(&manager, json!({})).await;
    first
        .register_ok(1, "work.run", json!({"invoke": "roundrobin"}))
        .await;

    match second.register(1, "work.run", json!({"invoke": "first"})).await {
        Message::Error { error, args, .. } => {
            assert_eq!(error, uri::PROCEDURE_ALREADY_EXISTS);
            assert!(args[0].as_str().unwrap().contains("roundrobin"));
        }
        other => panic!("expected ERROR, got {:?}", other),
    }
}

#[tokio::test]
async fn test_round_robin_rotates() {
    let store = memory_store();
    let manager = worker(&store, "w1").await;
    let mut a = Peer::join(&manager, json!({})).await;
    let mut b = Peer::join(&manager, json!({})).await;
    let mut caller = Peer::join(&manager, json!({})).await;
    let options = json!({"invoke": "roundrobin"});
    a.register_ok(1, "work.run", options.clone()).await;
    b.register_ok(1, "work.run", options).await;

    for (request, expect_a) in [(1, true), (2, false), (3, true), (4, false)] {
        caller.call(request, "work.run", json!({}), Vec::new()).await;
        let worker = if expect_a { &mut a } else { &mut b };
        let (invocation, _, _) = worker.invocation().await;
        worker.yield_result(invocation, json!({}), Vec::new()).await;
        match caller.recv().await {
            Message::Result { request: r, .. } => assert_eq!(r, request),
            other => panic!("expected RESULT, got {:?}", other),
        }
    }
    a.assert_silent().await;
    b.assert_silent().await;
}

#[tokio::test]
async fn test_unregister_cancels_outstanding_calls() {
    let store = memory_store();
    let manager = worker(&store, "w1").await;
    let mut callee = Peer::join(&manager, json!({})).await;
    let mut caller = Peer::join(&manager, json!({})).await;
    let registration = callee.register_ok(1, "slow.op", json!({})).await;

    caller.call(9, "slow.op", json!({}), Vec::new()).await;
    callee.invocation().await;

    callee
        .send(Message::Unregister {
            request: 2,
            registration,
        })
        .await;
    assert_eq!(callee.recv().await, Message::Unregistered { request: 2 });
    match caller.recv().await {
        Message::Error { request, error, .. } => {
            assert_eq!(request, 9);
            assert_eq!(error, uri::CANCELLED);
        }
        other => panic!("expected ERROR, got {:?}", other),
    }
    assert!(!store.exists(&keys::procedure("slow.op")).await.unwrap());
}

#[tokio::test]
async fn test_callee_leaving_frees_procedure() {
    let store = memory_store();
    let manager = worker(&store, "w1").await;
    let mut callee = Peer::join(&manager, json!({})).await;
    let mut next = Peer::join(&manager, json!({})).await;
    callee.register_ok(1, "math.add", json!({})).await;

    manager
        .close_session(callee.session.transport_id())
        .await
        .unwrap();
    assert!(!store.exists(&keys::registrations("math.add")).await.unwrap());
    next.register_ok(1, "math.add", json!({})).await;
}

// ─── Progress & Cancellation ─────────────────────────────────────

#[tokio::test]
async fn test_progressive_results() {
    let store = memory_store();
    let manager = worker(&store, "w1").await;
    let mut callee = Peer::join(&manager, json!({})).await;
    let mut caller = Peer::join(&manager, json!({})).await;
    callee.register_ok(1, "feed.read", json!({})).await;

    caller
        .call(4, "feed.read", json!({"receive_progress": true}), Vec::new())
        .await;
    let (invocation, details, _) = callee.invocation().await;
    assert_eq!(details["receive_progress"], json!(true));

    callee
        .yield_result(invocation, json!({"progress": true}), vec![json!("chunk")])
        .await;
    match caller.recv().await {
        Message::Result { details, args, .. } => {
            assert_eq!(details["progress"], json!(true));
            assert_eq!(args, vec![json!("chunk")]);
        }
        other => panic!("expected RESULT, got {:?}", other),
    }

    callee
        .yield_result(invocation, json!({}), vec![json!("done")])
        .await;
    match caller.recv().await {
        Message::Result { details, args, .. } => {
            assert!(details.get("progress").is_none());
            assert_eq!(args, vec![json!("done")]);
        }
        other => panic!("expected RESULT, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unrequested_progress_dropped() {
    let store = memory_store();
    let manager = worker(&store, "w1").await;
    let mut callee = Peer::join(&manager, json!({})).await;
    let mut caller = Peer::join(&manager, json!({})).await;
    callee.register_ok(1, "feed.read", json!({})).await;

    caller.call(4, "feed.read", json!({}), Vec::new()).await;
    let (invocation, _, _) = callee.invocation().await;
    callee
        .yield_result(invocation, json!({"progress": true}), vec![json!("chunk")])
        .await;
    caller.assert_silent().await;

    callee
        .yield_result(invocation, json!({}), vec![json!("done")])
        .await;
    match caller.recv().await {
        Message::Result { args, .. } => assert_eq!(args, vec![json!("done")]),
        other => panic!("expected RESULT, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cancel_without_callee_support() {
    let store = memory_store();
    let manager = worker(&store, "w1").await;
    let mut callee = Peer::join(&manager, json!({})).await;
    let mut caller = Peer::join(&manager, json!({})).await;
    callee.register_ok(1, "slow.op", json!({})).await;

    caller.call(6, "slow.op", json!({}), Vec::new()).await;
    let (invocation, _, _) = callee.invocation().await;
    caller.cancel(6, "kill").await;
    match caller.recv().await {
        Message::Error {
            request_type,
            error,
            ..
        } => {
            assert_eq!(request_type, MessageKind::Cancel);
            assert_eq!(error, uri::NOT_SUPPORTED);
        }
        other => panic!("expected ERROR, got {:?}", other),
    }
    callee.assert_silent().await;

    callee.yield_result(invocation, json!({}), vec![json!(1)]).await;
    assert!(matches!(caller.recv().await, Message::Result { request: 6, .. }));
}

#[tokio::test]
async fn test_cancel_kill_waits_for_callee() {
    let store = memory_store();
    let manager = worker(&store, "w1").await;
    let mut callee = Peer::join(&manager, canceling_callee()).await;
    let mut caller = Peer::join(&manager, json!({})).await;
    callee.register_ok(1, "slow.op", json!({})).await;

    caller.call(6, "slow.op", json!({}), Vec::new()).await;
    let (invocation, _, _) = callee.invocation().await;
    caller.cancel(6, "kill").await;
    match callee.recv().await {
        Message::Interrupt { request, options } => {
            assert_eq!(request, invocation);
            assert_eq!(options["mode"], "kill");
        }
        other => panic!("expected INTERRUPT, got {:?}", other),
    }
    caller.assert_silent().await;

    callee
        .send(Message::Error {
            request_type: MessageKind::Invocation,
            request: invocation,
            details: Dict::new(),
            error: uri::CANCELED.to_string(),
            args: Vec::new(),
            kwargs: Dict::new(),
        })
        .await;
    match caller.recv().await {
        Message::Error { request, error, .. } => {
            assert_eq!(request, 6);
            assert_eq!(error, uri::CANCELED);
        }
        other => panic!("expected ERROR, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cancel_killnowait_answers_immediately() {
    let store = memory_store();
    let manager = worker(&store, "w1").await;
    let mut callee = Peer::join(&manager, canceling_callee()).await;
    let mut caller = Peer::join(&manager, json!({})).await;
    callee.register_ok(1, "slow.op", json!({})).await;

    caller.call(8, "slow.op", json!({}), Vec::new()).await;
    let (invocation, _, _) = callee.invocation().await;
    caller.cancel(8, "killnowait").await;

    match callee.recv().await {
        Message::Interrupt { options, .. } => assert_eq!(options["mode"], "killnowait"),
        other => panic!("expected INTERRUPT, got {:?}", other),
    }
    match caller.recv().await {
        Message::Error {
            request_type,
            request,
            error,
            ..
        } => {
            assert_eq!(request_type, MessageKind::Call);
            assert_eq!(request, 8);
            assert_eq!(error, uri::CANCELED);
        }
        other => panic!("expected ERROR, got {:?}", other),
    }
    assert!(invocation_keys(&store).await.is_empty());

    callee.yield_result(invocation, json!({}), Vec::new()).await;
    match callee.recv().await {
        Message::Error { error, .. } => assert_eq!(error, uri::UNKNOWN),
        other => panic!("expected ERROR, got {:?}", other),
    }
    caller.assert_silent().await;
}

#[tokio::test]
async fn test_cancel_skip_answers_without_interrupt() {
    let store = memory_store();
    let manager = worker(&store, "w1").await;
    let mut callee = Peer::join(&manager, canceling_callee()).await;
    let mut caller = Peer::join(&manager, json!({})).await;
    callee.register_ok(1, "slow.op", json!({})).await;

    caller.call(3, "slow.op", json!({}), Vec::new()).await;
    callee.invocation().await;
    caller.cancel(3, "skip").await;
    match caller.recv().await {
        Message::Error { error, .. } => assert_eq!(error, uri::CANCELED),
        other => panic!("expected ERROR, got {:?}", other),
    }
    callee.assert_silent().await;
}

#[tokio::test]
async fn test_caller_leaving_interrupts_callee() {
    let store = memory_store();
    let manager = worker(&store, "w1").await;
    let mut callee = Peer::join(&manager, canceling_callee()).await;
    let caller = Peer::join(&manager, json!({})).await;
    callee.register_ok(1, "slow.op", json!({})).await;

    caller.call(1, "slow.op", json!({}), Vec::new()).await;
    let (invocation, _, _) = callee.invocation().await;
    manager
        .close_session(caller.session.transport_id())
        .await
        .unwrap();

    match callee.recv().await {
        Message::Interrupt { request, options } => {
            assert_eq!(request, invocation);
            assert_eq!(options["mode"], "killnowait");
        }
        other => panic!("expected INTERRUPT, got {:?}", other),
    }
    assert!(invocation_keys(&store).await.is_empty());
}

// ─── Cluster ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_call_across_workers() {
    let store = memory_store();
    let w1 = worker(&store, "w1").await;
    let w2 = worker(&store, "w2").await;
    let mut callee = Peer::join(&w1, json!({})).await;
    let mut caller = Peer::join(&w2, json!({})).await;
    callee.register_ok(1, "math.add", json!({})).await;

    caller
        .call(11, "math.add", json!({}), vec![json!(20), json!(22)])
        .await;
    let (invocation, _, args) = callee.invocation().await;
    callee
        .yield_result(invocation, json!({}), vec![json!(sum(&args))])
        .await;
    match caller.recv().await {
        Message::Result { request, args, .. } => {
            assert_eq!(request, 11);
            assert_eq!(args, vec![json!(42)]);
        }
        other => panic!("expected RESULT, got {:?}", other),
    }
}

#[tokio::test]
async fn test_publish_across_workers() {
    let store = memory_store();
    let w1 = worker(&store, "w1").await;
    let w2 = worker(&store, "w2").await;
    let mut subscriber = Peer::join(&w1, json!({})).await;
    let publisher = Peer::join(&w2, json!({})).await;
    let subscription = subscriber.subscribe(1, "chat.room1").await;

    publisher
        .send(Message::Publish {
            request: 1,
            options: Dict::new(),
            topic: "chat.room1".to_string(),
            args: vec![json!("from w2")],
            kwargs: Dict::new(),
        })
        .await;
    match subscriber.recv().await {
        Message::Event {
            subscription: sub,
            args,
            ..
        } => {
            assert_eq!(sub, subscription);
            assert_eq!(args, vec![json!("from w2")]);
        }
        other => panic!("expected EVENT, got {:?}", other),
    }
}

#[tokio::test]
async fn test_single_registration_exclusive_across_workers() {
    let store = memory_store();
    let w1 = worker(&store, "w1").await;
    let w2 = worker(&store, "w2").await;
    let mut first = Peer::join(&w1, json!({})).await;
    let mut second = Peer::join(&w2, json!({})).await;
    first.register_ok(1, "math.add", json!({})).await;

    match second.register(1, "math.add", json!({})).await {
        Message::Error { error, .. } => assert_eq!(error, uri::PROCEDURE_ALREADY_EXISTS),
        other => panic!("expected ERROR, got {:?}", other),
    }
}

#[tokio::test]
async fn test_new_worker_routes_existing_registrations() {
    let store = memory_store();
    let w1 = worker(&store, "w1").await;
    let mut a = Peer::join(&w1, json!({})).await;
    let mut b = Peer::join(&w1, json!({})).await;
    let options = json!({"invoke": "roundrobin"});
    a.register_ok(1, "work.run", options.clone()).await;
    b.register_ok(1, "work.run", options).await;

    // a worker started afterwards knows nothing locally
    let w3 = worker(&store, "w3").await;
    let mut caller = Peer::join(&w3, json!({})).await;
    for request in 1..=2 {
        caller.call(request, "work.run", json!({}), Vec::new()).await;
    }
    let (first, _, _) = a.invocation().await;
    let (second, _, _) = b.invocation().await;
    a.yield_result(first, json!({}), Vec::new()).await;
    b.yield_result(second, json!({}), Vec::new()).await;
    assert!(matches!(caller.recv().await, Message::Result { .. }));
    assert!(matches!(caller.recv().await, Message::Result { .. }));
}

#[tokio::test]
async fn test_concurrent_single_registrations_across_workers() {
    let store = SlowStore::shared();
    let w1 = worker(&store, "w1").await;
    let w2 = worker(&store, "w2").await;
    let mut a = Peer::join(&w1, json!({})).await;
    let mut b = Peer::join(&w2, json!({})).await;

    let (first, second) = tokio::join!(
        a.register(1, "svc.run", json!({})),
        b.register(1, "svc.run", json!({}))
    );
    let registered = [&first, &second]
        .iter()
        .filter(|reply| matches!(reply, Message::Registered { .. }))
        .count();
    assert_eq!(registered, 1, "replies: {:?} / {:?}", first, second);
    for reply in [&first, &second] {
        if let Message::Error { error, .. } = reply {
            assert_eq!(error, uri::PROCEDURE_ALREADY_EXISTS);
        }
    }
    assert_eq!(store.hlen(&keys::registrations("svc.run")).await.unwrap(), 1);
}

#[tokio::test]
async fn test_concurrent_conflicting_policies_across_workers() {
    let store = SlowStore::shared();
    let w1 = worker(&store, "w1").await;
    let w2 = worker(&store, "w2").await;
    let mut a = Peer::join(&w1, json!({})).await;
    let mut b = Peer::join(&w2, json!({})).await;

    let (first, second) = tokio::join!(
        a.register(1, "svc.run", json!({"invoke": "first"})),
        b.register(1, "svc.run", json!({"invoke": "last"}))
    );
    let (winner, loser) = match (&first, &second) {
        (Message::Registered { .. }, Message::Error { args, .. }) => ("first", args),
        (Message::Error { args, .. }, Message::Registered { .. }) => ("last", args),
        other => panic!("expected one REGISTERED and one ERROR, got {:?}", other),
    };
    assert!(loser[0].as_str().unwrap().contains(winner));
    assert_eq!(store.hlen(&keys::registrations("svc.run")).await.unwrap(), 1);
    assert_eq!(
        store
            .hget(&keys::procedure("svc.run"), "invokeType")
            .await
            .unwrap(),
        Some(json!(winner))
    );
}

#[tokio::test]
async fn test_round_robin_with_concurrent_callers_across_workers() {
    let store = memory_store();
    let w1 = worker(&store, "w1").await;
    let w2 = worker(&store, "w2").await;
    let mut a = Peer::join(&w1, json!({})).await;
    let mut b = Peer::join(&w2, json!({})).await;
    let options = json!({"invoke": "roundrobin"});
    a.register_ok(1, "work.run", options.clone()).await;
    b.register_ok(1, "work.run", options).await;

    let mut c1 = Peer::join(&w1, json!({})).await;
    let mut c2 = Peer::join(&w2, json!({})).await;
    for round in 0..3 {
        let request = 10 + round;
        tokio::join!(
            c1.call(request, "work.run", json!({}), Vec::new()),
            c2.call(request, "work.run", json!({}), Vec::new())
        );
        // each registration is visited exactly once per round
        let (on_a, _, _) = a.invocation().await;
        let (on_b, _, _) = b.invocation().await;
        a.assert_silent().await;
        b.assert_silent().await;
        a.yield_result(on_a, json!({}), Vec::new()).await;
        b.yield_result(on_b, json!({}), Vec::new()).await;
        for caller in [&mut c1, &mut c2] {
            match caller.recv().await {
                Message::Result { request: r, .. } => assert_eq!(r, request),
                other => panic!("expected RESULT, got {:?}", other),
            }
        }
    }
}
