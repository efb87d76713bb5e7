//! Server-side fanout integration tests.
//!
//! These exercise the registry, broker bridge and connection hub together
//! through the orchestrator, with a recording backend standing in for Redis
//! and mpsc receivers standing in for sockets.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use ripple_fanout::broker::{BrokerBackend, BrokerBridge, BrokerEvent};
use ripple_fanout::hub::{ConnectionHub, OutboundFrame};
use ripple_fanout::orchestrator::{spawn_fanout_router, SubscriptionOrchestrator};
use ripple_fanout::registry::ChannelRegistry;

/// Records every backend call for assertion; always succeeds.
#[derive(Default)]
struct RecordingBackend {
    calls: Mutex<Vec<String>>,
}

impl RecordingBackend {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl BrokerBackend for RecordingBackend {
    async fn subscribe(&self, channel: &str) -> anyhow::Result<()> {
        self.record(format!("subscribe:{channel}"));
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> anyhow::Result<()> {
        self.record(format!("psubscribe:{pattern}"));
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> anyhow::Result<()> {
        self.record(format!("unsubscribe:{channel}"));
        Ok(())
    }

    async fn punsubscribe(&self, pattern: &str) -> anyhow::Result<()> {
        self.record(format!("punsubscribe:{pattern}"));
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> anyhow::Result<()> {
        self.record(format!("publish:{channel}:{payload}"));
        Ok(())
    }
}

struct TestEnvironment {
    backend: Arc<RecordingBackend>,
    registry: Arc<ChannelRegistry>,
    hub: Arc<ConnectionHub>,
    orchestrator: SubscriptionOrchestrator,
    events_tx: mpsc::Sender<BrokerEvent>,
}

fn create_test_environment() -> TestEnvironment {
    let backend = Arc::new(RecordingBackend::default());
    let registry = Arc::new(ChannelRegistry::new());
    let hub = Arc::new(ConnectionHub::new());
    let bridge = Arc::new(BrokerBridge::new(backend.clone()));
    let orchestrator =
        SubscriptionOrchestrator::new(registry.clone(), bridge, hub.clone());

    let (events_tx, events_rx) = mpsc::channel(64);
    spawn_fanout_router(registry.clone(), hub.clone(), events_rx);

    TestEnvironment {
        backend,
        registry,
        hub,
        orchestrator,
        events_tx,
    }
}

/// Receive the next payload frame with a timeout.
async fn recv_payload(rx: &mut mpsc::Receiver<OutboundFrame>) -> serde_json::Value {
    match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
        Ok(Some(OutboundFrame::Payload(text))) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected payload frame, got {:?}", other),
    }
}

/// Assert nothing arrives within a short window.
async fn assert_silent(rx: &mut mpsc::Receiver<OutboundFrame>) {
    let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(result.is_err(), "expected no delivery, got {:?}", result);
}

#[tokio::test]
async fn registry_dedup_single_broker_subscribe() {
    let env = create_test_environment();

    for user in ["a", "b", "c", "d"] {
        env.orchestrator.join_conversation(user, "c1").await;
    }

    assert_eq!(env.backend.count("subscribe:conversation:c1:messages"), 1);
    assert_eq!(env.backend.count("subscribe:conversation:c1:typings"), 1);
}

#[tokio::test]
async fn registry_teardown_single_broker_unsubscribe() {
    let env = create_test_environment();

    for user in ["a", "b", "c"] {
        env.orchestrator.join_conversation(user, "c1").await;
    }
    env.orchestrator.leave_conversation("a", "c1").await;
    env.orchestrator.leave_conversation("b", "c1").await;
    assert_eq!(env.backend.count("unsubscribe:"), 0);

    env.orchestrator.leave_conversation("c", "c1").await;
    assert_eq!(env.backend.count("unsubscribe:conversation:c1:messages"), 1);
    assert_eq!(env.backend.count("unsubscribe:conversation:c1:typings"), 1);
}

#[tokio::test]
async fn on_connect_subscribes_personal_channels() {
    let env = create_test_environment();
    let (tx, _rx) = mpsc::channel(8);

    env.orchestrator.on_connect("u1", tx).await;

    assert_eq!(env.backend.count("subscribe:user:u1:messages"), 1);
    assert_eq!(env.backend.count("subscribe:user:u1:typings"), 1);
}

#[tokio::test]
async fn fanout_reaches_every_interested_user_exactly_once() {
    let env = create_test_environment();

    let mut receivers = Vec::new();
    for user in ["a", "b", "c"] {
        let (tx, rx) = mpsc::channel(8);
        env.orchestrator.on_connect(user, tx).await;
        env.orchestrator.join_conversation(user, "c1").await;
        receivers.push(rx);
    }
    // One connected user who never joined
    let (tx, mut outsider_rx) = mpsc::channel(8);
    env.orchestrator.on_connect("outsider", tx).await;

    let event = json!({"type": "chat_message", "data": {"conversationId": "c1", "content": "hi"}});
    env.events_tx
        .send(BrokerEvent {
            channel: "conversation:c1:messages".to_string(),
            payload: event.to_string(),
        })
        .await
        .unwrap();

    for rx in &mut receivers {
        let payload = recv_payload(rx).await;
        assert_eq!(payload, event, "payload must pass through unchanged");
        assert_silent(rx).await;
    }
    assert_silent(&mut outsider_rx).await;
}

#[tokio::test]
async fn join_publish_leave_scenario() {
    let env = create_test_environment();

    let (tx_a, mut rx_a) = mpsc::channel(8);
    let (tx_b, mut rx_b) = mpsc::channel(8);
    env.orchestrator.on_connect("A", tx_a).await;
    env.orchestrator.on_connect("B", tx_b).await;
    env.orchestrator.join_conversation("A", "c1").await;
    env.orchestrator.join_conversation("B", "c1").await;

    let event = json!({"type": "chat_message", "data": {"conversationId": "c1", "content": "hi"}});
    env.events_tx
        .send(BrokerEvent {
            channel: "conversation:c1:messages".to_string(),
            payload: event.to_string(),
        })
        .await
        .unwrap();

    assert_eq!(recv_payload(&mut rx_a).await, event);
    assert_eq!(recv_payload(&mut rx_b).await, event);

    env.orchestrator.leave_conversation("A", "c1").await;
    env.orchestrator.leave_conversation("B", "c1").await;

    env.events_tx
        .send(BrokerEvent {
            channel: "conversation:c1:messages".to_string(),
            payload: event.to_string(),
        })
        .await
        .unwrap();

    assert_silent(&mut rx_a).await;
    assert_silent(&mut rx_b).await;
}

#[tokio::test]
async fn rejoining_is_idempotent() {
    let env = create_test_environment();

    env.orchestrator.join_conversation("a", "c1").await;
    env.orchestrator.join_conversation("a", "c1").await;
    assert_eq!(env.backend.count("subscribe:conversation:c1:messages"), 1);

    // A single leave still empties the channel
    env.orchestrator.leave_conversation("a", "c1").await;
    assert_eq!(env.backend.count("unsubscribe:conversation:c1:messages"), 1);
    assert!(env.registry.users_for("conversation:c1:messages").is_empty());
}

#[tokio::test]
async fn leaving_without_joining_is_noop() {
    let env = create_test_environment();

    env.orchestrator.leave_conversation("a", "c1").await;
    assert!(env.backend.calls().is_empty());
}

#[tokio::test]
async fn disconnect_releases_only_emptied_channels() {
    let env = create_test_environment();

    let (tx_a, _rx_a) = mpsc::channel(8);
    let (tx_b, _rx_b) = mpsc::channel(8);
    let handle_a = env.orchestrator.on_connect("a", tx_a).await;
    env.orchestrator.on_connect("b", tx_b).await;
    env.orchestrator.join_conversation("a", "shared").await;
    env.orchestrator.join_conversation("b", "shared").await;

    env.orchestrator.on_disconnect("a", handle_a.id).await;

    // Personal channels emptied, shared conversation still held by b
    assert_eq!(env.backend.count("unsubscribe:user:a:messages"), 1);
    assert_eq!(env.backend.count("unsubscribe:user:a:typings"), 1);
    assert_eq!(env.backend.count("unsubscribe:conversation:shared:messages"), 0);

    assert!(env.hub.get("a").is_none());
    assert!(env.registry.channels_for("a").is_empty());
}

#[tokio::test]
async fn stale_disconnect_does_not_tear_down_successor() {
    let env = create_test_environment();

    let (tx_old, mut rx_old) = mpsc::channel(8);
    let old = env.orchestrator.on_connect("a", tx_old).await;
    env.orchestrator.join_conversation("a", "c1").await;

    // Reconnect supersedes the old handle
    let (tx_new, mut rx_new) = mpsc::channel(8);
    env.orchestrator.on_connect("a", tx_new).await;
    match rx_old.recv().await {
        Some(OutboundFrame::Close) => {}
        other => panic!("expected close for superseded handle, got {:?}", other),
    }

    // The old socket's teardown races in afterwards
    env.orchestrator.on_disconnect("a", old.id).await;

    // Interests survive; fanout goes to the new handle
    assert_eq!(env.backend.count("unsubscribe:"), 0);
    let event = json!({"type": "typing", "data": {"conversationId": "c1"}});
    env.events_tx
        .send(BrokerEvent {
            channel: "conversation:c1:typings".to_string(),
            payload: event.to_string(),
        })
        .await
        .unwrap();
    assert_eq!(recv_payload(&mut rx_new).await, event);
}

#[tokio::test]
async fn malformed_broker_payload_is_dropped() {
    let env = create_test_environment();

    let (tx, mut rx) = mpsc::channel(8);
    env.orchestrator.on_connect("a", tx).await;
    env.orchestrator.join_conversation("a", "c1").await;

    env.events_tx
        .send(BrokerEvent {
            channel: "conversation:c1:messages".to_string(),
            payload: "{not json".to_string(),
        })
        .await
        .unwrap();

    assert_silent(&mut rx).await;

    // Router keeps going after a bad payload
    let event = json!({"type": "new_message", "data": {"conversationId": "c1"}});
    env.events_tx
        .send(BrokerEvent {
            channel: "conversation:c1:messages".to_string(),
            payload: event.to_string(),
        })
        .await
        .unwrap();
    assert_eq!(recv_payload(&mut rx).await, event);
}

#[tokio::test]
async fn publish_goes_through_backend() {
    let env = create_test_environment();

    env.orchestrator
        .publish("conversation:c1:messages", &json!({"type": "new_conversation"}))
        .await;

    assert_eq!(env.backend.count("publish:conversation:c1:messages"), 1);
}

#[tokio::test]
async fn concurrent_joins_on_same_channel_subscribe_once() {
    let env = create_test_environment();
    let orchestrator = Arc::new(env.orchestrator);

    let mut handles = Vec::new();
    for i in 0..16 {
        let orchestrator = orchestrator.clone();
        handles.push(tokio::spawn(async move {
            orchestrator
                .join_conversation(&format!("user-{i}"), "hot")
                .await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(env.backend.count("subscribe:conversation:hot:messages"), 1);
    assert_eq!(env.registry.users_for("conversation:hot:messages").len(), 16);
}
