use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use super::*;
use async_trait::async_trait;
use shared::domain::{ConversationId, UserId};
use tokio::time::Instant;

use crate::{
    test_support::{settle, wait_for_state},
    transport::{TransportError, TransportLink},
};

/// Far end of a fake socket, held by the test.
struct ServerSide {
    events: mpsc::UnboundedSender<TransportEvent>,
    commands: mpsc::UnboundedReceiver<TransportCommand>,
}

#[derive(Default)]
struct FakeConnector {
    refuse: AtomicBool,
    opened_at: Mutex<Vec<Instant>>,
    sides: Mutex<Vec<ServerSide>>,
}

impl FakeConnector {
    fn refusing() -> Arc<Self> {
        let connector = Self::default();
        connector.refuse.store(true, Ordering::SeqCst);
        Arc::new(connector)
    }

    fn opens(&self) -> usize {
        self.opened_at.lock().expect("lock").len()
    }

    fn gaps_ms(&self) -> Vec<u128> {
        let opened_at = self.opened_at.lock().expect("lock");
        opened_at
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_millis())
            .collect()
    }

    fn take_side(&self) -> ServerSide {
        self.sides.lock().expect("lock").pop().expect("an open socket")
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, url: &Url) -> Result<TransportLink, TransportError> {
        self.opened_at.lock().expect("lock").push(Instant::now());
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Handshake {
                url: url.to_string(),
                reason: "connection refused".into(),
            });
        }
        let (outbound, commands) = mpsc::unbounded_channel();
        let (events, inbound) = mpsc::unbounded_channel();
        self.sides
            .lock()
            .expect("lock")
            .push(ServerSide { events, commands });
        Ok(TransportLink { outbound, inbound })
    }
}

fn manager_with(connector: &Arc<FakeConnector>) -> (Arc<ConnectionManager>, ChatStore) {
    let store = ChatStore::new();
    let manager = ConnectionManager::new(
        Url::parse("ws://chat.test/ws").expect("url"),
        ReconnectPolicy::default(),
        Arc::clone(connector) as Arc<dyn Connector>,
        store.clone(),
    );
    (manager, store)
}

#[tokio::test(start_paused = true)]
async fn connect_opens_one_socket() {
    let connector = Arc::new(FakeConnector::default());
    let (manager, store) = manager_with(&connector);

    manager.connect();
    manager.connect();
    assert_eq!(manager.state(), ConnectionState::Connecting);
    wait_for_state(&manager, ConnectionState::Connected).await;
    manager.connect();
    settle().await;

    assert_eq!(connector.opens(), 1);
    assert!(store.read(|state| state.is_connected));
}

#[tokio::test(start_paused = true)]
async fn frames_apply_in_order_and_malformed_ones_are_dropped() {
    let connector = Arc::new(FakeConnector::default());
    let (manager, store) = manager_with(&connector);
    manager.connect();
    wait_for_state(&manager, ConnectionState::Connected).await;
    let side = connector.take_side();

    for frame in [
        r#"{"type":"presence_list","online_users":["u1","u2"]}"#,
        "not json",
        r#"{"id":"m1","conversation_id":"c1","sender_id":"u1","content":"hi"}"#,
        r#"{"type":"presence","user_id":"u1","status":"offline"}"#,
        r#"{"id":"m2","conversation_id":"c1","sender_id":"u2","content":"yo","type":"text","sent_at":1000}"#,
        r#"{"error":true,"message":"rate limited"}"#,
    ] {
        side.events
            .send(TransportEvent::Frame(frame.into()))
            .expect("deliver");
    }
    settle().await;

    let state = store.snapshot();
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(
        state.online_users.iter().cloned().collect::<Vec<_>>(),
        vec![UserId::from("u2")]
    );
    let history = state.messages_for(&ConversationId::from("c1"));
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content, "yo");
    assert_eq!(state.last_server_error.as_deref(), Some("rate limited"));
}

#[tokio::test(start_paused = true)]
async fn send_requires_a_live_connection() {
    let connector = Arc::new(FakeConnector::default());
    let (manager, _store) = manager_with(&connector);
    let envelope = OutboundEnvelope::text(ConversationId::from("c1"), "hi");

    assert!(matches!(
        manager.send(&envelope),
        Err(ConnectionError::NotConnected)
    ));

    manager.connect();
    wait_for_state(&manager, ConnectionState::Connected).await;
    let mut side = connector.take_side();
    manager.send(&envelope).expect("send");

    let text = match side.commands.recv().await {
        Some(TransportCommand::Text(text)) => text,
        other => panic!("expected a text frame, got {other:?}"),
    };
    let json: serde_json::Value = serde_json::from_str(&text).expect("json");
    assert_eq!(
        json,
        serde_json::json!({"conversation_id": "c1", "content": "hi", "type": "text"})
    );
}

#[tokio::test(start_paused = true)]
async fn failed_opens_back_off_exponentially_then_terminate() {
    let connector = FakeConnector::refusing();
    let (manager, _store) = manager_with(&connector);

    manager.connect();
    wait_for_state(&manager, ConnectionState::Terminated).await;

    // The first open plus five reconnects; the sixth failure gives up.
    assert_eq!(connector.opens(), 6);
    assert_eq!(connector.gaps_ms(), vec![1000, 2000, 4000, 8000, 16000]);

    tokio::time::advance(Duration::from_secs(120)).await;
    settle().await;
    assert_eq!(connector.opens(), 6);
    assert_eq!(manager.state(), ConnectionState::Terminated);
}

#[tokio::test(start_paused = true)]
async fn sixth_consecutive_close_terminates() {
    let connector = Arc::new(FakeConnector::default());
    let (manager, store) = manager_with(&connector);
    manager.connect();
    wait_for_state(&manager, ConnectionState::Connected).await;
    store.set_online_users(vec![UserId::from("u1")]);

    connector.refuse.store(true, Ordering::SeqCst);
    let side = connector.take_side();
    side.events
        .send(TransportEvent::Closed { reason: None })
        .expect("close");
    wait_for_state(&manager, ConnectionState::ReconnectScheduled).await;
    assert!(!store.read(|state| state.is_connected));
    assert!(store.read(|state| state.online_users.is_empty()));

    wait_for_state(&manager, ConnectionState::Terminated).await;
    // One successful open plus five refused reconnects.
    assert_eq!(connector.opens(), 6);
    assert_eq!(connector.gaps_ms(), vec![1000, 2000, 4000, 8000, 16000]);
    assert_eq!(manager.reconnect_attempts(), 5);
}

#[tokio::test(start_paused = true)]
async fn successful_reconnect_resets_attempts() {
    let connector = Arc::new(FakeConnector::default());
    let (manager, _store) = manager_with(&connector);
    manager.connect();
    wait_for_state(&manager, ConnectionState::Connected).await;

    let side = connector.take_side();
    drop(side.events);
    wait_for_state(&manager, ConnectionState::ReconnectScheduled).await;
    assert_eq!(manager.reconnect_attempts(), 1);

    let before = Instant::now();
    wait_for_state(&manager, ConnectionState::Connected).await;
    assert_eq!(before.elapsed(), Duration::from_millis(1000));
    assert_eq!(manager.reconnect_attempts(), 0);
    assert_eq!(connector.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_scheduled_reconnect() {
    let connector = FakeConnector::refusing();
    let (manager, _store) = manager_with(&connector);
    manager.connect();
    wait_for_state(&manager, ConnectionState::ReconnectScheduled).await;

    manager.disconnect();
    manager.disconnect();
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    tokio::time::advance(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(connector.opens(), 1);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn disconnect_closes_live_socket_and_ignores_late_close() {
    let connector = Arc::new(FakeConnector::default());
    let (manager, store) = manager_with(&connector);
    manager.connect();
    wait_for_state(&manager, ConnectionState::Connected).await;
    let mut side = connector.take_side();

    manager.disconnect();

    assert_eq!(side.commands.recv().await, Some(TransportCommand::Close));
    let _ = side.events.send(TransportEvent::Closed { reason: None });
    tokio::time::advance(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(connector.opens(), 1);
    assert!(!store.read(|state| state.is_connected));
}

#[tokio::test(start_paused = true)]
async fn connect_revives_a_terminated_manager() {
    let connector = FakeConnector::refusing();
    let (manager, _store) = manager_with(&connector);
    manager.connect();
    wait_for_state(&manager, ConnectionState::Terminated).await;

    connector.refuse.store(false, Ordering::SeqCst);
    manager.connect();
    wait_for_state(&manager, ConnectionState::Connected).await;

    assert_eq!(connector.opens(), 7);
    assert_eq!(manager.reconnect_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn connect_during_backoff_retries_immediately() {
    let connector = FakeConnector::refusing();
    let (manager, _store) = manager_with(&connector);
    manager.connect();
    wait_for_state(&manager, ConnectionState::ReconnectScheduled).await;

    connector.refuse.store(false, Ordering::SeqCst);
    let before = Instant::now();
    manager.connect();
    wait_for_state(&manager, ConnectionState::Connected).await;

    assert_eq!(before.elapsed(), Duration::ZERO);
    assert_eq!(connector.opens(), 2);
}
