use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use shared::{
    domain::{
        Conversation, ConversationId, ConversationKind, Message, MessageId, MessageKind,
        Timestamp, User, UserId,
    },
    rest::{CreateConversationRequest, LoginRequest, MessagesPage, RegisterRequest},
};
use tokio::sync::mpsc;
use url::Url;

use crate::{
    api::{ApiError, ChatApi},
    connection::{ConnectionManager, ConnectionState},
    transport::{Connector, TransportCommand, TransportError, TransportEvent, TransportLink},
};

pub(crate) const PASSWORD: &str = "secret";

pub(crate) fn user() -> User {
    User {
        id: UserId::from("me"),
        email: "me@example.com".into(),
        username: "me".into(),
        is_active: true,
        created_at: None,
    }
}

pub(crate) fn conversation(id: &str) -> Conversation {
    let at = Timestamp::from_millis(0).expect("epoch");
    Conversation {
        id: ConversationId::from(id),
        kind: ConversationKind::Direct,
        name: None,
        participants: Vec::new(),
        last_message: None,
        created_at: at,
        updated_at: at,
    }
}

pub(crate) fn message(id: &str, conversation_id: &str, sender: &str, content: &str) -> Message {
    Message {
        id: MessageId::from(id),
        conversation_id: ConversationId::from(conversation_id),
        sender_id: UserId::from(sender),
        sender_username: None,
        content: content.into(),
        kind: MessageKind::Text,
        sent_at: Timestamp::from_millis(1_000).expect("ts"),
    }
}

#[derive(Default)]
pub(crate) struct FakeApi {
    pub session_valid: AtomicBool,
    pub fail_logout: AtomicBool,
    pub cleared: AtomicUsize,
    pub conversations: Mutex<Vec<Conversation>>,
    /// Message pages keyed by the cursor they answer.
    pub pages: Mutex<HashMap<Option<String>, MessagesPage>>,
    pub message_requests: Mutex<Vec<(ConversationId, Option<String>, u32)>>,
}

impl FakeApi {
    pub fn with_session() -> Self {
        let api = Self::default();
        api.session_valid.store(true, Ordering::SeqCst);
        api
    }

    fn require_session(&self) -> Result<(), ApiError> {
        if self.session_valid.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ApiError::Unauthorized)
        }
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn me(&self) -> Result<User, ApiError> {
        self.require_session()?;
        Ok(user())
    }

    async fn login(&self, request: LoginRequest) -> Result<User, ApiError> {
        if request.password != PASSWORD {
            return Err(ApiError::Unauthorized);
        }
        self.session_valid.store(true, Ordering::SeqCst);
        Ok(user())
    }

    async fn register(&self, request: RegisterRequest) -> Result<User, ApiError> {
        self.session_valid.store(true, Ordering::SeqCst);
        Ok(User {
            email: request.email,
            username: request.username,
            ..user()
        })
    }

    async fn refresh(&self) -> Result<(), ApiError> {
        self.require_session()
    }

    async fn logout(&self) -> Result<(), ApiError> {
        self.session_valid.store(false, Ordering::SeqCst);
        if self.fail_logout.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                status: 503,
                message: "Service Unavailable".into(),
            });
        }
        Ok(())
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, ApiError> {
        self.require_session()?;
        Ok(self.conversations.lock().expect("lock").clone())
    }

    async fn create_conversation(
        &self,
        request: CreateConversationRequest,
    ) -> Result<Conversation, ApiError> {
        self.require_session()?;
        Ok(Conversation {
            name: request.name,
            ..conversation("created")
        })
    }

    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<MessagesPage, ApiError> {
        self.require_session()?;
        let cursor = cursor.map(str::to_owned);
        self.message_requests.lock().expect("lock").push((
            conversation_id.clone(),
            cursor.clone(),
            limit,
        ));
        Ok(self
            .pages
            .lock()
            .expect("lock")
            .get(&cursor)
            .cloned()
            .unwrap_or_default())
    }

    fn clear_credentials(&self) {
        self.cleared.fetch_add(1, Ordering::SeqCst);
        self.session_valid.store(false, Ordering::SeqCst);
    }
}

pub(crate) struct Peer {
    pub events: mpsc::UnboundedSender<TransportEvent>,
    pub commands: mpsc::UnboundedReceiver<TransportCommand>,
}

#[derive(Default)]
pub(crate) struct LoopbackConnector {
    pub opens: AtomicUsize,
    peers: Mutex<Vec<Peer>>,
}

impl LoopbackConnector {
    pub fn take_peer(&self) -> Peer {
        self.peers.lock().expect("lock").pop().expect("an open socket")
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn open(&self, _url: &Url) -> Result<TransportLink, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (outbound, commands) = mpsc::unbounded_channel();
        let (events, inbound) = mpsc::unbounded_channel();
        self.peers
            .lock()
            .expect("lock")
            .push(Peer { events, commands });
        Ok(TransportLink { outbound, inbound })
    }
}

pub(crate) async fn wait_for_state(connection: &ConnectionManager, target: ConnectionState) {
    let mut states = connection.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(120),
        states.wait_for(|state| *state == target),
    )
    .await
    .unwrap_or_else(|_| panic!("never reached {target:?}, stuck at {:?}", connection.state()))
    .expect("state channel open");
}

pub(crate) async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
