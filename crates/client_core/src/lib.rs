use std::sync::Arc;

use shared::{
    domain::{Conversation, ConversationId, Message, MessageId, MessageKind, Timestamp, User},
    protocol::OutboundEnvelope,
    rest::CreateConversationRequest,
};
use tracing::{info, warn};

pub mod api;
pub mod backoff;
pub mod config;
pub mod connection;
pub mod error;
pub mod session;
pub mod store;
pub mod transport;

pub use api::{ApiError, ChatApi, HttpChatApi, SessionCookies};
pub use backoff::ReconnectPolicy;
pub use config::{load_settings, resolve_ws_url, ClientSettings};
pub use connection::{ConnectionError, ConnectionManager, ConnectionState};
pub use error::ClientError;
pub use session::{AuthState, SessionGate};
pub use store::{ChatState, ChatStore, ConversationPatch, PageCursor, StoreChange};
pub use transport::{Connector, TransportError, WebSocketConnector};

pub struct ChatClient {
    settings: ClientSettings,
    api: Arc<dyn ChatApi>,
    store: ChatStore,
    connection: Arc<ConnectionManager>,
    session: SessionGate,
}

impl ChatClient {
    pub fn new(settings: ClientSettings) -> Result<Self, ClientError> {
        let cookies = Arc::new(SessionCookies::new());
        let api = HttpChatApi::new(settings.api_root()?, Arc::clone(&cookies))?;
        let connector = WebSocketConnector::with_cookies(cookies);
        Self::new_with_dependencies(settings, Arc::new(api), Arc::new(connector))
    }

    pub fn new_with_dependencies(
        settings: ClientSettings,
        api: Arc<dyn ChatApi>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ClientError> {
        let endpoint = resolve_ws_url(&settings)?;
        let store = ChatStore::new();
        let connection = ConnectionManager::new(
            endpoint,
            settings.reconnect_policy(),
            connector,
            store.clone(),
        );
        let session = SessionGate::new(Arc::clone(&api), Arc::clone(&connection));
        Ok(Self {
            settings,
            api,
            store,
            connection,
            session,
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn store(&self) -> &ChatStore {
        &self.store
    }

    pub fn session(&self) -> &SessionGate {
        &self.session
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub async fn start(&self) -> bool {
        self.session.validate_session().await
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<User, ClientError> {
        Ok(self.session.login(email, password).await?)
    }

    pub async fn register(
        &self,
        email: &str,
        username: &str,
        password: &str,
    ) -> Result<User, ClientError> {
        Ok(self.session.register(email, username, password).await?)
    }

    pub async fn logout(&self) {
        self.session.logout().await;
        self.store.reset();
    }

    pub fn shutdown(&self) {
        self.session.shutdown();
    }

    pub async fn load_conversations(&self) -> Result<(), ClientError> {
        let conversations = self.guard(self.api.list_conversations().await)?;
        info!(count = conversations.len(), "loaded conversations");
        self.store.set_conversations(conversations);
        Ok(())
    }

    pub async fn create_conversation(
        &self,
        request: CreateConversationRequest,
    ) -> Result<Conversation, ClientError> {
        let conversation = self.guard(self.api.create_conversation(request).await)?;
        self.store.add_conversation(conversation.clone());
        Ok(conversation)
    }

    pub async fn select_conversation(&self, id: Option<ConversationId>) -> Result<(), ClientError> {
        self.store.set_active_conversation(id.clone());
        let Some(id) = id else {
            return Ok(());
        };
        let page = self.guard(
            self.api
                .list_messages(&id, None, self.settings.messages_page_limit)
                .await,
        )?;
        self.store.set_messages(id.clone(), page.messages);
        self.store.set_page(
            id,
            PageCursor {
                has_more: page.has_more,
                next_cursor: page.next_cursor,
            },
        );
        Ok(())
    }

    /// Returns false when there is nothing older to load.
    pub async fn load_older_messages(&self, id: &ConversationId) -> Result<bool, ClientError> {
        let Some(cursor) = self.store.page(id).filter(|page| page.has_more) else {
            return Ok(false);
        };
        let page = self.guard(
            self.api
                .list_messages(
                    id,
                    cursor.next_cursor.as_deref(),
                    self.settings.messages_page_limit,
                )
                .await,
        )?;
        self.store.prepend_messages(id.clone(), page.messages);
        self.store.set_page(
            id.clone(),
            PageCursor {
                has_more: page.has_more,
                next_cursor: page.next_cursor,
            },
        );
        Ok(true)
    }

    /// The message shows under a temporary id until the server echoes it.
    pub fn send_message(
        &self,
        content: &str,
        kind: Option<MessageKind>,
    ) -> Result<Message, ClientError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        let user = self
            .session
            .current_user()
            .ok_or(ClientError::NotAuthenticated)?;
        let conversation_id = self
            .store
            .active_conversation_id()
            .ok_or(ClientError::NoActiveConversation)?;

        let envelope = OutboundEnvelope::new(conversation_id.clone(), content, kind);
        let message = Message {
            id: MessageId::temporary(),
            conversation_id,
            sender_id: user.id,
            sender_username: Some(user.username),
            content: envelope.content.clone(),
            kind: envelope.kind,
            sent_at: Timestamp::now(),
        };
        // The echo must find the pending entry.
        self.connection
            .send_then(&envelope, || self.store.add_message(message.clone()))?;
        Ok(message)
    }

    pub fn dismiss_server_error(&self) {
        self.store.dismiss_server_error();
    }

    fn guard<T>(&self, result: Result<T, ApiError>) -> Result<T, ClientError> {
        if let Err(ApiError::Unauthorized) = &result {
            warn!("session rejected by the chat api, signing out");
            self.session.invalidate();
        }
        Ok(result?)
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
