use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use shared::{
    domain::{Conversation, ConversationId, Message, Participant, Timestamp, UserId},
    protocol::InboundEvent,
};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Conversations,
    Messages(ConversationId),
    ActiveConversation(Option<ConversationId>),
    Unread(ConversationId),
    Presence,
    Typing(ConversationId),
    Connection(bool),
    Pagination(ConversationId),
    ServerError(String),
    ServerErrorCleared,
    Reset,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageCursor {
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConversationPatch {
    pub id: ConversationId,
    pub name: Option<String>,
    pub participants: Option<Vec<Participant>>,
    pub updated_at: Option<Timestamp>,
}

impl ConversationPatch {
    pub fn new(id: ConversationId) -> Self {
        Self {
            id,
            name: None,
            participants: None,
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatState {
    pub active_conversation_id: Option<ConversationId>,
    /// Most recent activity first.
    pub conversations: Vec<Conversation>,
    pub messages: HashMap<ConversationId, Vec<Message>>,
    pub typing_users: HashMap<ConversationId, BTreeSet<UserId>>,
    pub is_connected: bool,
    pub unread_counts: HashMap<ConversationId, u32>,
    pub online_users: BTreeSet<UserId>,
    pub pages: HashMap<ConversationId, PageCursor>,
    pub last_server_error: Option<String>,
}

impl ChatState {
    pub fn conversation(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|conversation| &conversation.id == id)
    }

    pub fn messages_for(&self, id: &ConversationId) -> &[Message] {
        self.messages.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn unread(&self, id: &ConversationId) -> u32 {
        self.unread_counts.get(id).copied().unwrap_or(0)
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.online_users.contains(user_id)
    }

    pub fn set_conversations(&mut self, conversations: Vec<Conversation>) -> Vec<StoreChange> {
        self.conversations = conversations;
        vec![StoreChange::Conversations]
    }

    pub fn add_conversation(&mut self, conversation: Conversation) -> Vec<StoreChange> {
        if self.conversation(&conversation.id).is_some() {
            return Vec::new();
        }
        self.conversations.insert(0, conversation);
        vec![StoreChange::Conversations]
    }

    pub fn update_conversation(&mut self, patch: ConversationPatch) -> Vec<StoreChange> {
        let Some(conversation) = self
            .conversations
            .iter_mut()
            .find(|conversation| conversation.id == patch.id)
        else {
            return Vec::new();
        };
        if let Some(name) = patch.name {
            conversation.name = Some(name);
        }
        if let Some(participants) = patch.participants {
            conversation.participants = participants;
        }
        if let Some(updated_at) = patch.updated_at {
            conversation.updated_at = updated_at;
        }
        vec![StoreChange::Conversations]
    }

    pub fn set_messages(
        &mut self,
        conversation_id: ConversationId,
        messages: Vec<Message>,
    ) -> Vec<StoreChange> {
        self.messages.insert(conversation_id.clone(), messages);
        vec![StoreChange::Messages(conversation_id)]
    }

    pub fn prepend_messages(
        &mut self,
        conversation_id: ConversationId,
        mut older: Vec<Message>,
    ) -> Vec<StoreChange> {
        let existing = self.messages.entry(conversation_id.clone()).or_default();
        older.append(existing);
        *existing = older;
        vec![StoreChange::Messages(conversation_id)]
    }

    /// A confirmed message replaces the oldest pending `temp-` entry with the
    /// same sender and content, and is not counted as unread.
    pub fn add_message(&mut self, message: Message) -> Vec<StoreChange> {
        let conversation_id = message.conversation_id.clone();
        let history = self.messages.entry(conversation_id.clone()).or_default();
        if history.iter().any(|existing| existing.id == message.id) {
            return Vec::new();
        }

        let pending = if message.id.is_temporary() {
            None
        } else {
            history.iter().position(|existing| {
                existing.id.is_temporary()
                    && existing.sender_id == message.sender_id
                    && existing.content == message.content
            })
        };
        let reconciled = match pending {
            Some(index) => {
                debug!(
                    conversation_id = %conversation_id,
                    temp_id = %history[index].id,
                    message_id = %message.id,
                    "reconciled optimistic message"
                );
                history[index] = message.clone();
                true
            }
            None => {
                history.push(message.clone());
                false
            }
        };

        let mut changes = vec![StoreChange::Messages(conversation_id.clone())];
        if let Some(index) = self
            .conversations
            .iter()
            .position(|conversation| conversation.id == conversation_id)
        {
            let mut conversation = self.conversations.remove(index);
            conversation.last_message = Some(message);
            self.conversations.insert(0, conversation);
            changes.push(StoreChange::Conversations);
        }

        if !reconciled && self.active_conversation_id.as_ref() != Some(&conversation_id) {
            *self.unread_counts.entry(conversation_id.clone()).or_insert(0) += 1;
            changes.push(StoreChange::Unread(conversation_id));
        }
        changes
    }

    pub fn set_active_conversation(&mut self, id: Option<ConversationId>) -> Vec<StoreChange> {
        self.active_conversation_id = id.clone();
        let mut changes = vec![StoreChange::ActiveConversation(id.clone())];
        if let Some(id) = id {
            self.unread_counts.insert(id.clone(), 0);
            changes.push(StoreChange::Unread(id));
        }
        changes
    }

    pub fn clear_unread(&mut self, id: ConversationId) -> Vec<StoreChange> {
        self.unread_counts.insert(id.clone(), 0);
        vec![StoreChange::Unread(id)]
    }

    pub fn set_connected(&mut self, connected: bool) -> Vec<StoreChange> {
        let mut changes = Vec::new();
        if self.is_connected != connected {
            self.is_connected = connected;
            changes.push(StoreChange::Connection(connected));
        }
        if !connected && !self.online_users.is_empty() {
            self.online_users.clear();
            changes.push(StoreChange::Presence);
        }
        changes
    }

    pub fn set_online_users(&mut self, users: Vec<UserId>) -> Vec<StoreChange> {
        self.online_users = users.into_iter().collect();
        vec![StoreChange::Presence]
    }

    pub fn set_user_online_status(&mut self, user_id: UserId, online: bool) -> Vec<StoreChange> {
        let changed = if online {
            self.online_users.insert(user_id)
        } else {
            self.online_users.remove(&user_id)
        };
        if changed {
            vec![StoreChange::Presence]
        } else {
            Vec::new()
        }
    }

    pub fn set_typing_user(
        &mut self,
        conversation_id: ConversationId,
        user_id: UserId,
        typing: bool,
    ) -> Vec<StoreChange> {
        let typists = self.typing_users.entry(conversation_id.clone()).or_default();
        let changed = if typing {
            typists.insert(user_id)
        } else {
            typists.remove(&user_id)
        };
        if changed {
            vec![StoreChange::Typing(conversation_id)]
        } else {
            Vec::new()
        }
    }

    pub fn set_page(&mut self, conversation_id: ConversationId, page: PageCursor) -> Vec<StoreChange> {
        self.pages.insert(conversation_id.clone(), page);
        vec![StoreChange::Pagination(conversation_id)]
    }

    pub fn record_server_error(&mut self, message: String) -> Vec<StoreChange> {
        self.last_server_error = Some(message.clone());
        vec![StoreChange::ServerError(message)]
    }

    pub fn dismiss_server_error(&mut self) -> Vec<StoreChange> {
        match self.last_server_error.take() {
            Some(_) => vec![StoreChange::ServerErrorCleared],
            None => Vec::new(),
        }
    }

    pub fn apply_inbound(&mut self, event: InboundEvent) -> Vec<StoreChange> {
        match event {
            InboundEvent::ChatMessage(message) => self.add_message(message),
            InboundEvent::PresenceSnapshot { online_users } => self.set_online_users(online_users),
            InboundEvent::PresenceDelta { user_id, status } => {
                self.set_user_online_status(user_id, status.is_online())
            }
            InboundEvent::ServerError { message } => self.record_server_error(message),
        }
    }
}

#[derive(Clone)]
pub struct ChatStore {
    state: Arc<Mutex<ChatState>>,
    changes: broadcast::Sender<StoreChange>,
}

impl Default for ChatStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(ChatState::default())),
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    pub fn change_stream(&self) -> BroadcastStream<StoreChange> {
        BroadcastStream::new(self.changes.subscribe())
    }

    pub fn snapshot(&self) -> ChatState {
        self.lock().clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&ChatState) -> R) -> R {
        f(&self.lock())
    }

    pub fn active_conversation_id(&self) -> Option<ConversationId> {
        self.read(|state| state.active_conversation_id.clone())
    }

    pub fn page(&self, id: &ConversationId) -> Option<PageCursor> {
        self.read(|state| state.pages.get(id).cloned())
    }

    fn lock(&self) -> MutexGuard<'_, ChatState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mutate(&self, reducer: impl FnOnce(&mut ChatState) -> Vec<StoreChange>) {
        let mut state = self.lock();
        for change in reducer(&mut state) {
            let _ = self.changes.send(change);
        }
    }

    pub fn set_conversations(&self, conversations: Vec<Conversation>) {
        self.mutate(|state| state.set_conversations(conversations));
    }

    pub fn add_conversation(&self, conversation: Conversation) {
        self.mutate(|state| state.add_conversation(conversation));
    }

    pub fn update_conversation(&self, patch: ConversationPatch) {
        self.mutate(|state| state.update_conversation(patch));
    }

    pub fn set_messages(&self, conversation_id: ConversationId, messages: Vec<Message>) {
        self.mutate(|state| state.set_messages(conversation_id, messages));
    }

    pub fn prepend_messages(&self, conversation_id: ConversationId, messages: Vec<Message>) {
        self.mutate(|state| state.prepend_messages(conversation_id, messages));
    }

    pub fn add_message(&self, message: Message) {
        self.mutate(|state| state.add_message(message));
    }

    pub fn set_active_conversation(&self, id: Option<ConversationId>) {
        self.mutate(|state| state.set_active_conversation(id));
    }

    pub fn clear_unread(&self, id: ConversationId) {
        self.mutate(|state| state.clear_unread(id));
    }

    pub fn set_connected(&self, connected: bool) {
        self.mutate(|state| state.set_connected(connected));
    }

    pub fn set_online_users(&self, users: Vec<UserId>) {
        self.mutate(|state| state.set_online_users(users));
    }

    pub fn set_user_online_status(&self, user_id: UserId, online: bool) {
        self.mutate(|state| state.set_user_online_status(user_id, online));
    }

    pub fn set_typing_user(&self, conversation_id: ConversationId, user_id: UserId, typing: bool) {
        self.mutate(|state| state.set_typing_user(conversation_id, user_id, typing));
    }

    pub fn set_page(&self, conversation_id: ConversationId, page: PageCursor) {
        self.mutate(|state| state.set_page(conversation_id, page));
    }

    pub fn dismiss_server_error(&self) {
        self.mutate(ChatState::dismiss_server_error);
    }

    pub fn apply_inbound(&self, event: InboundEvent) {
        self.mutate(|state| state.apply_inbound(event));
    }

    pub fn reset(&self) {
        self.mutate(|state| {
            *state = ChatState::default();
            vec![StoreChange::Reset]
        });
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
