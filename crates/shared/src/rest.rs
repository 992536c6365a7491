use serde::{Deserialize, Serialize};

use crate::domain::{
    Conversation, ConversationId, ConversationKind, Message, Participant, Timestamp, User, UserId,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub user: User,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateConversationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_ids: Option<Vec<UserId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_emails: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl CreateConversationRequest {
    pub fn direct_with_email(email: impl Into<String>) -> Self {
        Self {
            participant_email: Some(email.into()),
            ..Self::default()
        }
    }

    pub fn group(name: impl Into<String>, participant_emails: Vec<String>) -> Self {
        Self {
            participant_emails: Some(participant_emails),
            name: Some(name.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: ConversationId,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// One conversation as the server nests it: the record, its participants and
/// an optional preview of the newest message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationResponse {
    pub conversation: ConversationRecord,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
}

impl From<ConversationResponse> for Conversation {
    fn from(value: ConversationResponse) -> Self {
        Self {
            id: value.conversation.id,
            kind: value.conversation.kind,
            name: value.conversation.name,
            participants: value.participants,
            last_message: value.last_message,
            created_at: value.conversation.created_at,
            updated_at: value.conversation.updated_at,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationListResponse {
    #[serde(default)]
    pub conversations: Vec<ConversationResponse>,
    #[serde(default)]
    pub count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagesPage {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}
