//! Wire format of the chat socket.
//!
//! Inbound frames are untagged JSON objects. [`decode_frame`] classifies them
//! by checking discriminants in a fixed order: a truthy `error` field first,
//! then `type == "presence_list"`, then `type == "presence"`, and everything
//! else must be a complete chat message.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    domain::{ConversationId, Message, MessageKind, UserId},
    error::ProtocolError,
};

const PRESENCE_LIST_TYPE: &str = "presence_list";
const PRESENCE_TYPE: &str = "presence";
const CHAT_MESSAGE_FIELDS: [&str; 6] = [
    "id",
    "conversation_id",
    "sender_id",
    "content",
    "type",
    "sent_at",
];
const UNKNOWN_SERVER_ERROR: &str = "unknown server error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceStatus {
    pub fn is_online(self) -> bool {
        self == PresenceStatus::Online
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    ChatMessage(Message),
    PresenceSnapshot { online_users: Vec<UserId> },
    PresenceDelta { user_id: UserId, status: PresenceStatus },
    ServerError { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    pub conversation_id: ConversationId,
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
}

impl OutboundEnvelope {
    pub fn new(
        conversation_id: ConversationId,
        content: impl Into<String>,
        kind: Option<MessageKind>,
    ) -> Self {
        Self {
            conversation_id,
            content: content.into(),
            kind: kind.unwrap_or_default(),
        }
    }

    pub fn text(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self::new(conversation_id, content, None)
    }
}

pub fn decode_frame(text: &str) -> Result<InboundEvent, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;
    let Value::Object(object) = value else {
        return Err(ProtocolError::NotAnObject);
    };

    if object.get("error").is_some_and(is_truthy) {
        return Ok(InboundEvent::ServerError {
            message: server_error_message(&object),
        });
    }

    match object.get("type").and_then(Value::as_str) {
        Some(PRESENCE_LIST_TYPE) => decode_presence_list(&object),
        Some(PRESENCE_TYPE) => decode_presence(&object),
        _ => decode_chat_message(object),
    }
}

pub fn encode_envelope(envelope: &OutboundEnvelope) -> Result<String, ProtocolError> {
    serde_json::to_string(envelope).map_err(ProtocolError::Encode)
}

fn decode_presence_list(object: &Map<String, Value>) -> Result<InboundEvent, ProtocolError> {
    let raw = object
        .get("online_users")
        .ok_or(ProtocolError::MissingField("online_users"))?;
    let online_users = serde_json::from_value::<Vec<UserId>>(raw.clone()).map_err(|err| {
        ProtocolError::InvalidField {
            field: "online_users",
            reason: err.to_string(),
        }
    })?;
    Ok(InboundEvent::PresenceSnapshot { online_users })
}

fn decode_presence(object: &Map<String, Value>) -> Result<InboundEvent, ProtocolError> {
    let user_id = object
        .get("user_id")
        .ok_or(ProtocolError::MissingField("user_id"))?
        .as_str()
        .ok_or_else(|| ProtocolError::InvalidField {
            field: "user_id",
            reason: "expected a string".into(),
        })?;
    let raw_status = object
        .get("status")
        .ok_or(ProtocolError::MissingField("status"))?;
    let status = serde_json::from_value::<PresenceStatus>(raw_status.clone()).map_err(|err| {
        ProtocolError::InvalidField {
            field: "status",
            reason: err.to_string(),
        }
    })?;
    Ok(InboundEvent::PresenceDelta {
        user_id: UserId::from(user_id),
        status,
    })
}

fn decode_chat_message(object: Map<String, Value>) -> Result<InboundEvent, ProtocolError> {
    if let Some(missing) = CHAT_MESSAGE_FIELDS
        .iter()
        .find(|field| object.get(**field).map_or(true, Value::is_null))
    {
        return Err(ProtocolError::MissingField(*missing));
    }
    let message =
        serde_json::from_value::<Message>(Value::Object(object)).map_err(|err| {
            ProtocolError::InvalidField {
                field: "message",
                reason: err.to_string(),
            }
        })?;
    Ok(InboundEvent::ChatMessage(message))
}

fn server_error_message(object: &Map<String, Value>) -> String {
    if let Some(message) = object
        .get("message")
        .and_then(Value::as_str)
        .filter(|message| !message.trim().is_empty())
    {
        return message.to_string();
    }
    match object.get("error") {
        Some(Value::String(error)) => error.clone(),
        _ => UNKNOWN_SERVER_ERROR.to_string(),
    }
}

/// Truthiness as the server's JSON producers use it: `null`, `false`, `0`
/// and `""` are falsy, everything else is truthy.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
