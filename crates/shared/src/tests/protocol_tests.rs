use super::*;
use crate::domain::{MessageId, Timestamp};

#[test]
fn presence_list_decodes_to_snapshot() {
    let event = decode_frame(r#"{"type":"presence_list","online_users":["u1","u2"]}"#)
        .expect("presence list");
    assert_eq!(
        event,
        InboundEvent::PresenceSnapshot {
            online_users: vec![UserId::from("u1"), UserId::from("u2")],
        }
    );
}

#[test]
fn presence_decodes_to_delta() {
    let event = decode_frame(r#"{"type":"presence","user_id":"u1","status":"offline"}"#)
        .expect("presence delta");
    assert_eq!(
        event,
        InboundEvent::PresenceDelta {
            user_id: UserId::from("u1"),
            status: PresenceStatus::Offline,
        }
    );
}

#[test]
fn presence_delta_tolerates_extra_username() {
    let event = decode_frame(
        r#"{"type":"presence","user_id":"u7","username":"gus","status":"online"}"#,
    )
    .expect("presence delta");
    assert!(matches!(
        event,
        InboundEvent::PresenceDelta { status: PresenceStatus::Online, .. }
    ));
}

#[test]
fn chat_message_with_epoch_millis_decodes() {
    let event = decode_frame(
        r#"{"id":"m1","conversation_id":"c1","sender_id":"u1","content":"hi","type":"text","sent_at":1000}"#,
    )
    .expect("chat message");
    let InboundEvent::ChatMessage(message) = event else {
        panic!("expected chat message, got {event:?}");
    };
    assert_eq!(message.id, MessageId::from("m1"));
    assert_eq!(message.conversation_id, ConversationId::from("c1"));
    assert_eq!(message.kind, MessageKind::Text);
    assert_eq!(message.sent_at.as_millis(), 1000);
    assert!(message.sender_username.is_none());
}

#[test]
fn chat_message_with_iso_timestamp_matches_millis_form() {
    let from_iso = decode_frame(
        r#"{"id":"m1","conversation_id":"c1","sender_id":"u1","content":"hi","type":"image","sent_at":"1970-01-01T00:00:01.000Z"}"#,
    )
    .expect("iso message");
    let InboundEvent::ChatMessage(message) = from_iso else {
        panic!("expected chat message");
    };
    assert_eq!(message.kind, MessageKind::Image);
    assert_eq!(Some(message.sent_at), Timestamp::from_millis(1000));
}

#[test]
fn invalid_json_is_rejected_without_panicking() {
    let err = decode_frame("not json").expect_err("must fail");
    assert!(matches!(err, ProtocolError::InvalidJson(_)));
}

#[test]
fn non_object_frames_are_rejected() {
    assert!(matches!(
        decode_frame("[1,2,3]"),
        Err(ProtocolError::NotAnObject)
    ));
    assert!(matches!(decode_frame("42"), Err(ProtocolError::NotAnObject)));
}

#[test]
fn chat_message_missing_required_field_is_rejected() {
    let err = decode_frame(
        r#"{"id":"m1","conversation_id":"c1","sender_id":"u1","content":"hi","sent_at":1000}"#,
    )
    .expect_err("type is required");
    assert!(matches!(err, ProtocolError::MissingField("type")));

    let err = decode_frame(r#"{"id":"m1","conversation_id":"c1"}"#).expect_err("incomplete");
    assert!(matches!(err, ProtocolError::MissingField("sender_id")));
}

#[test]
fn chat_message_with_unknown_kind_is_invalid() {
    let err = decode_frame(
        r#"{"id":"m1","conversation_id":"c1","sender_id":"u1","content":"hi","type":"video","sent_at":1000}"#,
    )
    .expect_err("unknown kind");
    assert!(matches!(err, ProtocolError::InvalidField { .. }));
}

#[test]
fn truthy_error_field_wins_over_type() {
    let event = decode_frame(r#"{"error":true,"message":"rate limited","type":"presence_list"}"#)
        .expect("server error");
    assert_eq!(
        event,
        InboundEvent::ServerError {
            message: "rate limited".into(),
        }
    );
}

#[test]
fn string_error_without_message_uses_error_text() {
    let event = decode_frame(r#"{"error":"conversation not found"}"#).expect("server error");
    assert_eq!(
        event,
        InboundEvent::ServerError {
            message: "conversation not found".into(),
        }
    );
}

#[test]
fn falsy_error_field_is_not_an_error_event() {
    let event = decode_frame(r#"{"error":false,"type":"presence_list","online_users":[]}"#)
        .expect("presence list");
    assert_eq!(
        event,
        InboundEvent::PresenceSnapshot {
            online_users: Vec::new(),
        }
    );
}

#[test]
fn presence_without_status_is_rejected() {
    let err = decode_frame(r#"{"type":"presence","user_id":"u1"}"#).expect_err("missing status");
    assert!(matches!(err, ProtocolError::MissingField("status")));

    let err = decode_frame(r#"{"type":"presence","user_id":"u1","status":"away"}"#)
        .expect_err("bad status");
    assert!(matches!(err, ProtocolError::InvalidField { field: "status", .. }));
}

#[test]
fn envelope_defaults_type_to_text() {
    let envelope = OutboundEnvelope::text(ConversationId::from("c1"), "hello");
    let encoded = encode_envelope(&envelope).expect("encode");
    let value: Value = serde_json::from_str(&encoded).expect("json");
    assert_eq!(value["conversation_id"], "c1");
    assert_eq!(value["content"], "hello");
    assert_eq!(value["type"], "text");
}

#[test]
fn envelope_keeps_explicit_type() {
    let envelope = OutboundEnvelope::new(ConversationId::from("c9"), "a.png", Some(MessageKind::Image));
    let encoded = encode_envelope(&envelope).expect("encode");
    assert!(encoded.contains(r#""type":"image""#));
}
