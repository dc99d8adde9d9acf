//! Wire-level websocket event types.
//!
//! The JSON shapes here are a compatibility contract with deployed clients:
//! events are tagged by a snake_case `"type"` field and carry camelCase
//! payload fields. Do not rename fields or tags.

use serde::{Deserialize, Serialize};

fn default_message_type() -> String {
    "text".to_string()
}

/// Events received from a connected client.
///
/// `send_message` fields are deliberately lenient at the serde layer (empty
/// defaults) so that a request missing a required field still parses and can
/// be answered with a correlated `message_error` instead of being dropped.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    SendMessage {
        #[serde(default)]
        receiver_id: String,
        #[serde(default)]
        message_uuid: String,
        #[serde(default)]
        message: String,
        #[serde(default = "default_message_type")]
        message_type: String,
        #[serde(default)]
        timestamp: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    UpdateMessageStatus {
        message_uuid: String,
        status: String,
        sender_id: String,
    },
    #[serde(rename_all = "camelCase")]
    TypingStart { receiver_id: String },
    #[serde(rename_all = "camelCase")]
    TypingStop { receiver_id: String },
    #[serde(rename_all = "camelCase")]
    FriendRequestSent {
        receiver_id: String,
        request_id: String,
    },
}

/// Events pushed to connected clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    NewMessage {
        message_uuid: String,
        sender_id: String,
        receiver_id: String,
        message: String,
        message_type: String,
        timestamp: u64,
        status: String,
    },
    #[serde(rename_all = "camelCase")]
    MessageSent {
        message_uuid: String,
        status: String,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    MessageError { error: String, message_uuid: String },
    #[serde(rename_all = "camelCase")]
    MessageStatusUpdate {
        message_uuid: String,
        status: String,
        updated_by: String,
    },
    #[serde(rename_all = "camelCase")]
    UserTyping { user_id: String, is_typing: bool },
    #[serde(rename_all = "camelCase")]
    FriendStatusUpdate {
        friend_id: String,
        is_online: bool,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    FriendRequestReceived {
        request_id: String,
        sender_id: String,
        timestamp: u64,
    },
}

/// Current time as milliseconds since UNIX epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_message_parses_wire_shape() {
        let raw = r#"{
            "type": "send_message",
            "receiverId": "bob",
            "messageUuid": "m1",
            "message": "hi",
            "messageType": "text",
            "timestamp": 1700000000000
        }"#;
        let event: ClientEvent = serde_json::from_str(raw).unwrap();
        match event {
            ClientEvent::SendMessage {
                receiver_id,
                message_uuid,
                message,
                message_type,
                timestamp,
            } => {
                assert_eq!(receiver_id, "bob");
                assert_eq!(message_uuid, "m1");
                assert_eq!(message, "hi");
                assert_eq!(message_type, "text");
                assert_eq!(timestamp, Some(1_700_000_000_000));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn send_message_tolerates_missing_fields() {
        // Missing receiverId/message must still parse so the relay can
        // answer with a correlated message_error.
        let raw = r#"{"type": "send_message", "messageUuid": "m2"}"#;
        let event: ClientEvent = serde_json::from_str(raw).unwrap();
        match event {
            ClientEvent::SendMessage {
                receiver_id,
                message_uuid,
                message,
                message_type,
                ..
            } => {
                assert_eq!(receiver_id, "");
                assert_eq!(message_uuid, "m2");
                assert_eq!(message, "");
                assert_eq!(message_type, "text");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn typing_and_status_events_parse() {
        let typing: ClientEvent =
            serde_json::from_str(r#"{"type":"typing_start","receiverId":"bob"}"#).unwrap();
        assert!(matches!(typing, ClientEvent::TypingStart { receiver_id } if receiver_id == "bob"));

        let status: ClientEvent = serde_json::from_str(
            r#"{"type":"update_message_status","messageUuid":"m1","status":"read","senderId":"alice"}"#,
        )
        .unwrap();
        match status {
            ClientEvent::UpdateMessageStatus {
                message_uuid,
                status,
                sender_id,
            } => {
                assert_eq!(message_uuid, "m1");
                assert_eq!(status, "read");
                assert_eq!(sender_id, "alice");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn new_message_serializes_wire_shape() {
        let event = ServerEvent::NewMessage {
            message_uuid: "m1".to_string(),
            sender_id: "alice".to_string(),
            receiver_id: "bob".to_string(),
            message: "hi".to_string(),
            message_type: "text".to_string(),
            timestamp: 42,
            status: "sent".to_string(),
        };
        let value: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "type": "new_message",
                "messageUuid": "m1",
                "senderId": "alice",
                "receiverId": "bob",
                "message": "hi",
                "messageType": "text",
                "timestamp": 42,
                "status": "sent",
            })
        );
    }

    #[test]
    fn outbound_events_serialize_wire_shape() {
        let sent = ServerEvent::MessageSent {
            message_uuid: "m1".to_string(),
            status: "sent".to_string(),
            timestamp: 7,
        };
        assert_eq!(
            serde_json::to_value(&sent).unwrap(),
            serde_json::json!({"type":"message_sent","messageUuid":"m1","status":"sent","timestamp":7})
        );

        let error = ServerEvent::MessageError {
            error: "receiver is not a friend".to_string(),
            message_uuid: "m1".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            serde_json::json!({"type":"message_error","error":"receiver is not a friend","messageUuid":"m1"})
        );

        let presence = ServerEvent::FriendStatusUpdate {
            friend_id: "bob".to_string(),
            is_online: true,
            timestamp: 9,
        };
        assert_eq!(
            serde_json::to_value(&presence).unwrap(),
            serde_json::json!({"type":"friend_status_update","friendId":"bob","isOnline":true,"timestamp":9})
        );

        let typing = ServerEvent::UserTyping {
            user_id: "alice".to_string(),
            is_typing: false,
        };
        assert_eq!(
            serde_json::to_value(&typing).unwrap(),
            serde_json::json!({"type":"user_typing","userId":"alice","isTyping":false})
        );

        let request = ServerEvent::FriendRequestReceived {
            request_id: "r1".to_string(),
            sender_id: "carol".to_string(),
            timestamp: 11,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({"type":"friend_request_received","requestId":"r1","senderId":"carol","timestamp":11})
        );
    }
}
