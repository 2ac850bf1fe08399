//! Real-time channel protocol.
//!
//! Every socket frame is a JSON object `{ "event": <name>, "data": <payload> }`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ChatMessage, Coordinates};

/// Events pushed by the backend over the socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage {
        #[serde(rename = "chatId")]
        chat_id: String,
        message: ChatMessage,
    },
    UserTyping {
        #[serde(rename = "chatId")]
        chat_id: String,
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "isTyping")]
        is_typing: bool,
    },
    MessageRead {
        #[serde(rename = "chatId")]
        chat_id: String,
        #[serde(rename = "messageIds")]
        message_ids: Vec<String>,
        #[serde(rename = "readerId")]
        reader_id: String,
    },
    UserStatusChange {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "isOnline")]
        is_online: bool,
    },
    LocationUpdate {
        #[serde(rename = "providerId")]
        provider_id: String,
        coordinates: Coordinates,
        #[serde(rename = "updatedAt")]
        updated_at: DateTime<Utc>,
    },
    ReactionAdded {
        #[serde(rename = "eventId")]
        event_id: String,
        #[serde(rename = "chatId")]
        chat_id: String,
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "userId")]
        user_id: String,
        emoji: String,
    },
    ReactionRemoved {
        #[serde(rename = "eventId")]
        event_id: String,
        #[serde(rename = "chatId")]
        chat_id: String,
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "userId")]
        user_id: String,
        emoji: String,
    },
    UnreadCount {
        count: u32,
    },
}

impl ServerEvent {
    /// Key used to suppress redelivered events, when the payload carries one.
    pub fn event_id(&self) -> Option<&str> {
        match self {
            ServerEvent::NewMessage { message, .. } => Some(&message.id),
            ServerEvent::ReactionAdded { event_id, .. }
            | ServerEvent::ReactionRemoved { event_id, .. } => Some(event_id),
            _ => None,
        }
    }

    /// The chat this event belongs to, if any.
    pub fn chat_id(&self) -> Option<&str> {
        match self {
            ServerEvent::NewMessage { chat_id, .. }
            | ServerEvent::UserTyping { chat_id, .. }
            | ServerEvent::MessageRead { chat_id, .. }
            | ServerEvent::ReactionAdded { chat_id, .. }
            | ServerEvent::ReactionRemoved { chat_id, .. } => Some(chat_id),
            _ => None,
        }
    }
}

/// Commands emitted by the client over the socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    JoinChat {
        #[serde(rename = "chatId")]
        chat_id: String,
    },
    LeaveChat {
        #[serde(rename = "chatId")]
        chat_id: String,
    },
    Typing {
        #[serde(rename = "chatId")]
        chat_id: String,
        #[serde(rename = "isTyping")]
        is_typing: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_new_message_frame() {
        let frame = r#"{
            "event": "new_message",
            "data": {
                "chatId": "c1",
                "message": {
                    "_id": "m9",
                    "chatId": "c1",
                    "sender": "barber-1",
                    "content": "on my way",
                    "createdAt": "2026-03-01T09:30:00Z"
                }
            }
        }"#;
        let event: ServerEvent = serde_json::from_str(frame).unwrap();
        assert_eq!(event.event_id(), Some("m9"));
        assert_eq!(event.chat_id(), Some("c1"));
    }

    #[test]
    fn test_parse_location_update_frame() {
        let frame = r#"{
            "event": "location_update",
            "data": {
                "providerId": "b1",
                "coordinates": [2.35, 48.85],
                "updatedAt": "2026-03-01T09:30:00Z"
            }
        }"#;
        let event: ServerEvent = serde_json::from_str(frame).unwrap();
        match event {
            ServerEvent::LocationUpdate { coordinates, .. } => {
                assert_eq!(coordinates, Coordinates::new(2.35, 48.85));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_typing_command_frame() {
        let cmd = ClientCommand::Typing {
            chat_id: "c1".to_string(),
            is_typing: true,
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["event"], "typing");
        assert_eq!(json["data"]["chatId"], "c1");
        assert_eq!(json["data"]["isTyping"], true);
    }

    #[test]
    fn test_status_change_has_no_event_id() {
        let event = ServerEvent::UserStatusChange {
            user_id: "u1".to_string(),
            is_online: true,
        };
        assert_eq!(event.event_id(), None);
        assert_eq!(event.chat_id(), None);
    }
}
