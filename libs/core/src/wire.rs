//! JSON shapes exchanged with browsers and remote backends.
//!
//! Push frames are tagged objects `{ "type": "message" | "identity_update" |
//! "release", ... }`; poll responses are `{ "messages": [...] }` with an
//! optional `agent_name` so polling clients observe identity changes too.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    queue::QueueEvent,
    types::{AgentIdentity, ChatEvent, ChatId, ChatSummary, IdentityUpdate, Message, Sender},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub seq: u64,
    pub sender: Sender,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default)]
    pub time_str: String,
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        Self {
            seq: message.seq,
            sender: message.sender,
            content: message.content.clone(),
            timestamp: message.timestamp,
            time_str: message.time_str(),
        }
    }
}

impl From<WireMessage> for Message {
    fn from(wire: WireMessage) -> Self {
        Self {
            seq: wire.seq,
            sender: wire.sender,
            content: wire.content,
            timestamp: wire.timestamp,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireEvent {
    Message(WireMessage),
    IdentityUpdate { agent_name: String },
    Release,
}

impl From<&ChatEvent> for WireEvent {
    fn from(event: &ChatEvent) -> Self {
        match event {
            ChatEvent::Message(message) => WireEvent::Message(message.into()),
            ChatEvent::IdentityUpdate(update) => WireEvent::IdentityUpdate {
                agent_name: update.agent.name().to_string(),
            },
            ChatEvent::Release => WireEvent::Release,
        }
    }
}

impl WireEvent {
    /// Converts a decoded frame into a domain event. A blank agent name is
    /// treated as a release, matching backends that clear the name instead of
    /// sending an explicit release.
    pub fn into_event(self) -> ChatEvent {
        match self {
            WireEvent::Message(message) => ChatEvent::Message(message.into()),
            WireEvent::IdentityUpdate { agent_name } => match AgentIdentity::new(agent_name) {
                Some(agent) => ChatEvent::IdentityUpdate(IdentityUpdate { agent }),
                None => ChatEvent::Release,
            },
            WireEvent::Release => ChatEvent::Release,
        }
    }
}

/// Frames on the admin queue stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueWireEvent {
    NewChat { chat: ChatSummary },
    ChatTaken { chat_id: ChatId, agent_name: String },
    ChatReleased { chat_id: ChatId },
}

impl From<&QueueEvent> for QueueWireEvent {
    fn from(event: &QueueEvent) -> Self {
        match event {
            QueueEvent::NewChat(summary) => QueueWireEvent::NewChat {
                chat: summary.clone(),
            },
            QueueEvent::ChatTaken { chat_id, agent } => QueueWireEvent::ChatTaken {
                chat_id: chat_id.clone(),
                agent_name: agent.name().to_string(),
            },
            QueueEvent::ChatReleased { chat_id } => QueueWireEvent::ChatReleased {
                chat_id: chat_id.clone(),
            },
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollResponse {
    #[serde(default)]
    pub messages: Vec<WireMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignRequest {
    pub agent: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub available: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    fn message() -> Message {
        Message {
            seq: 3,
            sender: Sender::Support,
            content: "on it".into(),
            timestamp: datetime!(2024-05-01 14:30:00 UTC),
        }
    }

    #[test]
    fn message_frame_shape() {
        let frame = serde_json::to_value(WireEvent::from(&ChatEvent::Message(message()))).unwrap();
        assert_eq!(
            frame,
            json!({
                "type": "message",
                "seq": 3,
                "sender": "support",
                "content": "on it",
                "timestamp": "2024-05-01T14:30:00Z",
                "time_str": "14:30"
            })
        );
    }

    #[test]
    fn identity_and_release_frames() {
        let update = ChatEvent::IdentityUpdate(IdentityUpdate {
            agent: AgentIdentity::new("Agent Smith").unwrap(),
        });
        assert_eq!(
            serde_json::to_value(WireEvent::from(&update)).unwrap(),
            json!({"type": "identity_update", "agent_name": "Agent Smith"})
        );
        assert_eq!(
            serde_json::to_value(WireEvent::from(&ChatEvent::Release)).unwrap(),
            json!({"type": "release"})
        );
    }

    #[test]
    fn queue_frames() {
        let taken = QueueEvent::ChatTaken {
            chat_id: ChatId::parse("C1").unwrap(),
            agent: AgentIdentity::new("Agent Smith").unwrap(),
        };
        assert_eq!(
            serde_json::to_value(QueueWireEvent::from(&taken)).unwrap(),
            json!({"type": "chat_taken", "chat_id": "C1", "agent_name": "Agent Smith"})
        );
        let released = QueueEvent::ChatReleased {
            chat_id: ChatId::parse("C1").unwrap(),
        };
        assert_eq!(
            serde_json::to_value(QueueWireEvent::from(&released)).unwrap(),
            json!({"type": "chat_released", "chat_id": "C1"})
        );
    }

    #[test]
    fn blank_identity_update_decodes_as_release() {
        let frame: WireEvent =
            serde_json::from_value(json!({"type": "identity_update", "agent_name": " "})).unwrap();
        assert_eq!(frame.into_event(), ChatEvent::Release);
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        let frame = serde_json::from_value::<WireEvent>(json!({"type": "typing"}));
        assert!(frame.is_err());
    }

    #[test]
    fn poll_response_tolerates_missing_time_str() {
        let body: PollResponse = serde_json::from_value(json!({
            "messages": [{
                "seq": 1,
                "sender": "user",
                "content": "hi",
                "timestamp": "2024-05-01T10:00:00Z"
            }]
        }))
        .unwrap();
        assert_eq!(body.messages.len(), 1);
        assert!(body.agent_name.is_none());
        assert_eq!(Message::from(body.messages[0].clone()).seq, 1);
    }
}
