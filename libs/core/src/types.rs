use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

const MAX_CHAT_ID_LEN: usize = 128;

/// Opaque identifier of a support conversation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChatId(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidChatId {
    #[error("chat id is empty")]
    Empty,
    #[error("chat id exceeds {MAX_CHAT_ID_LEN} characters")]
    TooLong,
    #[error("chat id contains unsupported character {0:?}")]
    BadCharacter(char),
}

impl ChatId {
    /// Validates an externally supplied chat id.
    pub fn parse(raw: &str) -> Result<Self, InvalidChatId> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(InvalidChatId::Empty);
        }
        if trimmed.len() > MAX_CHAT_ID_LEN {
            return Err(InvalidChatId::TooLong);
        }
        if let Some(bad) = trimmed
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(InvalidChatId::BadCharacter(bad));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ChatId {
    type Error = InvalidChatId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ChatId> for String {
    fn from(value: ChatId) -> Self {
        value.0
    }
}

/// Role a message was authored under. Stable regardless of agent identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Support,
    System,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Support => "support",
            Sender::System => "system",
        }
    }
}

/// Per-subscription watermark: the sequence number of the last delivered
/// message. `Marker::ZERO` means nothing has been delivered yet.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Marker(pub u64);

impl Marker {
    pub const ZERO: Marker = Marker(0);

    pub fn seq(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored chat message. Immutable once appended.
///
/// `seq` is dense and 1-based within a chat; `timestamp` never decreases as
/// `seq` grows, so ordering by either yields the same total order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub seq: u64,
    pub sender: Sender,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl Message {
    pub fn marker(&self) -> Marker {
        Marker(self.seq)
    }

    /// `HH:MM` rendering of the timestamp in UTC.
    pub fn time_str(&self) -> String {
        let ts = self.timestamp.to_offset(time::UtcOffset::UTC);
        format!("{:02}:{:02}", ts.hour(), ts.minute())
    }
}

/// Display identity of the agent currently assigned to a chat.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentIdentity(String);

impl AgentIdentity {
    pub fn new(name: impl Into<String>) -> Option<Self> {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityUpdate {
    pub agent: AgentIdentity,
}

/// Events fanned out to the subscribers of a chat.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatEvent {
    Message(Message),
    IdentityUpdate(IdentityUpdate),
    Release,
}

impl ChatEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ChatEvent::Message(_) => "message",
            ChatEvent::IdentityUpdate(_) => "identity_update",
            ChatEvent::Release => "release",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatStatus {
    New,
    InProgress,
}

impl ChatStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "new" => Some(ChatStatus::New),
            "in_progress" => Some(ChatStatus::InProgress),
            _ => None,
        }
    }
}

/// Snapshot of a chat's side-channel state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSummary {
    pub chat_id: ChatId,
    pub status: ChatStatus,
    #[serde(default)]
    pub agent_name: Option<AgentIdentity>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub message_count: u64,
}
