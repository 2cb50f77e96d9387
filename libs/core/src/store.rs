use std::{collections::HashMap, sync::Arc};

use anyhow::Error;
use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::types::{AgentIdentity, ChatId, ChatStatus, ChatSummary, Marker, Message, Sender};

pub const DEFAULT_MAX_HISTORY: usize = 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("chat not found: {0}")]
    NotFound(ChatId),
    #[error("chat already exists: {0}")]
    AlreadyExists(ChatId),
    #[error("chat {chat} is already assigned to {agent}")]
    AlreadyAssigned { chat: ChatId, agent: AgentIdentity },
    #[error("chat history exceeded quota: {0}")]
    QuotaExceeded(ChatId),
    #[error("message store error")]
    Internal(#[source] Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Selects chats for the admin lists. An empty filter matches every chat.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChatFilter {
    pub status: Option<ChatStatus>,
    /// Only chats held by this agent, most recently active first.
    pub agent: Option<AgentIdentity>,
}

impl ChatFilter {
    fn matches(&self, record: &ChatRecord) -> bool {
        self.status.is_none_or(|wanted| record.status == wanted)
            && self
                .agent
                .as_ref()
                .is_none_or(|wanted| record.agent.as_ref() == Some(wanted))
    }
}

/// Durable read/append of chat messages, owned by the backend.
///
/// Implementations assign `seq` densely from 1 and keep timestamps
/// non-decreasing within a chat; delivery gap detection relies on both.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create(&self, chat: &ChatId, welcome: Option<&str>) -> Result<ChatSummary>;
    async fn append(&self, chat: &ChatId, sender: Sender, content: &str) -> Result<Message>;
    /// Messages with `seq` strictly greater than `marker`, ascending.
    async fn list_since(&self, chat: &ChatId, marker: Marker) -> Result<Vec<Message>>;
    async fn summary(&self, chat: &ChatId) -> Result<ChatSummary>;
    /// Lists chats matching `filter`. Agent-filtered lists are ordered by
    /// last activity, everything else by creation time, newest first.
    async fn list_chats(&self, filter: &ChatFilter) -> Result<Vec<ChatSummary>>;
    /// Sets or clears the assigned agent. Assigning a chat held by a
    /// different agent fails with [`StoreError::AlreadyAssigned`].
    async fn set_assignment(
        &self,
        chat: &ChatId,
        agent: Option<AgentIdentity>,
    ) -> Result<ChatSummary>;
}

pub type SharedMessageStore = Arc<dyn MessageStore>;

#[derive(Clone)]
pub struct InMemoryMessageStore {
    inner: Arc<RwLock<HashMap<ChatId, ChatRecord>>>,
    max_history: usize,
}

#[derive(Debug)]
struct ChatRecord {
    status: ChatStatus,
    agent: Option<AgentIdentity>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    messages: Vec<Message>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::with_max_history(DEFAULT_MAX_HISTORY)
    }

    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            max_history,
        }
    }

    pub fn shared() -> SharedMessageStore {
        Arc::new(Self::new())
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatRecord {
    fn new(now: OffsetDateTime) -> Self {
        Self {
            status: ChatStatus::New,
            agent: None,
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        }
    }

    fn push(&mut self, sender: Sender, content: &str) -> Message {
        let now = OffsetDateTime::now_utc();
        let timestamp = match self.messages.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };
        let message = Message {
            seq: self.messages.len() as u64 + 1,
            sender,
            content: content.to_string(),
            timestamp,
        };
        self.messages.push(message.clone());
        self.updated_at = timestamp;
        message
    }

    fn summary(&self, chat: &ChatId) -> ChatSummary {
        ChatSummary {
            chat_id: chat.clone(),
            status: self.status,
            agent_name: self.agent.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            message_count: self.messages.len() as u64,
        }
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn create(&self, chat: &ChatId, welcome: Option<&str>) -> Result<ChatSummary> {
        let mut guard = self.inner.write().await;
        if guard.contains_key(chat) {
            return Err(StoreError::AlreadyExists(chat.clone()));
        }
        let mut record = ChatRecord::new(OffsetDateTime::now_utc());
        if let Some(text) = welcome.filter(|text| !text.trim().is_empty()) {
            record.push(Sender::System, text);
        }
        let summary = record.summary(chat);
        guard.insert(chat.clone(), record);
        Ok(summary)
    }

    async fn append(&self, chat: &ChatId, sender: Sender, content: &str) -> Result<Message> {
        let mut guard = self.inner.write().await;
        let record = guard
            .get_mut(chat)
            .ok_or_else(|| StoreError::NotFound(chat.clone()))?;
        if record.messages.len() >= self.max_history {
            return Err(StoreError::QuotaExceeded(chat.clone()));
        }
        if sender == Sender::User && record.status == ChatStatus::New {
            record.status = ChatStatus::InProgress;
        }
        Ok(record.push(sender, content))
    }

    async fn list_since(&self, chat: &ChatId, marker: Marker) -> Result<Vec<Message>> {
        let guard = self.inner.read().await;
        let record = guard
            .get(chat)
            .ok_or_else(|| StoreError::NotFound(chat.clone()))?;
        // seq is dense and 1-based, so the marker doubles as a slice offset.
        let start = usize::try_from(marker.seq()).unwrap_or(usize::MAX);
        Ok(record.messages.iter().skip(start).cloned().collect())
    }

    async fn summary(&self, chat: &ChatId) -> Result<ChatSummary> {
        let guard = self.inner.read().await;
        guard
            .get(chat)
            .map(|record| record.summary(chat))
            .ok_or_else(|| StoreError::NotFound(chat.clone()))
    }

    async fn list_chats(&self, filter: &ChatFilter) -> Result<Vec<ChatSummary>> {
        let guard = self.inner.read().await;
        let mut chats: Vec<ChatSummary> = guard
            .iter()
            .filter(|(_, record)| filter.matches(record))
            .map(|(chat, record)| record.summary(chat))
            .collect();
        let by_activity = filter.agent.is_some();
        chats.sort_by(|a, b| {
            let order = if by_activity {
                b.updated_at.cmp(&a.updated_at)
            } else {
                b.created_at.cmp(&a.created_at)
            };
            order.then_with(|| a.chat_id.cmp(&b.chat_id))
        });
        Ok(chats)
    }

    async fn set_assignment(
        &self,
        chat: &ChatId,
        agent: Option<AgentIdentity>,
    ) -> Result<ChatSummary> {
        let mut guard = self.inner.write().await;
        let record = guard
            .get_mut(chat)
            .ok_or_else(|| StoreError::NotFound(chat.clone()))?;
        if let (Some(current), Some(requested)) = (record.agent.as_ref(), agent.as_ref())
            && current != requested
        {
            return Err(StoreError::AlreadyAssigned {
                chat: chat.clone(),
                agent: current.clone(),
            });
        }
        if agent.is_some() {
            record.status = ChatStatus::InProgress;
        }
        record.agent = agent;
        record.updated_at = OffsetDateTime::now_utc();
        Ok(record.summary(chat))
    }
}

/// Creates a shared in-memory message store.
pub fn memory_store() -> SharedMessageStore {
    InMemoryMessageStore::shared()
}
