//! Admin-side queue notifications: new chats, and chats being taken or
//! released.

use tokio::sync::broadcast;

use crate::types::{AgentIdentity, ChatId, ChatSummary};

const QUEUE_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueueEvent {
    NewChat(ChatSummary),
    ChatTaken { chat_id: ChatId, agent: AgentIdentity },
    ChatReleased { chat_id: ChatId },
}

impl QueueEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            QueueEvent::NewChat(_) => "new_chat",
            QueueEvent::ChatTaken { .. } => "chat_taken",
            QueueEvent::ChatReleased { .. } => "chat_released",
        }
    }
}

/// Fan-out of [`QueueEvent`]s to every connected admin panel. Slow listeners
/// lose the oldest events rather than holding up publishers.
#[derive(Debug)]
pub struct QueueFeed {
    sender: broadcast::Sender<QueueEvent>,
}

impl QueueFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    /// Returns how many listeners the event reached.
    pub fn publish(&self, event: QueueEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for QueueFeed {
    fn default() -> Self {
        Self::new(QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_listeners_is_dropped() {
        let feed = QueueFeed::default();
        let chat_id = ChatId::parse("C1").unwrap();
        assert_eq!(feed.publish(QueueEvent::ChatReleased { chat_id }), 0);
    }

    #[tokio::test]
    async fn lagging_listener_skips_ahead() {
        let feed = QueueFeed::new(2);
        let mut rx = feed.subscribe();
        for n in 0..4 {
            let chat_id = ChatId::parse(&format!("C{n}")).unwrap();
            assert_eq!(feed.publish(QueueEvent::ChatReleased { chat_id }), 1);
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(2))
        ));
        assert_eq!(
            rx.recv().await.unwrap(),
            QueueEvent::ChatReleased {
                chat_id: ChatId::parse("C2").unwrap()
            }
        );
    }
}
