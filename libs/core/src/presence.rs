//! Agent assignment and release, announced to every live subscriber.

use std::sync::Arc;

use tracing::{Instrument, info};

use crate::{
    coordinator::{DeliveryCoordinator, Result},
    telemetry,
    queue::QueueEvent,
    types::{AgentIdentity, ChatEvent, ChatId, ChatSummary, IdentityUpdate},
};

#[derive(Clone, Debug)]
pub struct PresenceBroadcaster {
    coordinator: Arc<DeliveryCoordinator>,
}

impl PresenceBroadcaster {
    pub fn new(coordinator: Arc<DeliveryCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Assigns `agent` to the chat and announces it. Re-assigning the same
    /// agent re-announces; a chat held by another agent is rejected.
    pub async fn assign(&self, chat: &ChatId, agent: AgentIdentity) -> Result<ChatSummary> {
        let span = telemetry::span_for_chat("presence.assign", chat);
        async {
            let _turn = self.coordinator.turn(chat).await;
            let summary = self
                .coordinator
                .store()
                .set_assignment(chat, Some(agent.clone()))
                .await?;
            let reached = self.coordinator.registry().broadcast(
                chat,
                &ChatEvent::IdentityUpdate(IdentityUpdate {
                    agent: agent.clone(),
                }),
            );
            self.coordinator.queue().publish(QueueEvent::ChatTaken {
                chat_id: chat.clone(),
                agent: agent.clone(),
            });
            info!(agent = agent.name(), subscribers = reached, "agent assigned");
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    /// Clears the assignment and tells subscribers to fall back to the
    /// anonymous support label.
    pub async fn release(&self, chat: &ChatId) -> Result<ChatSummary> {
        let span = telemetry::span_for_chat("presence.release", chat);
        async {
            let _turn = self.coordinator.turn(chat).await;
            let summary = self.coordinator.store().set_assignment(chat, None).await?;
            let reached = self
                .coordinator
                .registry()
                .broadcast(chat, &ChatEvent::Release);
            self.coordinator.queue().publish(QueueEvent::ChatReleased {
                chat_id: chat.clone(),
            });
            info!(subscribers = reached, "agent released");
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    pub async fn current(&self, chat: &ChatId) -> Result<Option<AgentIdentity>> {
        Ok(self.coordinator.store().summary(chat).await?.agent_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        coordinator::CoordinatorError,
        delivery::DeliveryMode,
        registry::connection,
        store::{InMemoryMessageStore, StoreError},
        types::{Marker, Sender},
    };

    async fn setup() -> (Arc<DeliveryCoordinator>, PresenceBroadcaster, ChatId) {
        let chat = ChatId::parse("C1").unwrap();
        let store = InMemoryMessageStore::shared();
        store.create(&chat, None).await.unwrap();
        let coordinator = DeliveryCoordinator::new(store);
        let presence = PresenceBroadcaster::new(Arc::clone(&coordinator));
        (coordinator, presence, chat)
    }

    #[tokio::test]
    async fn assign_then_release_reaches_every_subscriber() {
        let (coordinator, presence, chat) = setup().await;
        let (tx_a, mut rx_a) = connection();
        let (tx_b, mut rx_b) = connection();
        let _a = coordinator
            .open(&chat, DeliveryMode::Push, Some(tx_a), Marker::ZERO)
            .await
            .unwrap();
        let _b = coordinator
            .open(&chat, DeliveryMode::Push, Some(tx_b), Marker::ZERO)
            .await
            .unwrap();
        let support = coordinator
            .append(&chat, Sender::Support, "hello")
            .await
            .unwrap();

        let smith = AgentIdentity::new("Agent Smith").unwrap();
        presence.assign(&chat, smith.clone()).await.unwrap();
        presence.release(&chat).await.unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            assert_eq!(rx.recv().await, Some(ChatEvent::Message(support.clone())));
            assert_eq!(
                rx.recv().await,
                Some(ChatEvent::IdentityUpdate(IdentityUpdate {
                    agent: smith.clone()
                }))
            );
            assert_eq!(rx.recv().await, Some(ChatEvent::Release));
        }

        // the stored sender never changes
        let stored = coordinator
            .store()
            .list_since(&chat, Marker::ZERO)
            .await
            .unwrap();
        assert_eq!(stored[0].sender, Sender::Support);
        assert!(presence.current(&chat).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn taken_chat_rejects_other_agent() {
        let (_coordinator, presence, chat) = setup().await;
        presence
            .assign(&chat, AgentIdentity::new("Agent Smith").unwrap())
            .await
            .unwrap();
        let err = presence
            .assign(&chat, AgentIdentity::new("Agent Jones").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::Store(StoreError::AlreadyAssigned { .. })
        ));
        assert_eq!(
            presence.current(&chat).await.unwrap().unwrap().name(),
            "Agent Smith"
        );
    }

    #[tokio::test]
    async fn queue_hears_take_and_release() {
        let (coordinator, presence, chat) = setup().await;
        let mut queue = coordinator.queue().subscribe();
        let smith = AgentIdentity::new("Agent Smith").unwrap();
        presence.assign(&chat, smith.clone()).await.unwrap();
        assert!(
            presence
                .assign(&chat, AgentIdentity::new("Agent Jones").unwrap())
                .await
                .is_err()
        );
        presence.release(&chat).await.unwrap();

        assert_eq!(
            queue.recv().await.unwrap(),
            QueueEvent::ChatTaken {
                chat_id: chat.clone(),
                agent: smith
            }
        );
        assert_eq!(
            queue.recv().await.unwrap(),
            QueueEvent::ChatReleased { chat_id: chat }
        );
    }

    #[tokio::test]
    async fn open_reports_current_agent() {
        let (coordinator, presence, chat) = setup().await;
        presence
            .assign(&chat, AgentIdentity::new("Agent Smith").unwrap())
            .await
            .unwrap();
        let opened = coordinator
            .open(&chat, DeliveryMode::Poll, None, Marker::ZERO)
            .await
            .unwrap();
        assert_eq!(opened.agent.unwrap().name(), "Agent Smith");
    }
}
