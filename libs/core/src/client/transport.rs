use std::sync::Arc;

use async_trait::async_trait;
use futures::{
    StreamExt,
    stream::{self, BoxStream},
};
use http::StatusCode;
use thiserror::Error;

use crate::{
    coordinator::{CoordinatorError, DeliveryCoordinator, Opened, PollPage},
    delivery::DeliveryMode,
    registry::connection,
    store::StoreError,
    types::{ChatEvent, ChatId, IdentityUpdate, Marker, Message, Sender},
};

#[derive(Clone, Debug, Error)]
pub enum TransportError {
    #[error("transient transport failure: {0}")]
    Transient(String),
    #[error("request rejected with status {status}: {message}")]
    Application { status: StatusCode, message: String },
    #[error("message store failure: {0}")]
    Store(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }

    /// Poll failures caused by the backend store are worth retrying.
    pub fn for_poll(self) -> Self {
        match self {
            TransportError::Store(message) => TransportError::Transient(message),
            other => other,
        }
    }
}

impl From<CoordinatorError> for TransportError {
    fn from(err: CoordinatorError) -> Self {
        let message = err.to_string();
        match err {
            CoordinatorError::UnknownSubscription => TransportError::Transient(message),
            CoordinatorError::EmptyMessage => TransportError::Application {
                status: StatusCode::BAD_REQUEST,
                message,
            },
            CoordinatorError::Store(store) => match store {
                StoreError::NotFound(_) => TransportError::Application {
                    status: StatusCode::NOT_FOUND,
                    message,
                },
                StoreError::AlreadyExists(_) | StoreError::AlreadyAssigned { .. } => {
                    TransportError::Application {
                        status: StatusCode::CONFLICT,
                        message,
                    }
                }
                StoreError::QuotaExceeded(_) => TransportError::Application {
                    status: StatusCode::TOO_MANY_REQUESTS,
                    message,
                },
                StoreError::Internal(_) => TransportError::Store(message),
            },
        }
    }
}

/// Events from a live push connection. The stream ending means the
/// connection dropped.
pub type PushStream = BoxStream<'static, Result<ChatEvent, TransportError>>;

/// The client's view of the backend: a push channel, a poll endpoint and a
/// send endpoint.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Opens a push connection. Messages after `since` are replayed first.
    async fn connect_push(&self, chat: &ChatId, since: Marker) -> Result<PushStream, TransportError>;
    async fn poll(&self, chat: &ChatId, since: Marker) -> Result<PollPage, TransportError>;
    async fn send(&self, chat: &ChatId, content: &str) -> Result<Message, TransportError>;
}

pub type SharedTransport = Arc<dyn ChatTransport>;

/// In-process transport backed directly by a [`DeliveryCoordinator`].
#[derive(Clone, Debug)]
pub struct LocalTransport {
    coordinator: Arc<DeliveryCoordinator>,
    sender: Sender,
}

impl LocalTransport {
    pub fn new(coordinator: Arc<DeliveryCoordinator>) -> Self {
        Self {
            coordinator,
            sender: Sender::User,
        }
    }

    /// Sends as the support side instead of the user.
    pub fn as_support(mut self) -> Self {
        self.sender = Sender::Support;
        self
    }

    pub fn shared(self) -> SharedTransport {
        Arc::new(self)
    }
}

#[async_trait]
impl ChatTransport for LocalTransport {
    async fn connect_push(&self, chat: &ChatId, since: Marker) -> Result<PushStream, TransportError> {
        let (tx, rx) = connection();
        let Opened {
            guard,
            backlog,
            agent,
        } = self
            .coordinator
            .open(chat, DeliveryMode::Push, Some(tx), since)
            .await?;

        let mut head = Vec::with_capacity(backlog.len() + 1);
        if let Some(agent) = agent {
            head.push(ChatEvent::IdentityUpdate(IdentityUpdate { agent }));
        }
        head.extend(backlog.into_iter().map(ChatEvent::Message));

        // the guard rides along with the receiver so the subscription lives
        // exactly as long as the stream
        let live = stream::unfold((rx, guard), |(mut rx, guard)| async move {
            let event = rx.recv().await?;
            Some((Ok(event), (rx, guard)))
        });
        Ok(stream::iter(head.into_iter().map(Ok)).chain(live).boxed())
    }

    async fn poll(&self, chat: &ChatId, since: Marker) -> Result<PollPage, TransportError> {
        self.coordinator
            .poll_since(chat, since)
            .await
            .map_err(|err| TransportError::from(err).for_poll())
    }

    async fn send(&self, chat: &ChatId, content: &str) -> Result<Message, TransportError> {
        Ok(self.coordinator.append(chat, self.sender, content).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        presence::PresenceBroadcaster, store::InMemoryMessageStore, types::AgentIdentity,
    };

    async fn setup() -> (Arc<DeliveryCoordinator>, ChatId) {
        let chat = ChatId::parse("local").unwrap();
        let store = InMemoryMessageStore::shared();
        store.create(&chat, None).await.unwrap();
        (DeliveryCoordinator::new(store), chat)
    }

    #[tokio::test]
    async fn push_stream_starts_with_identity_and_backlog() {
        let (coordinator, chat) = setup().await;
        coordinator.append(&chat, Sender::User, "hi").await.unwrap();
        PresenceBroadcaster::new(Arc::clone(&coordinator))
            .assign(&chat, AgentIdentity::new("Agent Smith").unwrap())
            .await
            .unwrap();

        let transport = LocalTransport::new(Arc::clone(&coordinator));
        let mut stream = transport.connect_push(&chat, Marker::ZERO).await.unwrap();
        assert!(matches!(
            stream.next().await,
            Some(Ok(ChatEvent::IdentityUpdate(ref update))) if update.agent.name() == "Agent Smith"
        ));
        assert!(matches!(
            stream.next().await,
            Some(Ok(ChatEvent::Message(ref m))) if m.content == "hi"
        ));

        transport.clone().as_support().send(&chat, "hello").await.unwrap();
        assert!(matches!(
            stream.next().await,
            Some(Ok(ChatEvent::Message(ref m))) if m.sender == Sender::Support
        ));
    }

    #[tokio::test]
    async fn dropping_stream_unsubscribes() {
        let (coordinator, chat) = setup().await;
        let transport = LocalTransport::new(Arc::clone(&coordinator));
        let stream = transport.connect_push(&chat, Marker::ZERO).await.unwrap();
        assert_eq!(coordinator.registry().subscriber_count(&chat), 1);
        drop(stream);
        assert_eq!(coordinator.registry().subscriber_count(&chat), 0);
    }

    #[tokio::test]
    async fn unknown_chat_is_an_application_error() {
        let (coordinator, _) = setup().await;
        let transport = LocalTransport::new(coordinator);
        let err = transport
            .poll(&ChatId::parse("missing").unwrap(), Marker::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Application { status, .. } if status == StatusCode::NOT_FOUND
        ));
    }
}
