use std::{sync::Arc, time::Instant};

use dashmap::DashMap;
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{Instrument, debug, warn};

use crate::{
    delivery::DeliveryMode,
    queue::{QueueEvent, QueueFeed},
    registry::{ChannelRegistry, Connection, SubscriptionHandle},
    store::{SharedMessageStore, StoreError},
    telemetry,
    types::{AgentIdentity, ChatEvent, ChatId, ChatSummary, Marker, Message, Sender},
};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("subscription is no longer registered")]
    UnknownSubscription,
    #[error("message content is empty")]
    EmptyMessage,
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Result of opening a subscription: the registration plus the backlog that
/// was admitted through its cursor while it was being set up.
#[derive(Debug)]
pub struct Opened {
    pub guard: SubscriptionGuard,
    pub backlog: Vec<Message>,
    pub agent: Option<AgentIdentity>,
}

/// Stateless poll result used by the HTTP surface, where the marker lives on
/// the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollPage {
    pub messages: Vec<Message>,
    pub agent: Option<AgentIdentity>,
}

/// Exclusive turn on one chat's sequencer. The map entry is dropped again
/// once no other caller is holding or waiting for it.
pub(crate) struct SequencerTurn<'a> {
    sequencers: &'a DashMap<ChatId, Arc<AsyncMutex<()>>>,
    chat: ChatId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SequencerTurn<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // clones are only handed out under the shard lock, so a count of one
        // means nobody is queued behind us
        self.sequencers
            .remove_if(&self.chat, |_, sequencer| Arc::strong_count(sequencer) == 1);
    }
}

/// Unregisters its subscription on drop.
#[derive(Debug)]
pub struct SubscriptionGuard {
    coordinator: Arc<DeliveryCoordinator>,
    handle: SubscriptionHandle,
}

impl SubscriptionGuard {
    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.coordinator.registry.remove_subscription(&self.handle);
    }
}

/// Decides what each subscription receives and when its marker advances.
///
/// Every append, assignment change and backlog replay for a chat runs under
/// that chat's sequencer, so events of one chat are processed one at a time
/// while different chats run concurrently.
pub struct DeliveryCoordinator {
    store: SharedMessageStore,
    registry: ChannelRegistry,
    queue: QueueFeed,
    sequencers: DashMap<ChatId, Arc<AsyncMutex<()>>>,
}

impl std::fmt::Debug for DeliveryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryCoordinator")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl DeliveryCoordinator {
    pub fn new(store: SharedMessageStore) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry: ChannelRegistry::new(),
            queue: QueueFeed::default(),
            sequencers: DashMap::new(),
        })
    }

    pub fn store(&self) -> &SharedMessageStore {
        &self.store
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Admin-side feed of queue changes.
    pub fn queue(&self) -> &QueueFeed {
        &self.queue
    }

    pub(crate) async fn turn(&self, chat: &ChatId) -> SequencerTurn<'_> {
        let sequencer = Arc::clone(self.sequencers.entry(chat.clone()).or_default().value());
        let guard = sequencer.lock_owned().await;
        SequencerTurn {
            sequencers: &self.sequencers,
            chat: chat.clone(),
            guard: Some(guard),
        }
    }

    /// Creates the chat, posting `welcome` first when given, and announces it
    /// on the queue feed.
    pub async fn create(&self, chat: &ChatId, welcome: Option<&str>) -> Result<ChatSummary> {
        let summary = self.store.create(chat, welcome).await?;
        let listeners = self.queue.publish(QueueEvent::NewChat(summary.clone()));
        debug!(chat_id = %chat, listeners, "chat created");
        Ok(summary)
    }

    /// Registers a subscription after `since` and replays the store backlog
    /// through it. Works for chats with no messages yet (empty backlog).
    pub async fn open(
        self: &Arc<Self>,
        chat: &ChatId,
        mode: DeliveryMode,
        connection: Option<Connection>,
        since: Marker,
    ) -> Result<Opened> {
        let span = telemetry::span_for_chat("subscription.open", chat);
        async {
            let _turn = self.turn(chat).await;
            let summary = self.store.summary(chat).await?;
            let handle = self.registry.subscribe(chat, mode, connection, since);
            let guard = SubscriptionGuard {
                coordinator: Arc::clone(self),
                handle,
            };
            let page = self.store.list_since(chat, since).await?;
            let backlog = self
                .registry
                .with_subscription(guard.handle(), |sub| sub.accept_page(page))
                .ok_or(CoordinatorError::UnknownSubscription)?;
            debug!(
                mode = mode.as_str(),
                backlog = backlog.len(),
                "subscription opened"
            );
            Ok(Opened {
                guard,
                backlog,
                agent: summary.agent_name,
            })
        }
        .instrument(span)
        .await
    }

    /// Returns every message newer than the subscription's marker and
    /// advances the marker past them. Dropping the future before it resolves
    /// leaves the marker untouched.
    pub async fn poll(&self, handle: &SubscriptionHandle) -> Result<Vec<Message>> {
        let started = Instant::now();
        let marker = self
            .registry
            .with_subscription(handle, |sub| sub.marker())
            .ok_or(CoordinatorError::UnknownSubscription)?;
        let span = telemetry::span_for_delivery("poll", handle.chat(), marker.seq());
        async {
            let page = self.store.list_since(handle.chat(), marker).await?;
            let delivered = self
                .registry
                .with_subscription(handle, |sub| sub.accept_page(page))
                .ok_or(CoordinatorError::UnknownSubscription)?;
            histogram!("support_poll_latency_seconds", "path" => "subscription")
                .record(started.elapsed().as_secs_f64());
            debug!(delivered = delivered.len(), "subscription polled");
            Ok(delivered)
        }
        .instrument(span)
        .await
    }

    /// Stateless variant of [`poll`](Self::poll) for callers that track the
    /// marker themselves.
    pub async fn poll_since(&self, chat: &ChatId, marker: Marker) -> Result<PollPage> {
        let started = Instant::now();
        let span = telemetry::span_for_delivery("poll_since", chat, marker.seq());
        async {
            let messages = self.store.list_since(chat, marker).await?;
            let agent = self.store.summary(chat).await?.agent_name;
            histogram!("support_poll_latency_seconds", "path" => "stateless")
                .record(started.elapsed().as_secs_f64());
            Ok(PollPage { messages, agent })
        }
        .instrument(span)
        .await
    }

    /// Offers a freshly appended message to one subscription. Poll-mode
    /// subscriptions ignore it; push-mode ones only deliver it when it is
    /// strictly newer than their marker.
    pub fn push(&self, handle: &SubscriptionHandle, message: &Message) -> Result<Vec<Message>> {
        match self.registry.with_subscription(handle, |sub| {
            (sub.mode(), sub.push(message))
        }) {
            Some((_, Some(delivered))) => Ok(delivered),
            Some((mode, None)) => {
                warn!(subscription = %handle.id(), mode = mode.as_str(), "connection closed during push");
                self.registry.remove_subscription(handle);
                Err(CoordinatorError::UnknownSubscription)
            }
            None => Err(CoordinatorError::UnknownSubscription),
        }
    }

    /// Appends to the store and fans the stored message out to every push
    /// subscriber of the chat.
    pub async fn append(&self, chat: &ChatId, sender: Sender, content: &str) -> Result<Message> {
        if content.trim().is_empty() {
            return Err(CoordinatorError::EmptyMessage);
        }
        let span = telemetry::span_for_chat("message.append", chat);
        async {
            let _turn = self.turn(chat).await;
            let message = self.store.append(chat, sender, content).await?;
            counter!("support_messages_appended_total", "sender" => sender.as_str()).increment(1);
            let reached = self
                .registry
                .broadcast(chat, &ChatEvent::Message(message.clone()));
            debug!(seq = message.seq, subscribers = reached, "message appended");
            Ok(message)
        }
        .instrument(span)
        .await
    }

    pub fn close(&self, guard: SubscriptionGuard) {
        drop(guard);
    }
}
