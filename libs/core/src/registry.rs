//! Chat → subscriber mapping.
//!
//! Each chat owns its own subscriber table behind a short, non-async lock, so
//! broadcasts for one chat are serialised while other chats proceed in
//! parallel on other `DashMap` shards. Nothing here awaits.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::DashMap;
use metrics::counter;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    delivery::{DeliveryCursor, DeliveryMode},
    types::{ChatEvent, ChatId, Marker, Message},
};

/// Write half of a live client connection.
pub type Connection = mpsc::UnboundedSender<ChatEvent>;
pub type ConnectionReceiver = mpsc::UnboundedReceiver<ChatEvent>;

pub fn connection() -> (Connection, ConnectionReceiver) {
    mpsc::unbounded_channel()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    chat: ChatId,
    id: SubscriptionId,
}

impl SubscriptionHandle {
    pub fn chat(&self) -> &ChatId {
        &self.chat
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

#[derive(Debug)]
pub(crate) struct Subscription {
    mode: DeliveryMode,
    cursor: DeliveryCursor,
    connection: Option<Connection>,
}

impl Subscription {
    pub(crate) fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub(crate) fn marker(&self) -> Marker {
        self.cursor.marker()
    }

    pub(crate) fn accept_page(&mut self, page: Vec<Message>) -> Vec<Message> {
        let delivered = self.cursor.accept_page(page);
        record_delivered(DeliveryMode::Poll, delivered.len());
        delivered
    }

    /// Admits a pushed message and writes whatever became deliverable to the
    /// connection. Returns `None` when the connection has gone away.
    pub(crate) fn push(&mut self, message: &Message) -> Option<Vec<Message>> {
        if self.mode != DeliveryMode::Push {
            return Some(Vec::new());
        }
        let delivered = self.cursor.accept(message.clone());
        for message in &delivered {
            self.write(ChatEvent::Message(message.clone()))?;
        }
        record_delivered(DeliveryMode::Push, delivered.len());
        Some(delivered)
    }

    fn write(&self, event: ChatEvent) -> Option<()> {
        match &self.connection {
            Some(connection) => connection.send(event).ok(),
            None => Some(()),
        }
    }
}

fn record_delivered(mode: DeliveryMode, count: usize) {
    if count > 0 {
        counter!("support_messages_delivered_total", "mode" => mode.as_str())
            .increment(count as u64);
    }
}

#[derive(Debug, Default)]
struct Channel {
    subscriptions: Mutex<HashMap<SubscriptionId, Subscription>>,
}

impl Channel {
    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: DashMap<ChatId, Arc<Channel>>,
    next_id: AtomicU64,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscription starting after `marker`. Poll subscriptions
    /// usually pass no connection; push subscriptions must.
    pub fn subscribe(
        &self,
        chat: &ChatId,
        mode: DeliveryMode,
        connection: Option<Connection>,
        marker: Marker,
    ) -> SubscriptionHandle {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let subscription = Subscription {
            mode,
            cursor: DeliveryCursor::new(marker),
            connection,
        };
        // Insert while holding the shard entry so a concurrent prune of an
        // empty channel cannot orphan this subscription.
        let entry = self.channels.entry(chat.clone()).or_default();
        entry.lock().insert(id, subscription);
        drop(entry);
        debug!(chat_id = %chat, subscription = %id, mode = mode.as_str(), "subscribed");
        SubscriptionHandle {
            chat: chat.clone(),
            id,
        }
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let removed = self
            .channel(&handle.chat)
            .map(|channel| channel.lock().remove(&handle.id).is_some())
            .unwrap_or(false);
        if removed {
            debug!(chat_id = %handle.chat, subscription = %handle.id, "unsubscribed");
            self.prune_channel(&handle.chat);
        }
        removed
    }

    /// Delivers `event` to every live subscription of `chat` and returns how
    /// many subscriptions accepted it. Connections that fail on write are
    /// dropped here rather than reported.
    pub fn broadcast(&self, chat: &ChatId, event: &ChatEvent) -> usize {
        let Some(channel) = self.channel(chat) else {
            return 0;
        };
        let mut accepted = 0usize;
        let mut dead = Vec::new();
        {
            let mut subscriptions = channel.lock();
            for (id, subscription) in subscriptions.iter_mut() {
                let outcome = match event {
                    ChatEvent::Message(message) => subscription.push(message).map(|_| ()),
                    other => subscription.write(other.clone()),
                };
                match outcome {
                    Some(()) => accepted += 1,
                    None => dead.push(*id),
                }
            }
            for id in &dead {
                subscriptions.remove(id);
            }
        }
        if !dead.is_empty() {
            counter!("support_connections_pruned_total").increment(dead.len() as u64);
            debug!(chat_id = %chat, pruned = dead.len(), "pruned failed connections");
            self.prune_channel(chat);
        }
        accepted
    }

    pub fn subscriber_count(&self, chat: &ChatId) -> usize {
        self.channel(chat)
            .map(|channel| channel.lock().len())
            .unwrap_or(0)
    }

    pub fn chat_count(&self) -> usize {
        self.channels.len()
    }

    /// Runs `f` against a subscription under its chat lock. Returns `None`
    /// when the subscription is gone.
    pub(crate) fn with_subscription<R>(
        &self,
        handle: &SubscriptionHandle,
        f: impl FnOnce(&mut Subscription) -> R,
    ) -> Option<R> {
        let channel = self.channel(&handle.chat)?;
        let mut subscriptions = channel.lock();
        subscriptions.get_mut(&handle.id).map(f)
    }

    pub(crate) fn remove_subscription(&self, handle: &SubscriptionHandle) {
        if let Some(channel) = self.channel(&handle.chat) {
            channel.lock().remove(&handle.id);
        }
        self.prune_channel(&handle.chat);
    }

    fn channel(&self, chat: &ChatId) -> Option<Arc<Channel>> {
        self.channels.get(chat).map(|entry| Arc::clone(entry.value()))
    }

    fn prune_channel(&self, chat: &ChatId) {
        self.channels
            .remove_if(chat, |_, channel| channel.lock().is_empty());
    }
}
