//! Real-time delivery for support chats: a per-chat channel registry over a
//! message store, marker-based push/poll delivery, agent presence, and the
//! client session that consumes it all.

pub mod client;
pub mod config;
pub mod coordinator;
pub mod delivery;
pub mod labels;
pub mod presence;
pub mod queue;
pub mod registry;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod wire;

pub use client::{
    ChatTransport, ClientSession, HttpTransport, LocalTransport, RetryPolicy, SessionError,
    SessionEvent, SessionEvents, SessionState, SharedTransport, TransportError,
};
pub use config::{GatewayConfig, SessionConfig};
pub use coordinator::{CoordinatorError, DeliveryCoordinator, Opened, PollPage, SubscriptionGuard};
pub use delivery::{DeliveryCursor, DeliveryMode};
pub use labels::{IdentityView, RenderedLine, Transcript};
pub use presence::PresenceBroadcaster;
pub use queue::{QueueEvent, QueueFeed};
pub use registry::{ChannelRegistry, SubscriptionHandle, SubscriptionId};
pub use server::{ApiError, GatewayState, router};
pub use store::{
    ChatFilter, InMemoryMessageStore, MessageStore, SharedMessageStore, StoreError, memory_store,
};
pub use types::{
    AgentIdentity, ChatEvent, ChatId, ChatStatus, ChatSummary, IdentityUpdate, InvalidChatId,
    Marker, Message, Sender,
};
