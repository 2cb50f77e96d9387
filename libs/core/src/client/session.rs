//! Client-side chat session.
//!
//! A session drives one chat through `Connecting -> Live`, falls back to
//! `Degraded` polling when the push connection drops, and keeps retrying the
//! push connection from there. Every message, pushed or polled, goes through
//! one [`DeliveryCursor`], so the consumer sees each message exactly once and
//! in sequence order.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::AbortHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{Instrument, debug, info, warn};

use super::{
    retry::RetryFailure,
    transport::{PushStream, SharedTransport, TransportError},
};
use crate::{
    config::SessionConfig,
    coordinator::PollPage,
    delivery::{DeliveryCursor, DeliveryMode},
    labels::IdentityView,
    telemetry,
    types::{AgentIdentity, ChatEvent, ChatId, Marker, Message},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Live,
    Degraded,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Live => "live",
            SessionState::Degraded => "degraded",
            SessionState::Closed => "closed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Message(Message),
    IdentityUpdate(AgentIdentity),
    Release,
    State(SessionState),
    Reconnecting { consecutive_failures: u32 },
    Closed { reason: Option<String> },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("message content is empty")]
    EmptyMessage,
    #[error("session is closed")]
    Closed,
    #[error("chat is not reachable: {0}")]
    Application(#[source] TransportError),
    #[error("poll failed after {attempts} attempts")]
    DeliveryFailed {
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("failed to send message")]
    SendFailed {
        /// The unsent text, so the caller can offer it again.
        text: String,
        #[source]
        source: TransportError,
    },
}

pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

struct Progress {
    cursor: DeliveryCursor,
    state: SessionState,
    identity: IdentityView,
}

struct Shared {
    chat: ChatId,
    transport: SharedTransport,
    config: SessionConfig,
    progress: Mutex<Progress>,
    events: mpsc::UnboundedSender<SessionEvent>,
    acked: watch::Sender<Marker>,
    closed: watch::Sender<bool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        // a consumer that dropped its receiver simply stops listening
        let _ = self.events.send(event);
    }

    fn marker(&self) -> Marker {
        self.lock().cursor.marker()
    }

    fn state(&self) -> SessionState {
        self.lock().state
    }

    fn held(&self) -> usize {
        self.lock().cursor.held()
    }

    fn set_state(&self, next: SessionState) {
        let mut progress = self.lock();
        if progress.state == next || progress.state == SessionState::Closed {
            return;
        }
        debug!(from = progress.state.as_str(), to = next.as_str(), "session state change");
        progress.state = next;
        self.emit(SessionEvent::State(next));
    }

    /// Moves to `Closed` once; later calls are no-ops.
    fn close(&self, reason: Option<String>) {
        let mut progress = self.lock();
        if progress.state == SessionState::Closed {
            return;
        }
        progress.state = SessionState::Closed;
        self.closed.send_replace(true);
        self.emit(SessionEvent::State(SessionState::Closed));
        self.emit(SessionEvent::Closed { reason });
    }

    /// Feeds one pushed event through the cursor and returns how many
    /// messages are still held back behind a gap.
    fn deliver(&self, event: ChatEvent) -> usize {
        let mut progress = self.lock();
        if progress.state == SessionState::Closed {
            return 0;
        }
        match event {
            ChatEvent::Message(message) => {
                for message in progress.cursor.accept(message) {
                    self.emit(SessionEvent::Message(message));
                }
                self.acked.send_replace(progress.cursor.marker());
            }
            other => {
                if progress.identity.apply(&other) {
                    self.emit(identity_event(progress.identity.agent()));
                }
            }
        }
        progress.cursor.held()
    }

    /// Poll pages are authoritative for both messages and identity. Returns
    /// false when the session closed while the page was in flight.
    fn deliver_page(&self, page: PollPage) -> bool {
        let mut progress = self.lock();
        if progress.state == SessionState::Closed {
            return false;
        }
        for message in progress.cursor.accept_page(page.messages) {
            self.emit(SessionEvent::Message(message));
        }
        self.acked.send_replace(progress.cursor.marker());
        if progress.identity.agent() != page.agent.as_ref() {
            progress.identity.set_agent(page.agent);
            self.emit(identity_event(progress.identity.agent()));
        }
        true
    }

    /// Polls from the current marker. Closing the session cancels the poll.
    async fn poll_once(&self) -> Result<(), SessionError> {
        let marker = self.marker();
        let mut closed = self.closed.subscribe();
        let page = tokio::select! {
            page = self.config.retry.run(move |_| self.transport.poll(&self.chat, marker)) => page,
            () = async {
                let _ = closed.wait_for(|closed| *closed).await;
            } => return Err(SessionError::Closed),
        };
        match page {
            Ok(page) => {
                if self.deliver_page(page) {
                    Ok(())
                } else {
                    Err(SessionError::Closed)
                }
            }
            Err(RetryFailure { attempts, error }) if error.is_transient() => {
                Err(SessionError::DeliveryFailed {
                    attempts,
                    source: error,
                })
            }
            Err(RetryFailure { error, .. }) => Err(SessionError::Application(error)),
        }
    }
}

fn identity_event(agent: Option<&AgentIdentity>) -> SessionEvent {
    match agent {
        Some(agent) => SessionEvent::IdentityUpdate(agent.clone()),
        None => SessionEvent::Release,
    }
}

/// A live subscription to one chat from the client's side.
///
/// Dropping the session stops its background driver.
pub struct ClientSession {
    shared: Arc<Shared>,
    driver: AbortHandle,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("chat", &self.shared.chat)
            .field("state", &self.shared.state())
            .field("marker", &self.shared.marker())
            .finish_non_exhaustive()
    }
}

impl ClientSession {
    /// Starts a session at marker zero. Must be called inside a Tokio runtime.
    pub fn open(
        chat: ChatId,
        transport: SharedTransport,
        config: SessionConfig,
    ) -> (Self, SessionEvents) {
        Self::resume(chat, transport, config, Marker::ZERO)
    }

    /// Starts a session that has already seen everything up to `marker`.
    pub fn resume(
        chat: ChatId,
        transport: SharedTransport,
        config: SessionConfig,
        marker: Marker,
    ) -> (Self, SessionEvents) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (acked, _) = watch::channel(marker);
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            chat,
            transport,
            config,
            progress: Mutex::new(Progress {
                cursor: DeliveryCursor::new(marker),
                state: SessionState::Disconnected,
                identity: IdentityView::default(),
            }),
            events,
            acked,
            closed,
        });
        let span = telemetry::span_for_session(&shared.chat);
        let driver = tokio::spawn(drive(Arc::clone(&shared)).instrument(span)).abort_handle();
        (Self { shared, driver }, receiver)
    }

    pub fn chat(&self) -> &ChatId {
        &self.shared.chat
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn marker(&self) -> Marker {
        self.shared.marker()
    }

    pub fn agent(&self) -> Option<AgentIdentity> {
        self.shared.lock().identity.agent().cloned()
    }

    /// Sends `text` and waits for it to come back through the delivery path.
    ///
    /// If no acknowledgement arrives within the ack timeout a reconciliation
    /// poll is run instead; the message is never re-sent.
    pub async fn send(&self, text: &str) -> Result<Message, SessionError> {
        if text.trim().is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        if self.shared.state() == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        let mut acked = self.shared.acked.subscribe();
        let message = self
            .shared
            .transport
            .send(&self.shared.chat, text)
            .await
            .map_err(|source| SessionError::SendFailed {
                text: text.to_string(),
                source,
            })?;

        let target = message.marker();
        let acknowledged = matches!(
            time::timeout(
                self.shared.config.ack_timeout,
                acked.wait_for(|marker| *marker >= target),
            )
            .await,
            Ok(Ok(_))
        );
        if !acknowledged {
            debug!(seq = message.seq, "no acknowledgement, reconciling by poll");
            match self.shared.poll_once().await {
                Ok(()) | Err(SessionError::Closed) => {}
                Err(err) => warn!(error = %err, "reconciliation poll failed"),
            }
        }
        Ok(message)
    }

    /// Runs one poll immediately, regardless of the current state.
    pub async fn poll_now(&self) -> Result<(), SessionError> {
        if self.shared.state() == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        self.shared.poll_once().await
    }

    pub fn close(&self) {
        self.driver.abort();
        self.shared.close(None);
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

async fn drive(shared: Arc<Shared>) {
    let mut failures = 0u32;
    loop {
        // reconnect attempts from Degraded stay Degraded until push is back
        if shared.state() != SessionState::Degraded {
            shared.set_state(SessionState::Connecting);
        }
        match shared
            .transport
            .connect_push(&shared.chat, shared.marker())
            .await
        {
            Ok(stream) => {
                failures = 0;
                if let Err(err) = reconcile(&shared).await {
                    shared.close(Some(err.to_string()));
                    return;
                }
                shared.set_state(SessionState::Live);
                info!(marker = %shared.marker(), "session live");
                if let Err(err) = run_live(&shared, stream).await {
                    shared.close(Some(err.to_string()));
                    return;
                }
                warn!("push connection dropped, falling back to polling");
            }
            Err(err) if err.is_transient() => {
                failures += 1;
                warn!(error = %err, failures, "push connection failed");
                shared.emit(SessionEvent::Reconnecting {
                    consecutive_failures: failures,
                });
            }
            Err(err) => {
                shared.close(Some(SessionError::Application(err).to_string()));
                return;
            }
        }

        if let Err(err) = run_degraded(&shared, &mut failures).await {
            shared.close(Some(err.to_string()));
            return;
        }
    }
}

/// Catches up by poll before going live. Transient failures are left to the
/// push backlog replay.
async fn reconcile(shared: &Shared) -> Result<(), SessionError> {
    match shared.poll_once().await {
        Err(SessionError::DeliveryFailed { attempts, source }) => {
            debug!(attempts, error = %source, "reconciliation poll failed");
            Ok(())
        }
        other => other,
    }
}

/// Feeds the push stream into the cursor until it ends. A push that skips
/// ahead starts the gap timer; if the missing messages have not arrived by
/// then, a poll fills the gap.
async fn run_live(shared: &Shared, mut stream: PushStream) -> Result<(), SessionError> {
    let gap_timeout = shared.config.gap_timeout;
    let mut gap_deadline: Option<Instant> = None;
    loop {
        tokio::select! {
            item = stream.next() => {
                let Some(item) = item else { break };
                match item {
                    Ok(event) => {
                        let held = shared.deliver(event);
                        gap_deadline = match (held, gap_deadline) {
                            (0, _) => None,
                            (_, Some(deadline)) => Some(deadline),
                            (_, None) => Some(Instant::now() + gap_timeout),
                        };
                    }
                    Err(err) if err.is_transient() => {
                        debug!(error = %err, "push stream error");
                        break;
                    }
                    Err(err) => return Err(SessionError::Application(err)),
                }
            }
            _ = time::sleep_until(gap_deadline.unwrap_or_else(Instant::now)), if gap_deadline.is_some() => {
                debug!(marker = %shared.marker(), "push gap did not close, polling");
                gap_deadline = match shared.poll_once().await {
                    Ok(()) if shared.held() == 0 => None,
                    Ok(()) => Some(Instant::now() + gap_timeout),
                    Err(SessionError::DeliveryFailed { attempts, source }) => {
                        warn!(attempts, error = %source, "gap poll gave up");
                        Some(Instant::now() + gap_timeout)
                    }
                    Err(err) => return Err(err),
                };
            }
        }
    }
    Ok(())
}

/// Polls right away and then every poll interval until it is time to try the
/// push connection again. Only non-transient failures end the session.
async fn run_degraded(shared: &Shared, failures: &mut u32) -> Result<(), SessionError> {
    shared.set_state(SessionState::Degraded);
    degraded_poll(shared, failures).await?;

    let config = &shared.config;
    let reconnect_at = Instant::now() + config.reconnect_interval;
    let mut ticker = time::interval_at(Instant::now() + config.poll_interval, config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = time::sleep_until(reconnect_at) => return Ok(()),
            _ = ticker.tick() => degraded_poll(shared, failures).await?,
        }
    }
}

async fn degraded_poll(shared: &Shared, failures: &mut u32) -> Result<(), SessionError> {
    match shared.poll_once().await {
        Err(SessionError::DeliveryFailed { attempts, source }) => {
            *failures += 1;
            warn!(attempts, error = %source, mode = DeliveryMode::Poll.as_str(), "poll gave up");
            shared.emit(SessionEvent::Reconnecting {
                consecutive_failures: *failures,
            });
            Ok(())
        }
        other => other,
    }
}
