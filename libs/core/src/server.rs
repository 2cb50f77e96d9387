//! Axum routes for the support chat gateway.

use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::{
        Path, Query,
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::{
    config::GatewayConfig,
    coordinator::{CoordinatorError, DeliveryCoordinator, Opened},
    delivery::DeliveryMode,
    presence::PresenceBroadcaster,
    queue::QueueEvent,
    registry::{ConnectionReceiver, connection},
    store::{ChatFilter, StoreError},
    types::{
        AgentIdentity, ChatEvent, ChatId, ChatStatus, ChatSummary, IdentityUpdate, InvalidChatId,
        Marker, Sender,
    },
    wire::{
        AssignRequest, Availability, PollResponse, QueueWireEvent, SendRequest, WireEvent,
        WireMessage,
    },
};

const SEND_FAILURE_THRESHOLD: u32 = 5;

#[derive(Clone, Debug)]
pub struct GatewayState {
    pub coordinator: Arc<DeliveryCoordinator>,
    pub presence: PresenceBroadcaster,
    pub config: GatewayConfig,
}

impl GatewayState {
    pub fn new(coordinator: Arc<DeliveryCoordinator>, config: GatewayConfig) -> Self {
        Self {
            presence: PresenceBroadcaster::new(Arc::clone(&coordinator)),
            coordinator,
            config,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

impl From<InvalidChatId> for ApiError {
    fn from(err: InvalidChatId) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Coordinator(CoordinatorError::Store(err))
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Coordinator(CoordinatorError::EmptyMessage) => StatusCode::BAD_REQUEST,
            ApiError::Coordinator(CoordinatorError::UnknownSubscription) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Coordinator(CoordinatorError::Store(store)) => match store {
                StoreError::NotFound(_) => StatusCode::NOT_FOUND,
                StoreError::AlreadyExists(_) | StoreError::AlreadyAssigned { .. } => {
                    StatusCode::CONFLICT
                }
                StoreError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
                StoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn message(&self) -> String {
        if self.status().is_server_error() {
            "internal server error".to_string()
        } else {
            self.to_string()
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = ?self, "request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: self.message(),
            }),
        )
            .into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Default, Deserialize)]
struct CreateChatRequest {
    #[serde(default)]
    chat_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SinceQuery {
    #[serde(default)]
    since: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    agent: Option<String>,
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/support/availability", get(availability_handler))
        .route(
            "/support/chats",
            get(list_chats_handler).post(create_chat_handler),
        )
        .route("/support/chats/{id}", get(summary_handler))
        .route(
            "/support/chats/{id}/messages",
            get(poll_handler).post(user_send_handler),
        )
        .route("/support/chats/{id}/stream", get(stream_handler))
        .route(
            "/support/admin/chats/{id}/messages",
            post(support_send_handler),
        )
        .route("/support/admin/chats/{id}/assign", post(assign_handler))
        .route("/support/admin/chats/{id}/release", post(release_handler))
        .route("/support/admin/queue", get(queue_stream_handler))
        .layer(Extension(Arc::new(state)))
}

fn parse_since(raw: Option<&str>) -> Result<Marker, ApiError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(Marker::ZERO),
        Some(value) => value
            .parse::<u64>()
            .map(Marker)
            .map_err(|_| ApiError::BadRequest(format!("invalid marker {value:?}"))),
    }
}

async fn availability_handler(Extension(state): Extension<Arc<GatewayState>>) -> Json<Availability> {
    Json(Availability {
        available: state.config.available,
    })
}

async fn create_chat_handler(
    Extension(state): Extension<Arc<GatewayState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<ChatSummary>), ApiError> {
    let request: CreateChatRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CreateChatRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|err| ApiError::BadRequest(err.to_string()))?
    };
    let chat = match request.chat_id {
        Some(raw) => ChatId::parse(&raw)?,
        None => ChatId::generate(),
    };
    let summary = state
        .coordinator
        .create(&chat, state.config.welcome_message.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(summary)))
}

async fn list_chats_handler(
    Extension(state): Extension<Arc<GatewayState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ChatSummary>>, ApiError> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            ChatStatus::parse(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown status {raw:?}")))?,
        ),
    };
    let filter = ChatFilter {
        status,
        agent: query.agent.and_then(AgentIdentity::new),
    };
    Ok(Json(state.coordinator.store().list_chats(&filter).await?))
}

async fn summary_handler(
    Extension(state): Extension<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> Result<Json<ChatSummary>, ApiError> {
    let chat = ChatId::parse(&id)?;
    Ok(Json(state.coordinator.store().summary(&chat).await?))
}

async fn poll_handler(
    Extension(state): Extension<Arc<GatewayState>>,
    Path(id): Path<String>,
    Query(query): Query<SinceQuery>,
) -> Result<Json<PollResponse>, ApiError> {
    let chat = ChatId::parse(&id)?;
    let since = parse_since(query.since.as_deref())?;
    let page = state.coordinator.poll_since(&chat, since).await?;
    Ok(Json(PollResponse {
        messages: page.messages.iter().map(WireMessage::from).collect(),
        agent_name: page.agent.map(|agent| agent.name().to_string()),
    }))
}

async fn user_send_handler(
    Extension(state): Extension<Arc<GatewayState>>,
    Path(id): Path<String>,
    Json(request): Json<SendRequest>,
) -> Result<(StatusCode, Json<WireMessage>), ApiError> {
    send_as(&state, &id, Sender::User, &request.content).await
}

async fn support_send_handler(
    Extension(state): Extension<Arc<GatewayState>>,
    Path(id): Path<String>,
    Json(request): Json<SendRequest>,
) -> Result<(StatusCode, Json<WireMessage>), ApiError> {
    send_as(&state, &id, Sender::Support, &request.content).await
}

async fn send_as(
    state: &GatewayState,
    id: &str,
    sender: Sender,
    content: &str,
) -> Result<(StatusCode, Json<WireMessage>), ApiError> {
    let chat = ChatId::parse(id)?;
    let message = state.coordinator.append(&chat, sender, content).await?;
    Ok((StatusCode::CREATED, Json(WireMessage::from(&message))))
}

async fn assign_handler(
    Extension(state): Extension<Arc<GatewayState>>,
    Path(id): Path<String>,
    Json(request): Json<AssignRequest>,
) -> Result<Json<ChatSummary>, ApiError> {
    let chat = ChatId::parse(&id)?;
    let agent = AgentIdentity::new(request.agent)
        .ok_or_else(|| ApiError::BadRequest("agent name is empty".to_string()))?;
    Ok(Json(state.presence.assign(&chat, agent).await?))
}

async fn release_handler(
    Extension(state): Extension<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> Result<Json<ChatSummary>, ApiError> {
    let chat = ChatId::parse(&id)?;
    Ok(Json(state.presence.release(&chat).await?))
}

async fn stream_handler(
    Extension(state): Extension<Arc<GatewayState>>,
    Path(id): Path<String>,
    Query(query): Query<SinceQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let chat = ChatId::parse(&id)?;
    let since = parse_since(query.since.as_deref())?;
    let (tx, rx) = connection();
    // subscribe before upgrading so nothing appended in between is missed
    let opened = state
        .coordinator
        .open(&chat, DeliveryMode::Push, Some(tx), since)
        .await?;
    Ok(ws.on_upgrade(move |socket| async move {
        if let Err(err) = run_websocket(socket, opened, rx).await {
            warn!("websocket closed with error: {err:?}");
        }
    }))
}

async fn run_websocket(
    mut socket: WebSocket,
    opened: Opened,
    mut events: ConnectionReceiver,
) -> anyhow::Result<()> {
    let Opened {
        guard,
        backlog,
        agent,
    } = opened;
    if let Some(agent) = agent {
        send_event(
            &mut socket,
            &ChatEvent::IdentityUpdate(IdentityUpdate { agent }),
        )
        .await?;
    }
    for message in backlog {
        send_event(&mut socket, &ChatEvent::Message(message)).await?;
    }

    let mut consecutive_failures: u32 = 0;
    loop {
        tokio::select! {
            frame = socket.recv() => {
                match frame {
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        warn!("websocket recv error: {err}");
                        break;
                    }
                }
            }
            event = events.recv() => {
                let Some(event) = event else {
                    debug!("subscription ended, closing websocket");
                    break;
                };
                if let Err(err) = send_event(&mut socket, &event).await {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    warn!(error = ?err, consecutive_failures, "websocket send error");
                    if consecutive_failures >= SEND_FAILURE_THRESHOLD {
                        warn!("terminating websocket due to repeated send failures");
                        break;
                    }
                } else {
                    consecutive_failures = 0;
                }
            }
        }
    }
    debug!(subscription = %guard.handle().id(), "websocket finished");
    Ok(())
}

async fn send_event(socket: &mut WebSocket, event: &ChatEvent) -> anyhow::Result<()> {
    send_json(socket, &WireEvent::from(event)).await
}

async fn send_json(socket: &mut WebSocket, frame: &impl Serialize) -> anyhow::Result<()> {
    let payload = serde_json::to_string(frame)?;
    socket.send(WsMessage::Text(payload.into())).await?;
    Ok(())
}

async fn queue_stream_handler(
    Extension(state): Extension<Arc<GatewayState>>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    // listen before taking the snapshot so a chat created in between shows up
    let events = state.coordinator.queue().subscribe();
    let waiting = state
        .coordinator
        .store()
        .list_chats(&ChatFilter {
            status: Some(ChatStatus::New),
            agent: None,
        })
        .await?;
    Ok(ws.on_upgrade(move |socket| async move {
        if let Err(err) = run_queue_stream(socket, waiting, events).await {
            warn!("queue stream closed with error: {err:?}");
        }
    }))
}

async fn run_queue_stream(
    mut socket: WebSocket,
    waiting: Vec<ChatSummary>,
    mut events: broadcast::Receiver<QueueEvent>,
) -> anyhow::Result<()> {
    for chat in waiting {
        send_json(&mut socket, &QueueWireEvent::NewChat { chat }).await?;
    }
    loop {
        tokio::select! {
            frame = socket.recv() => {
                match frame {
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        warn!("queue stream recv error: {err}");
                        break;
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => send_json(&mut socket, &QueueWireEvent::from(&event)).await?,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "queue stream fell behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
    debug!("queue stream finished");
    Ok(())
}
