//! HTTP poll/send and WebSocket push against the gateway routes.

use async_trait::async_trait;
use futures::{StreamExt, stream};
use http::StatusCode;
use reqwest::{Client, Response};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use tracing::{debug, warn};
use url::Url;

use super::transport::{ChatTransport, PushStream, TransportError};
use crate::{
    coordinator::PollPage,
    types::{AgentIdentity, ChatId, Marker, Message, Sender},
    wire::{Availability, PollResponse, SendRequest, WireEvent, WireMessage},
};

#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
    base: Url,
    sender: Sender,
}

impl HttpTransport {
    /// `base_url` points at the gateway's `/support` prefix, for example
    /// `http://localhost:8095/support`.
    pub fn new(client: Client, base_url: &str) -> Result<Self, TransportError> {
        let mut base = Url::parse(base_url)
            .map_err(|err| TransportError::Transient(format!("invalid base url: {err}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            client,
            base,
            sender: Sender::User,
        })
    }

    /// Sends through the admin route so messages are stored as `support`.
    pub fn as_support(mut self) -> Self {
        self.sender = Sender::Support;
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        self.base
            .join(path)
            .map_err(|err| TransportError::Transient(format!("invalid endpoint {path}: {err}")))
    }

    fn push_endpoint(&self, chat: &ChatId, since: Marker) -> Result<Url, TransportError> {
        let mut url = self.endpoint(&format!("chats/{chat}/stream"))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| TransportError::Transient(format!("cannot derive {scheme} url")))?;
        url.query_pairs_mut()
            .append_pair("since", &since.seq().to_string());
        Ok(url)
    }

    /// Asks the gateway whether support is staffed. Anything but an explicit
    /// `{"available": bool}` payload counts as a failure.
    pub async fn probe_availability(&self) -> Result<bool, TransportError> {
        let response = self
            .client
            .get(self.endpoint("availability")?)
            .send()
            .await
            .map_err(transient)?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_poll(status, read_body(response).await));
        }
        let body: Availability = response
            .json()
            .await
            .map_err(|err| TransportError::Transient(format!("malformed availability: {err}")))?;
        Ok(body.available)
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn connect_push(&self, chat: &ChatId, since: Marker) -> Result<PushStream, TransportError> {
        let url = self.push_endpoint(chat, since)?;
        let (socket, _) = connect_async(url.as_str()).await.map_err(|err| match err {
            WsError::Http(response) => classify_poll(response.status(), String::new()),
            other => transient(other),
        })?;
        debug!(chat_id = chat.as_str(), "push connection established");

        let events = stream::unfold(socket, |mut socket| async move {
            loop {
                match socket.next().await? {
                    Ok(WsMessage::Text(text)) => {
                        match serde_json::from_str::<WireEvent>(text.as_str()) {
                            Ok(event) => return Some((Ok(event.into_event()), socket)),
                            Err(err) => warn!(error = %err, "ignoring malformed push frame"),
                        }
                    }
                    Ok(WsMessage::Close(_)) => return None,
                    Ok(_) => continue,
                    Err(err) => return Some((Err(transient(err)), socket)),
                }
            }
        });
        Ok(events.boxed())
    }

    async fn poll(&self, chat: &ChatId, since: Marker) -> Result<PollPage, TransportError> {
        let url = self.endpoint(&format!("chats/{chat}/messages"))?;
        let response = self
            .client
            .get(url)
            .query(&[("since", since.seq())])
            .send()
            .await
            .map_err(transient)?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_poll(status, read_body(response).await));
        }
        let body: PollResponse = response
            .json()
            .await
            .map_err(|err| TransportError::Transient(format!("malformed poll page: {err}")))?;
        Ok(PollPage {
            messages: body.messages.into_iter().map(Message::from).collect(),
            agent: body.agent_name.and_then(AgentIdentity::new),
        })
    }

    async fn send(&self, chat: &ChatId, content: &str) -> Result<Message, TransportError> {
        let path = match self.sender {
            Sender::Support => format!("admin/chats/{chat}/messages"),
            _ => format!("chats/{chat}/messages"),
        };
        let response = self
            .client
            .post(self.endpoint(&path)?)
            .json(&SendRequest {
                content: content.to_string(),
            })
            .send()
            .await
            .map_err(transient)?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_send(status, read_body(response).await));
        }
        let body: WireMessage = response
            .json()
            .await
            .map_err(|err| TransportError::Transient(format!("malformed send reply: {err}")))?;
        Ok(body.into())
    }
}

fn transient(err: impl std::fmt::Display) -> TransportError {
    TransportError::Transient(err.to_string())
}

async fn read_body(response: Response) -> String {
    response.text().await.unwrap_or_default()
}

/// Poll and handshake failures: 400, 429 and 5xx are retried, other client
/// errors mean the chat is not reachable for this caller.
pub(crate) fn classify_poll(status: StatusCode, body: String) -> TransportError {
    if status == StatusCode::BAD_REQUEST
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        TransportError::Transient(format!("status {status}"))
    } else {
        TransportError::Application {
            status,
            message: body,
        }
    }
}

pub(crate) fn classify_send(status: StatusCode, body: String) -> TransportError {
    if status.is_server_error() {
        TransportError::Store(body)
    } else {
        TransportError::Application {
            status,
            message: body,
        }
    }
}
