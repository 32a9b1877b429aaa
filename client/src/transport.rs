//! Transports the sync session drives: REST history and the live channel.

use std::future::Future;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use tempest_chat_shared::{ClientFrame, Conversation, Message, ServerFrame};

use crate::error::ClientError;

/// How long the gateway may take to confirm registration.
const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of authoritative conversation history.
pub trait HistorySource: Send + Sync + 'static {
    /// Full history ascending by (created_at, id).
    fn fetch_history(
        &self,
        conversation_id: Uuid,
    ) -> impl Future<Output = Result<Vec<Message>, ClientError>> + Send;

    /// The user's conversations, most recently active first.
    fn fetch_conversations(
        &self,
    ) -> impl Future<Output = Result<Vec<Conversation>, ClientError>> + Send;
}

/// Opens live channels scoped to one conversation.
pub trait ChannelConnector: Send + Sync + 'static {
    /// Resolves once the gateway has registered the connection.
    fn connect(
        &self,
        conversation_id: Uuid,
    ) -> impl Future<Output = Result<ChannelHandle, ClientError>> + Send;
}

/// What arrives on an open channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Frame(ServerFrame),
    Closed { code: Option<u16> },
}

/// An open, registered channel. Dropping `outbound` closes it.
#[derive(Debug)]
pub struct ChannelHandle {
    pub participant_id: Uuid,
    pub outbound: mpsc::UnboundedSender<ClientFrame>,
    pub inbound: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// REST client for the chat endpoints, authenticated with a bearer token.
#[derive(Debug, Clone)]
pub struct RestApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl RestApi {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// Conversations of the current user, most recently active first.
    pub async fn list_conversations(&self) -> Result<Vec<Conversation>, ClientError> {
        let resp = self
            .client
            .get(format!("{}/api/chat", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::decode(resp).await
    }

    pub async fn messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, ClientError> {
        let resp = self
            .client
            .get(format!("{}/api/chat/{}", self.base_url, conversation_id))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
            });
        }
        Ok(resp.json().await?)
    }
}

impl HistorySource for RestApi {
    async fn fetch_history(&self, conversation_id: Uuid) -> Result<Vec<Message>, ClientError> {
        self.messages(conversation_id).await
    }

    async fn fetch_conversations(&self) -> Result<Vec<Conversation>, ClientError> {
        self.list_conversations().await
    }
}

/// Opens `ws(s)://…/ws/chat/{id}?token=…` channels.
#[derive(Debug, Clone)]
pub struct WsConnector {
    ws_base: String,
    token: String,
}

impl WsConnector {
    /// `base_url` is the HTTP base; the scheme is switched to ws/wss.
    pub fn new(base_url: &str, token: impl Into<String>) -> Self {
        let base = base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        Self {
            ws_base,
            token: token.into(),
        }
    }

    fn url(&self, conversation_id: Uuid) -> String {
        format!("{}/ws/chat/{}?token={}", self.ws_base, conversation_id, self.token)
    }
}

impl ChannelConnector for WsConnector {
    async fn connect(&self, conversation_id: Uuid) -> Result<ChannelHandle, ClientError> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url(conversation_id)).await?;
        let (mut sink, mut stream) = ws.split();

        // The gateway either confirms registration or closes with a code.
        let participant_id = tokio::time::timeout(READY_TIMEOUT, async {
            loop {
                match stream.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        return match serde_json::from_str::<ServerFrame>(text.as_str()) {
                            Ok(ServerFrame::Ready { participant_id, .. }) => Ok(participant_id),
                            Ok(other) => Err(ClientError::UnexpectedFrame(format!("{other:?}"))),
                            Err(e) => Err(ClientError::Decode(e)),
                        };
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        return Err(ClientError::Closed {
                            code: frame.map(|f| u16::from(f.code)),
                        })
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(ClientError::WebSocket(e)),
                    None => return Err(ClientError::Closed { code: None }),
                }
            }
        })
        .await
        .map_err(|_| ClientError::Timeout)??;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ChannelEvent>();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to encode client frame");
                        continue;
                    }
                };
                if sink.send(WsMessage::text(text)).await.is_err() {
                    return;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            let code = loop {
                match stream.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ServerFrame>(text.as_str()) {
                            Ok(frame) => {
                                if inbound_tx.send(ChannelEvent::Frame(frame)).is_err() {
                                    return;
                                }
                            }
                            Err(e) => tracing::warn!(error = %e, "Ignoring malformed server frame"),
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => break frame.map(|f| u16::from(f.code)),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "Channel read failed");
                        break None;
                    }
                    None => break None,
                }
            };
            let _ = inbound_tx.send(ChannelEvent::Closed { code });
        });

        tracing::debug!(conversation_id = %conversation_id, "Channel registered");
        Ok(ChannelHandle {
            participant_id,
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
