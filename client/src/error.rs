use thiserror::Error;

use tempest_chat_shared::ErrorKind;

/// Transport failures seen by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server answered {status}")]
    Status { status: u16 },
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("channel closed by server (code {code:?})")]
    Closed { code: Option<u16> },
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),
    #[error("malformed frame: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("server did not confirm the channel in time")]
    Timeout,
}

impl ClientError {
    /// Failure class as the sync engine sees it.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Status { status: 401 } => ErrorKind::AuthenticationFailed,
            Self::Status { status: 403 } => ErrorKind::Forbidden,
            Self::Status { status: 404 } => ErrorKind::NotFound,
            Self::Closed { code: Some(code) } => {
                ErrorKind::from_close_code(*code).unwrap_or(ErrorKind::ChannelLost)
            }
            _ => ErrorKind::ChannelLost,
        }
    }

    /// Close code when the server closed the channel during the handshake.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::Closed { code } => *code,
            _ => None,
        }
    }
}
