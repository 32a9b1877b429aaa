//! JSON frames exchanged over a conversation channel.
//!
//! Every frame is a JSON object discriminated by its `"type"` field.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::Message;

/// Close code: credential missing, malformed, expired or rejected.
pub const CLOSE_AUTHENTICATION_FAILED: u16 = 4001;
/// Close code: authenticated caller is not a member of the conversation.
pub const CLOSE_FORBIDDEN: u16 = 4003;
/// Close code: the same participant opened a newer connection.
pub const CLOSE_SUPERSEDED: u16 = 4009;
/// Close code: the pong deadline passed.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close code: the store could not be reached during the handshake.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Frames sent by a client to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    SendMessage(SendMessage),
}

/// A text-send request.
///
/// `sender_id` is accepted for compatibility with older clients but the
/// gateway always uses the authenticated identity of the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<Uuid>,
    pub text: String,
    /// Opaque client value echoed back in `send_accepted` / `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Frames sent by the gateway to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// The connection is registered and open.
    Ready {
        conversation_id: Uuid,
        participant_id: Uuid,
    },
    /// A message was persisted in the conversation. Receivers treat this as
    /// a signal to re-fetch; the embedded message is informational only.
    MessageCreated {
        conversation_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<Message>,
    },
    /// The sender's own request was persisted.
    SendAccepted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        message_id: Uuid,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        kind: ErrorKind,
        message: String,
    },
}

/// Failure taxonomy shared by the gateway and its clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthenticationFailed,
    Forbidden,
    ValidationFailed,
    PersistenceFailed,
    DeliveryFailed,
    ChannelLost,
    NotFound,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed => "authentication_failed",
            Self::Forbidden => "forbidden",
            Self::ValidationFailed => "validation_failed",
            Self::PersistenceFailed => "persistence_failed",
            Self::DeliveryFailed => "delivery_failed",
            Self::ChannelLost => "channel_lost",
            Self::NotFound => "not_found",
        }
    }

    /// Map a WebSocket close code to the failure that caused it, if the
    /// code is one the gateway uses for terminal failures.
    pub fn from_close_code(code: u16) -> Option<Self> {
        match code {
            CLOSE_AUTHENTICATION_FAILED => Some(Self::AuthenticationFailed),
            CLOSE_FORBIDDEN => Some(Self::Forbidden),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
