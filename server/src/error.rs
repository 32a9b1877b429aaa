use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use uuid::Uuid;

use tempest_chat_shared::ErrorKind;

use crate::store::StoreError;

/// Failures of the messaging gateway, one variant per error class a
/// participant can observe.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Bad, expired or missing credential. Terminal for the connection.
    #[error("authentication failed")]
    AuthenticationFailed,
    /// Authenticated, but not a member of the conversation. Terminal.
    #[error("not a participant of this conversation")]
    Forbidden,
    /// Unknown resource on a REST route.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// Rejected send payload. The connection stays open.
    #[error("{0}")]
    ValidationFailed(String),
    /// The store refused or failed the write. The connection stays open.
    #[error("message could not be stored")]
    PersistenceFailed(#[source] StoreError),
    /// Push to one recipient failed. Never reported to the sender.
    #[error("delivery to connection {0} failed")]
    DeliveryFailed(Uuid),
    /// Transport went away.
    #[error("channel lost")]
    ChannelLost,
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthenticationFailed => ErrorKind::AuthenticationFailed,
            Self::Forbidden => ErrorKind::Forbidden,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::ValidationFailed(_) => ErrorKind::ValidationFailed,
            Self::PersistenceFailed(_) => ErrorKind::PersistenceFailed,
            Self::DeliveryFailed(_) => ErrorKind::DeliveryFailed,
            Self::ChannelLost => ErrorKind::ChannelLost,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::AuthenticationFailed => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::PersistenceFailed(_) | Self::DeliveryFailed(_) | Self::ChannelLost => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message safe to show to the sender. Store internals stay in logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::PersistenceFailed(_) => "message could not be stored, please retry".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotParticipant { .. } => Self::Forbidden,
            StoreError::UnknownConversation(_) => Self::NotFound("conversation"),
            StoreError::UnknownUser(_) => Self::NotFound("user"),
            StoreError::SameParticipant => {
                Self::ValidationFailed("a conversation needs two distinct participants".into())
            }
            other => Self::PersistenceFailed(other),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if let Self::PersistenceFailed(ref source) = self {
            tracing::error!(error = %source, "Store failure on REST request");
        }
        let body = serde_json::json!({
            "error": self.kind().as_str(),
            "message": self.public_message(),
        });
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_gateway_classes() {
        let forbidden: GatewayError = StoreError::NotParticipant {
            conversation_id: Uuid::new_v4(),
            participant_id: Uuid::new_v4(),
        }
        .into();
        assert_eq!(forbidden.kind(), ErrorKind::Forbidden);

        let persistence: GatewayError = StoreError::LockPoisoned.into();
        assert_eq!(persistence.kind(), ErrorKind::PersistenceFailed);
        assert_eq!(persistence.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!persistence.public_message().contains("lock"));
    }
}
