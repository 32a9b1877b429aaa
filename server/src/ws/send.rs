//! The send path shared by the channel and the REST endpoint:
//! validate, persist, then fan out. Fan-out only happens after the store
//! accepted the message, so a failed send is never visible to anyone but
//! the sender.

use uuid::Uuid;

use tempest_chat_shared::Message;

use super::broadcast::{self, DispatchReport};
use crate::error::GatewayError;
use crate::state::AppState;
use crate::store;

/// Trim and check a text payload against the configured limit.
pub fn validate_text(raw: &str, max_chars: usize) -> Result<&str, GatewayError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(GatewayError::ValidationFailed(
            "text must not be empty".to_string(),
        ));
    }
    let chars = text.chars().count();
    if chars > max_chars {
        return Err(GatewayError::ValidationFailed(format!(
            "text is {chars} characters, the limit is {max_chars}"
        )));
    }
    Ok(text)
}

/// Validate and persist. Nothing is dispatched.
pub async fn persist_message(
    state: &AppState,
    conversation_id: Uuid,
    sender_id: Uuid,
    raw_text: &str,
) -> Result<Message, GatewayError> {
    let text = validate_text(raw_text, state.chat.max_message_chars)?.to_string();

    let result = store::blocking(state.store.clone(), move |s| {
        s.append_message(conversation_id, sender_id, &text)
    })
    .await;

    match result {
        Ok(message) => {
            tracing::info!(
                conversation_id = %conversation_id,
                participant_id = %sender_id,
                message_id = %message.id,
                "Message persisted"
            );
            Ok(message)
        }
        Err(e) => {
            tracing::warn!(
                conversation_id = %conversation_id,
                participant_id = %sender_id,
                error = %e,
                "Message not persisted"
            );
            Err(e.into())
        }
    }
}

/// Validate, persist and fan out.
pub async fn submit_message(
    state: &AppState,
    conversation_id: Uuid,
    sender_id: Uuid,
    raw_text: &str,
) -> Result<(Message, DispatchReport), GatewayError> {
    let message = persist_message(state, conversation_id, sender_id, raw_text).await?;
    let report = broadcast::dispatch_message_created(&state.connections, &message);
    Ok((message, report))
}
