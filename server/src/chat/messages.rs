use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use tempest_chat_shared::{Membership, Message};

use crate::auth::Identity;
use crate::error::GatewayError;
use crate::state::AppState;
use crate::store;
use crate::ws::send;

#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub text: String,
}

/// Resolve the conversation and require the caller to be one of its members.
async fn require_member(
    state: &AppState,
    conversation_id: Uuid,
    user_id: Uuid,
) -> Result<Membership, GatewayError> {
    let membership =
        store::blocking(state.store.clone(), move |s| s.membership(conversation_id))
            .await?
            .ok_or(GatewayError::NotFound("conversation"))?;
    if !membership.includes(user_id) {
        return Err(GatewayError::Forbidden);
    }
    Ok(membership)
}

/// GET /api/chat/{conversation_id}: full history, ascending by (created_at, id).
pub async fn list_messages(
    State(state): State<AppState>,
    identity: Identity,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<Vec<Message>>, GatewayError> {
    require_member(&state, conversation_id, identity.user_id).await?;
    let messages =
        store::blocking(state.store.clone(), move |s| s.messages(conversation_id)).await?;
    Ok(Json(messages))
}

/// POST /api/chat/{conversation_id}: send over REST. Same contract as the
/// channel: validated, persisted, then fanned out to every live connection.
pub async fn post_message(
    State(state): State<AppState>,
    identity: Identity,
    Path(conversation_id): Path<Uuid>,
    Json(body): Json<PostMessageRequest>,
) -> Result<(StatusCode, Json<Message>), GatewayError> {
    require_member(&state, conversation_id, identity.user_id).await?;
    let (message, report) =
        send::submit_message(&state, conversation_id, identity.user_id, &body.text).await?;

    tracing::debug!(
        conversation_id = %conversation_id,
        message_id = %message.id,
        delivered = report.delivered,
        "Message posted over REST"
    );
    Ok((StatusCode::CREATED, Json(message)))
}
