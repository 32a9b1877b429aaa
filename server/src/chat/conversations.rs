//! REST endpoints for conversation management.
//!
//! A conversation is created by its initiator (the landlord side) with a
//! counterpart (the guest side), optionally tied to a reservation. The same
//! triple always maps to the same conversation.

use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use uuid::Uuid;

use tempest_chat_shared::Conversation;

use crate::auth::Identity;
use crate::error::GatewayError;
use crate::state::AppState;
use crate::store;

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    pub guest_id: Uuid,
    #[serde(default)]
    pub reservation_id: Option<Uuid>,
}

/// GET /api/chat: conversations of the caller, most recently active first.
pub async fn list_conversations(
    State(state): State<AppState>,
    identity: Identity,
) -> Result<Json<Vec<Conversation>>, GatewayError> {
    let user_id = identity.user_id;
    let conversations =
        store::blocking(state.store.clone(), move |s| s.conversations_for(user_id)).await?;
    Ok(Json(conversations))
}

/// POST /api/chat: create or get a conversation with the caller as initiator.
/// Returns 201 when created, 200 when it already existed.
pub async fn create_conversation(
    State(state): State<AppState>,
    identity: Identity,
    Json(body): Json<CreateConversationRequest>,
) -> Result<(StatusCode, Json<Conversation>), GatewayError> {
    let landlord_id = identity.user_id;
    if body.guest_id == landlord_id {
        return Err(GatewayError::ValidationFailed(
            "cannot start a conversation with yourself".to_string(),
        ));
    }

    let (conversation, created) = store::blocking(state.store.clone(), move |s| {
        s.create_conversation(landlord_id, body.guest_id, body.reservation_id)
    })
    .await?;

    if created {
        tracing::info!(
            conversation_id = %conversation.id,
            landlord_id = %landlord_id,
            guest_id = %conversation.guest.id,
            "Conversation created"
        );
    }

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(conversation)))
}
