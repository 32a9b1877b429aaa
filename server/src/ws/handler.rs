use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
};
use serde::Deserialize;
use uuid::Uuid;

use tempest_chat_shared::Membership;

use crate::auth;
use crate::state::AppState;
use crate::store;
use crate::ws::actor;
use crate::ws::phase::{CloseReason, GatewayPhase, PhaseEvent};

/// Query parameters for WebSocket connection.
/// Auth is via query param ?token=JWT.
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: Option<String>,
}

/// GET /ws/chat/{conversation_id}?token=JWT
/// WebSocket upgrade endpoint scoped to one conversation.
/// On auth or membership failure, upgrades then immediately closes with the
/// matching close code. On success, spawns an actor for the connection.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Path(raw_conversation_id): Path<String>,
    Query(params): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let conversation_id = Uuid::parse_str(&raw_conversation_id).unwrap_or(Uuid::nil());
    let mut phase = GatewayPhase::Connecting;
    phase.advance(conversation_id, PhaseEvent::HandshakeReceived);

    let identity = match auth::authenticate(&state.jwt_secret, params.token.as_deref()) {
        Ok(identity) => identity,
        Err(_) => {
            phase.advance(conversation_id, PhaseEvent::AuthenticationRejected);
            return reject(ws, conversation_id, phase);
        }
    };
    phase.advance(conversation_id, PhaseEvent::Authenticated(identity.user_id));

    match authorize(&state, conversation_id, identity.user_id).await {
        Ok(membership) => {
            phase.advance(conversation_id, PhaseEvent::MemberConfirmed);
            tracing::info!(
                conversation_id = %conversation_id,
                participant_id = %identity.user_id,
                username = %identity.username,
                "WebSocket connection authorized"
            );
            ws.on_upgrade(move |socket| {
                actor::run_connection(socket, state, membership, identity.user_id, phase)
            })
        }
        Err(event) => {
            phase.advance(conversation_id, event);
            reject(ws, conversation_id, phase)
        }
    }
}

/// Fetch membership once. It is immutable, so the result is kept for the
/// connection's lifetime.
async fn authorize(
    state: &AppState,
    conversation_id: Uuid,
    participant_id: Uuid,
) -> Result<Membership, PhaseEvent> {
    if conversation_id.is_nil() {
        return Err(PhaseEvent::MembershipRejected);
    }
    match store::blocking(state.store.clone(), move |s| s.membership(conversation_id)).await {
        Ok(Some(membership)) if membership.includes(participant_id) => Ok(membership),
        Ok(_) => Err(PhaseEvent::MembershipRejected),
        Err(e) => {
            tracing::error!(
                conversation_id = %conversation_id,
                error = %e,
                "Membership lookup failed"
            );
            Err(PhaseEvent::StoreUnavailable)
        }
    }
}

/// Upgrade the connection, then immediately close it with the reason's code.
fn reject(ws: WebSocketUpgrade, conversation_id: Uuid, phase: GatewayPhase) -> Response {
    let reason = match phase {
        GatewayPhase::Closed(reason) => reason,
        _ => CloseReason::ChannelLost,
    };
    let code = reason.close_code().unwrap_or(1000);

    tracing::warn!(
        conversation_id = %conversation_id,
        close_code = code,
        reason = reason.description(),
        "WebSocket connection rejected"
    );

    ws.on_upgrade(move |socket| close_with(socket, code, reason.description()))
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let close_frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = socket.send(Message::Close(Some(close_frame))).await;
}
