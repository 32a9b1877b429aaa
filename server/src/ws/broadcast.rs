use axum::extract::ws::Message;
use uuid::Uuid;

use tempest_chat_shared::{Message as ChatMessage, ServerFrame};

use super::{ConnectionRegistry, ConnectionSender};
use crate::error::GatewayError;

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub evicted: usize,
}

/// Serialize a frame into a WebSocket text message.
pub fn encode_frame(frame: &ServerFrame) -> Option<Message> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode server frame");
            None
        }
    }
}

/// Send a frame to one connection. Returns false if the channel is gone.
pub fn send_frame(sender: &ConnectionSender, frame: &ServerFrame) -> bool {
    encode_frame(frame).is_some_and(|msg| sender.send(msg).is_ok())
}

/// Notify every connection registered for the message's conversation,
/// the sender's own included.
pub fn dispatch_message_created(
    registry: &ConnectionRegistry,
    message: &ChatMessage,
) -> DispatchReport {
    let frame = ServerFrame::MessageCreated {
        conversation_id: message.conversation_id,
        message: Some(message.clone()),
    };
    dispatch_frame(registry, message.conversation_id, &frame)
}

/// Push a frame to a conversation's live set. Each delivery is independent;
/// a connection whose channel is gone is unregistered and skipped.
pub fn dispatch_frame(
    registry: &ConnectionRegistry,
    conversation_id: Uuid,
    frame: &ServerFrame,
) -> DispatchReport {
    let mut report = DispatchReport::default();
    let Some(msg) = encode_frame(frame) else {
        return report;
    };

    for connection in registry.connections_for(conversation_id) {
        if connection.sender.send(msg.clone()).is_ok() {
            report.delivered += 1;
            continue;
        }
        let err = GatewayError::DeliveryFailed(connection.id);
        tracing::warn!(
            conversation_id = %conversation_id,
            participant_id = %connection.participant_id,
            error = %err,
            "Evicting unreachable connection"
        );
        if registry.unregister(&connection) {
            report.evicted += 1;
        }
    }

    tracing::debug!(
        conversation_id = %conversation_id,
        delivered = report.delivered,
        evicted = report.evicted,
        "Fan-out complete"
    );
    report
}
