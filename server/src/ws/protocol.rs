use tempest_chat_shared::{ClientFrame, SendMessage, ServerFrame};

use super::broadcast;
use super::send;
use super::Connection;
use crate::error::GatewayError;
use crate::state::AppState;

/// Handle an incoming text frame from an open connection.
/// Decodes the JSON frame, dispatches on its type, replies to the sender.
pub async fn handle_text_frame(raw: &str, connection: &Connection, state: &AppState) {
    let frame = match serde_json::from_str::<ClientFrame>(raw) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(
                connection_id = %connection.id,
                error = %e,
                "Failed to decode client frame"
            );
            send_error(
                connection,
                None,
                &GatewayError::ValidationFailed("malformed frame".to_string()),
            );
            return;
        }
    };

    match frame {
        ClientFrame::SendMessage(send) => handle_send_message(send, connection, state).await,
    }
}

/// Handle a send request. The sender is always the connection's participant.
async fn handle_send_message(request: SendMessage, connection: &Connection, state: &AppState) {
    let SendMessage {
        conversation_id,
        sender_id,
        text,
        request_id,
    } = request;

    if let Some(claimed) = conversation_id.filter(|id| *id != connection.conversation_id) {
        tracing::warn!(
            connection_id = %connection.id,
            claimed = %claimed,
            "Send addressed to another conversation"
        );
        send_error(
            connection,
            request_id,
            &GatewayError::ValidationFailed(
                "conversation_id does not match this channel".to_string(),
            ),
        );
        return;
    }

    if let Some(claimed) = sender_id.filter(|id| *id != connection.participant_id) {
        tracing::warn!(
            connection_id = %connection.id,
            participant_id = %connection.participant_id,
            claimed = %claimed,
            "Ignoring client-supplied sender_id"
        );
    }

    let message = match send::persist_message(
        state,
        connection.conversation_id,
        connection.participant_id,
        &text,
    )
    .await
    {
        Ok(message) => message,
        Err(err) => {
            send_error(connection, request_id, &err);
            return;
        }
    };

    broadcast::send_frame(
        &connection.sender,
        &ServerFrame::SendAccepted {
            request_id,
            message_id: message.id,
        },
    );
    broadcast::dispatch_message_created(&state.connections, &message);
}

/// Report a failed request to the sender only.
fn send_error(connection: &Connection, request_id: Option<String>, err: &GatewayError) {
    let frame = ServerFrame::Error {
        request_id,
        kind: err.kind(),
        message: err.public_message(),
    };
    if !broadcast::send_frame(&connection.sender, &frame) {
        tracing::debug!(connection_id = %connection.id, "Error frame not delivered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::Message as WsMessage;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    use tempest_chat_shared::{ErrorKind, Membership};

    use crate::config::ChatConfig;
    use crate::store::{MessageStore, SqliteStore};

    struct Fixture {
        state: AppState,
        membership: Membership,
        host: Connection,
        host_rx: mpsc::UnboundedReceiver<WsMessage>,
        guest_rx: mpsc::UnboundedReceiver<WsMessage>,
    }

    fn fixture() -> Fixture {
        let store = SqliteStore::in_memory().unwrap();
        let host = store.create_user("host", "host@example.com").unwrap();
        let guest = store.create_user("guest", "guest@example.com").unwrap();
        let (conversation, _) = store.create_conversation(host.id, guest.id, None).unwrap();
        let membership = conversation.membership();

        let state = AppState::new(Arc::new(store), vec![0; 32], ChatConfig::default());
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        let (guest_tx, guest_rx) = mpsc::unbounded_channel();
        let host = state
            .connections
            .register(&membership, host.id, host_tx)
            .unwrap();
        state
            .connections
            .register(&membership, guest.id, guest_tx)
            .unwrap();

        Fixture {
            state,
            membership,
            host,
            host_rx,
            guest_rx,
        }
    }

    fn next_frame(rx: &mut mpsc::UnboundedReceiver<WsMessage>) -> ServerFrame {
        match rx.try_recv().unwrap() {
            WsMessage::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn accepted_send_acks_then_notifies_both() {
        let mut f = fixture();
        let raw = serde_json::json!({
            "type": "send_message",
            "text": "  hello  ",
            "request_id": "r1",
        })
        .to_string();

        handle_text_frame(&raw, &f.host, &f.state).await;

        let ServerFrame::SendAccepted {
            request_id,
            message_id,
        } = next_frame(&mut f.host_rx)
        else {
            panic!("expected send_accepted first");
        };
        assert_eq!(request_id.as_deref(), Some("r1"));

        for rx in [&mut f.host_rx, &mut f.guest_rx] {
            match next_frame(rx) {
                ServerFrame::MessageCreated { message, .. } => {
                    let message = message.unwrap();
                    assert_eq!(message.id, message_id);
                    assert_eq!(message.text, "hello");
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn spoofed_sender_id_is_ignored() {
        let mut f = fixture();
        let raw = serde_json::json!({
            "type": "send_message",
            "conversation_id": f.membership.conversation_id,
            "sender_id": f.membership.guest_id,
            "text": "from host",
        })
        .to_string();

        handle_text_frame(&raw, &f.host, &f.state).await;
        next_frame(&mut f.host_rx);

        match next_frame(&mut f.guest_rx) {
            ServerFrame::MessageCreated { message, .. } => {
                assert_eq!(message.unwrap().sender.id, f.membership.landlord_id);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn blank_text_only_reaches_the_sender() {
        let mut f = fixture();
        let raw = r#"{"type":"send_message","text":"   ","request_id":"r2"}"#;

        handle_text_frame(raw, &f.host, &f.state).await;

        match next_frame(&mut f.host_rx) {
            ServerFrame::Error {
                request_id, kind, ..
            } => {
                assert_eq!(kind, ErrorKind::ValidationFailed);
                assert_eq!(request_id.as_deref(), Some("r2"));
            }
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(f.guest_rx.try_recv().is_err());

        let conversation_id = f.membership.conversation_id;
        let stored = crate::store::blocking(f.state.store.clone(), move |s| {
            s.messages(conversation_id)
        })
        .await
        .unwrap();
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn wrong_conversation_and_garbage_are_validation_errors() {
        let mut f = fixture();
        let wrong = serde_json::json!({
            "type": "send_message",
            "conversation_id": uuid::Uuid::new_v4(),
            "text": "hi",
        })
        .to_string();

        for raw in [wrong.as_str(), "not json", r#"{"type":"typing"}"#] {
            handle_text_frame(raw, &f.host, &f.state).await;
            match next_frame(&mut f.host_rx) {
                ServerFrame::Error { kind, .. } => assert_eq!(kind, ErrorKind::ValidationFailed),
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert!(f.guest_rx.try_recv().is_err());
    }
}
