use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, timeout};
use uuid::Uuid;

use tempest_chat_shared::protocol::CLOSE_GOING_AWAY;
use tempest_chat_shared::{Membership, ServerFrame};

use crate::state::AppState;
use crate::ws::broadcast;
use crate::ws::phase::{CloseReason, GatewayPhase, PhaseEvent};
use crate::ws::protocol;

/// Run the actor-per-connection pattern for an authorized WebSocket.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink, forwards messages from an mpsc channel
/// - Ping task: sends periodic pings and closes on a missed pong
/// - Reader loop: processes incoming frames, dispatches to protocol handlers
///
/// The connection is only `Open` once it is in the registry; leaving the
/// reader loop unregisters it. A missed pong ends the reader loop too, so
/// an unresponsive peer never stays registered.
pub async fn run_connection(
    socket: WebSocket,
    state: AppState,
    membership: Membership,
    participant_id: Uuid,
    mut phase: GatewayPhase,
) {
    let conversation_id = membership.conversation_id;
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    // Spawn writer task: forwards mpsc messages to WebSocket sink
    let mut writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    let connection = match state
        .connections
        .register(&membership, participant_id, tx.clone())
    {
        Ok(connection) => connection,
        Err(e) => {
            tracing::warn!(error = %e, "Registration refused");
            phase.advance(conversation_id, PhaseEvent::MembershipRejected);
            let reason = CloseReason::Forbidden;
            let _ = tx.send(Message::Close(Some(CloseFrame {
                code: reason.close_code().unwrap_or(1000),
                reason: reason.description().into(),
            })));
            drop(tx);
            let _ = writer_handle.await;
            return;
        }
    };
    phase.advance(conversation_id, PhaseEvent::Registered(connection.id));

    broadcast::send_frame(
        &tx,
        &ServerFrame::Ready {
            conversation_id,
            participant_id,
        },
    );

    tracing::info!(
        conversation_id = %conversation_id,
        participant_id = %participant_id,
        connection_id = %connection.id,
        "WebSocket actor started"
    );

    // Track pong reception
    let (pong_tx, pong_rx) = mpsc::unbounded_channel::<()>();
    let (timed_out_tx, mut timed_out_rx) = oneshot::channel::<()>();
    let ping_handle = tokio::spawn(ping_task(
        tx.clone(),
        pong_rx,
        timed_out_tx,
        Duration::from_secs(state.chat.ping_interval_secs),
        Duration::from_secs(state.chat.pong_timeout_secs),
    ));

    // Reader loop: process incoming WebSocket messages
    let reason = loop {
        let incoming = tokio::select! {
            incoming = ws_receiver.next() => incoming,
            signal = &mut timed_out_rx => {
                // Err: the ping task stopped because the writer is gone
                break match signal {
                    Ok(()) => CloseReason::PongTimeout,
                    Err(_) => CloseReason::ChannelLost,
                };
            }
        };
        match incoming {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    protocol::handle_text_frame(text.as_str(), &connection, &state).await;
                }
                Message::Binary(_) => {
                    tracing::debug!(
                        connection_id = %connection.id,
                        "Received binary frame (expected JSON text)"
                    );
                    protocol::handle_text_frame("", &connection, &state).await;
                }
                Message::Pong(_) => {
                    // Pong received, wake the ping task
                    let _ = pong_tx.send(());
                }
                Message::Ping(data) => {
                    // Respond to client pings with pong
                    let _ = tx.send(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::info!(
                        connection_id = %connection.id,
                        reason = ?frame,
                        "Client initiated close"
                    );
                    break CloseReason::ClientClosed;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(
                    connection_id = %connection.id,
                    error = %e,
                    "WebSocket receive error"
                );
                break CloseReason::ChannelLost;
            }
            None => {
                // Stream ended, client disconnected
                break CloseReason::ChannelLost;
            }
        }
    };

    let superseded = !state.connections.is_registered(&connection);
    state.connections.unregister(&connection);
    if reason == CloseReason::PongTimeout {
        // Let the writer flush the 1001 close before it is torn down
        let _ = timeout(Duration::from_secs(1), &mut writer_handle).await;
    }
    phase.advance(
        conversation_id,
        PhaseEvent::Closed(if superseded {
            CloseReason::Superseded
        } else {
            reason
        }),
    );

    // Cleanup: abort writer and ping tasks
    writer_handle.abort();
    ping_handle.abort();

    tracing::info!(
        conversation_id = %conversation_id,
        participant_id = %participant_id,
        connection_id = %connection.id,
        phase = ?phase,
        "WebSocket actor stopped"
    );
}

/// Sends periodic pings. If a pong does not arrive within `pong_timeout`,
/// queues a 1001 close and signals `timed_out`.
async fn ping_task(
    tx: mpsc::UnboundedSender<Message>,
    mut pong_rx: mpsc::UnboundedReceiver<()>,
    timed_out: oneshot::Sender<()>,
    ping_interval: Duration,
    pong_timeout: Duration,
) {
    let mut ping_timer = interval(ping_interval);
    // Skip the first immediate tick
    ping_timer.tick().await;

    loop {
        ping_timer.tick().await;

        // Discard pongs that answered earlier pings
        while pong_rx.try_recv().is_ok() {}

        if tx.send(Message::Ping(vec![1, 2, 3, 4].into())).is_err() {
            // Writer task is gone
            break;
        }

        match timeout(pong_timeout, pong_rx.recv()).await {
            Ok(Some(())) => {}
            _ => {
                let reason = CloseReason::PongTimeout;
                tracing::warn!("Pong timeout, closing connection");
                let _ = tx.send(Message::Close(Some(CloseFrame {
                    code: reason.close_code().unwrap_or(CLOSE_GOING_AWAY),
                    reason: reason.description().into(),
                })));
                let _ = timed_out.send(());
                break;
            }
        }
    }
}

/// Writer task: receives messages from mpsc channel and forwards them to the
/// WebSocket sink. Stops after forwarding a close frame.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if ws_sender.send(msg).await.is_err() || closing {
            break;
        }
    }
}
