//! One relay WebSocket connection.
//!
//! The receive loop answers every client frame exactly once, in order, by
//! pushing the reply onto the outbound channel. Each room subscription runs a
//! forwarder task that pushes `Signal` frames onto the same channel; a single
//! sender task drains it into the socket.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use kindred_common::models::{RelayFrame, RoomId, SignalMessage, relay::codes};
use kindred_common::validation::validate_id;
use kindred_signal::SUBSCRIPTION_BUFFER;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::RelayState;

/// Handle a single WebSocket connection.
pub async fn handle_connection(socket: WebSocket, state: Arc<RelayState>) {
    let (mut sender, mut receiver) = socket.split();
    let connection_id = Uuid::new_v4();
    let (out_tx, mut out_rx) = mpsc::channel::<RelayFrame>(SUBSCRIPTION_BUFFER);

    let send_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode relay frame");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    tracing::debug!(connection = %connection_id, "Relay connection opened");

    let mut forwarders: HashMap<RoomId, JoinHandle<()>> = HashMap::new();

    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };

        let reply = match serde_json::from_str::<RelayFrame>(text.as_str()) {
            Ok(frame) => handle_frame(frame, &state, &out_tx, &mut forwarders).await,
            Err(e) => Some(RelayFrame::error(codes::MALFORMED, format!("Invalid frame: {e}"))),
        };
        if let Some(reply) = reply {
            if out_tx.send(reply).await.is_err() {
                break;
            }
        }
    }

    // Cleanup
    for (room, forwarder) in forwarders.drain() {
        forwarder.abort();
        state.rooms.left(&room).await;
    }
    send_task.abort();
    tracing::debug!(connection = %connection_id, "Relay connection closed");
}

async fn handle_frame(
    frame: RelayFrame,
    state: &RelayState,
    out_tx: &mpsc::Sender<RelayFrame>,
    forwarders: &mut HashMap<RoomId, JoinHandle<()>>,
) -> Option<RelayFrame> {
    let reply = match frame {
        RelayFrame::Subscribe { room } => {
            if let Err(reason) = validate_id(room.as_str()) {
                return Some(RelayFrame::error(codes::MALFORMED, format!("Invalid room: {reason}")));
            }
            if forwarders.contains_key(&room) {
                return Some(RelayFrame::Subscribed { room });
            }

            let mut subscription = match state.bus.subscribe(&room).await {
                Ok(sub) => sub,
                Err(e) => {
                    tracing::warn!(room = %room, error = %e, "Bus subscribe failed");
                    return Some(RelayFrame::error(codes::BUS_UNAVAILABLE, e.to_string()));
                }
            };

            // The confirmation must be queued before any Signal for this room.
            if out_tx.send(RelayFrame::Subscribed { room: room.clone() }).await.is_err() {
                return None;
            }

            let tx = out_tx.clone();
            let forward_room = room.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(message) = subscription.recv().await {
                    let frame = RelayFrame::Signal {
                        room: forward_room.clone(),
                        message,
                    };
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
            });
            forwarders.insert(room.clone(), forwarder);
            state.rooms.joined(&room).await;
            tracing::debug!(room = %room, "Connection subscribed");
            return None;
        }

        RelayFrame::Unsubscribe { room } => match forwarders.remove(&room) {
            Some(forwarder) => {
                forwarder.abort();
                state.rooms.left(&room).await;
                RelayFrame::Unsubscribed { room }
            }
            None => RelayFrame::error(codes::NOT_SUBSCRIBED, format!("Not subscribed to {room}")),
        },

        RelayFrame::Publish { room, message } => {
            let signal = match SignalMessage::from_json(&message) {
                Ok(signal) => signal,
                Err(e) => return Some(RelayFrame::error(codes::MALFORMED, e.to_string())),
            };
            if signal.room != room {
                return Some(RelayFrame::error(
                    codes::ROOM_MISMATCH,
                    format!("Message for {} published to {room}", signal.room),
                ));
            }

            // Forward the original text, not a re-serialization.
            match state.bus.publish_raw(&room, message).await {
                Ok(ack) => {
                    tracing::debug!(room = %room, kind = %signal.kind, sender = %signal.sender, receivers = ack.receivers, "Signal relayed");
                    RelayFrame::Ack {
                        room,
                        receivers: ack.receivers,
                    }
                }
                Err(e) => {
                    tracing::warn!(room = %room, error = %e, "Bus publish failed");
                    RelayFrame::error(codes::BUS_UNAVAILABLE, e.to_string())
                }
            }
        }

        other => RelayFrame::error(
            codes::INVALID_OPCODE,
            format!("{} is not a client frame", op_name(&other)),
        ),
    };
    Some(reply)
}

fn op_name(frame: &RelayFrame) -> &'static str {
    match frame {
        RelayFrame::Subscribe { .. } => "Subscribe",
        RelayFrame::Unsubscribe { .. } => "Unsubscribe",
        RelayFrame::Publish { .. } => "Publish",
        RelayFrame::Subscribed { .. } => "Subscribed",
        RelayFrame::Unsubscribed { .. } => "Unsubscribed",
        RelayFrame::Signal { .. } => "Signal",
        RelayFrame::Ack { .. } => "Ack",
        RelayFrame::Error { .. } => "Error",
    }
}
