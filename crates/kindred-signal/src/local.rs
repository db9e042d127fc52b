//! In-process signal bus.
//!
//! One `broadcast` channel per room. Publishers receive their own messages
//! back, exactly like a browser subscribed to a shared realtime channel.

use async_trait::async_trait;
use kindred_common::models::RoomId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast, mpsc};

use crate::{Ack, SUBSCRIPTION_BUFFER, SignalTransport, Subscription, TransportError};

/// Per-room broadcast backlog. A subscriber further behind than this (plus
/// its [`SUBSCRIPTION_BUFFER`]) skips the oldest signals and keeps going.
const ROOM_CAPACITY: usize = 256;

/// Simple in-memory bus for tests, the demo, and single-node relays.
#[derive(Clone, Default)]
pub struct LocalBus {
    rooms: Arc<RwLock<HashMap<RoomId, broadcast::Sender<String>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    async fn sender_for(&self, room: &RoomId) -> broadcast::Sender<String> {
        // Fast path: room exists
        {
            let rooms = self.rooms.read().await;
            if let Some(sender) = rooms.get(room) {
                return sender.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room.clone())
            .or_insert_with(|| broadcast::channel(ROOM_CAPACITY).0)
            .clone()
    }

    /// Live subscribers of a room on this node.
    pub async fn subscriber_count(&self, room: &RoomId) -> usize {
        self.rooms
            .read()
            .await
            .get(room)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    async fn forget_if_idle(&self, room: &RoomId) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(room).is_some_and(|s| s.receiver_count() == 0) {
            rooms.remove(room);
        }
    }
}

#[async_trait]
impl SignalTransport for LocalBus {
    async fn publish_raw(&self, room: &RoomId, raw: String) -> Result<Ack, TransportError> {
        let sender = self.sender_for(room).await;
        let receivers = match sender.send(raw) {
            Ok(receivers) => receivers,
            // Nobody is subscribed.
            Err(_) => {
                self.forget_if_idle(room).await;
                0
            }
        };
        Ok(Ack { receivers })
    }

    async fn subscribe(&self, room: &RoomId) -> Result<Subscription, TransportError> {
        let mut bus_rx = self.sender_for(room).await.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let room_name = room.clone();

        let pump = tokio::spawn(async move {
            loop {
                match bus_rx.recv().await {
                    Ok(raw) => {
                        if tx.send(raw).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(room = %room_name, skipped, "Subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(room.clone(), rx).with_pump(pump))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindred_common::models::{ParticipantId, SessionDescription, SignalMessage};

    #[tokio::test]
    async fn local_bus_round_trip() {
        let bus = LocalBus::new();
        let room = RoomId::from("room-1");
        let mut sub = bus.subscribe(&room).await.expect("subscribe ok");

        let msg = SignalMessage::offer(
            ParticipantId::from("userA"),
            room.clone(),
            SessionDescription::offer("v=0"),
        );
        let ack = bus.publish(&room, &msg).await.expect("publish ok");
        assert_eq!(ack.receivers, 1);

        let raw = sub.recv().await.expect("receive ok");
        assert_eq!(SignalMessage::from_json(&raw).unwrap(), msg);
    }

    #[tokio::test]
    async fn rooms_are_isolated() {
        let bus = LocalBus::new();
        let mut one = bus.subscribe(&RoomId::from("one")).await.unwrap();
        let _two = bus.subscribe(&RoomId::from("two")).await.unwrap();

        bus.publish_raw(&RoomId::from("two"), "for-two".into()).await.unwrap();
        bus.publish_raw(&RoomId::from("one"), "for-one".into()).await.unwrap();
        assert_eq!(one.recv().await.as_deref(), Some("for-one"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_acknowledged() {
        let bus = LocalBus::new();
        let ack = bus.publish_raw(&RoomId::from("empty"), "x".into()).await.unwrap();
        assert_eq!(ack.receivers, 0);
    }

    #[tokio::test]
    async fn cancelled_subscription_releases_the_room() {
        let bus = LocalBus::new();
        let room = RoomId::from("room-1");
        let mut sub = bus.subscribe(&room).await.unwrap();
        assert_eq!(bus.subscriber_count(&room).await, 1);

        sub.cancel();
        // The pump owning the broadcast receiver is aborted asynchronously.
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert_eq!(bus.subscriber_count(&room).await, 0);

        let ack = bus.publish_raw(&room, "x".into()).await.unwrap();
        assert_eq!(ack.receivers, 0);
        assert!(!bus.rooms.read().await.contains_key(&room));
    }

    #[tokio::test]
    async fn slow_subscriber_skips_oldest_and_keeps_order() {
        let bus = LocalBus::new();
        let room = RoomId::from("room-1");
        let mut sub = bus.subscribe(&room).await.unwrap();

        let total = 4 * (ROOM_CAPACITY + SUBSCRIPTION_BUFFER);
        for n in 0..total {
            bus.publish_raw(&room, n.to_string()).await.unwrap();
        }
        bus.publish_raw(&room, "done".into()).await.unwrap();

        let mut seen = Vec::new();
        loop {
            let raw = sub.recv().await.expect("subscription stays open");
            if raw == "done" {
                break;
            }
            seen.push(raw.parse::<usize>().unwrap());
        }
        assert!(!seen.is_empty());
        assert!(seen.len() < total);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }
}
