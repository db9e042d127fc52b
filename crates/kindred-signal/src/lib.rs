//! # kindred-signal
//!
//! The room-scoped publish/subscribe bus that carries signaling messages
//! between the two participants of a room.
//!
//! Delivery is at-least-once with no ordering guarantee across senders, and a
//! publisher may receive its own messages back. Consumers are expected to
//! filter and re-validate, which the negotiation core does.
//!
//! Adapters:
//! - [`LocalBus`]: in-process fan-out (tests, demo, single-node relay)
//! - [`RedisBus`]: Redis pub/sub, so several relay nodes share rooms
//! - [`RelayClient`]: WebSocket client of the Kindred relay

pub mod local;
pub mod redis_bus;
pub mod relay_client;

pub use local::LocalBus;
pub use redis_bus::RedisBus;
pub use relay_client::{RelayClient, RelayClientConfig};

use async_trait::async_trait;
use kindred_common::models::{RoomId, SignalMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Buffer between a transport's receive side and the subscriber.
///
/// Delivery is best effort: a subscriber that falls this far behind loses
/// signals (logged as a warning) rather than stalling the transport. The
/// negotiation layer recovers lost offers and answers through redelivery
/// and recovery renegotiation.
pub const SUBSCRIPTION_BUFFER: usize = 256;

/// Publish acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Subscribers the bus handed the message to (0 when nobody listens yet).
    pub receivers: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("Publish to {room} failed: {message}")]
    Publish { room: RoomId, message: String },

    #[error("Subscribe to {room} failed: {message}")]
    Subscribe { room: RoomId, message: String },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Room-scoped signaling bus.
///
/// Implementations are shared across rooms (`Arc<dyn SignalTransport>`) and
/// injected into each coordinator at construction.
#[async_trait]
pub trait SignalTransport: Send + Sync {
    /// Publish an already-serialized message to every subscriber of `room`.
    async fn publish_raw(&self, room: &RoomId, raw: String) -> Result<Ack, TransportError>;

    /// Start receiving `room`'s traffic. Messages published after this returns
    /// are delivered to the subscription.
    async fn subscribe(&self, room: &RoomId) -> Result<Subscription, TransportError>;

    /// Serialize and publish a signal message.
    async fn publish(&self, room: &RoomId, message: &SignalMessage) -> Result<Ack, TransportError> {
        let raw = message.to_json()?;
        self.publish_raw(room, raw).await
    }
}

/// A live subscription to one room.
///
/// [`recv`](Self::recv) yields raw message text. It returns `None` either
/// after [`cancel`](Self::cancel) or when the transport lost the subscription;
/// [`is_cancelled`](Self::is_cancelled) tells the two apart.
pub struct Subscription {
    id: Uuid,
    room: RoomId,
    rx: mpsc::Receiver<String>,
    pump: Option<JoinHandle<()>>,
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
    cancelled: bool,
}

impl Subscription {
    pub fn new(room: RoomId, rx: mpsc::Receiver<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            room,
            rx,
            pump: None,
            on_cancel: None,
            cancelled: false,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Task feeding this subscription; aborted on cancel.
    pub fn with_pump(mut self, pump: JoinHandle<()>) -> Self {
        self.pump = Some(pump);
        self
    }

    /// Hook run exactly once when the subscription is cancelled or dropped.
    pub fn on_cancel(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_cancel = Some(Box::new(hook));
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Next raw message, or `None` once cancelled or lost.
    pub async fn recv(&mut self) -> Option<String> {
        if self.cancelled {
            return None;
        }
        self.rx.recv().await
    }

    /// Stop delivery. Nothing is yielded after this returns. Idempotent.
    pub fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        self.rx.close();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(hook) = self.on_cancel.take() {
            hook();
        }
        tracing::debug!(room = %self.room, subscription = %self.id, "Subscription cancelled");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("room", &self.room)
            .field("cancelled", &self.cancelled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn cancel_stops_delivery_and_runs_hook_once() {
        let (tx, rx) = mpsc::channel(4);
        let hooks = Arc::new(AtomicUsize::new(0));
        let counter = hooks.clone();
        let mut sub = Subscription::new(RoomId::from("room-1"), rx).on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tx.send("before".into()).await.unwrap();
        assert_eq!(sub.recv().await.as_deref(), Some("before"));

        sub.cancel();
        sub.cancel();
        assert!(tx.send("after".into()).await.is_err());
        assert_eq!(sub.recv().await, None);
        assert!(sub.is_cancelled());

        drop(sub);
        assert_eq!(hooks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn source_ending_is_not_a_cancel() {
        let (tx, rx) = mpsc::channel(4);
        let mut sub = Subscription::new(RoomId::from("room-1"), rx);
        drop(tx);
        assert_eq!(sub.recv().await, None);
        assert!(!sub.is_cancelled());
    }
}
