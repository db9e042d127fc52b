//! Redis pub/sub transport.
//!
//! Every room maps to the channel `room:{id}`. Publishing goes through a
//! shared `ConnectionManager`; each subscription opens its own async pub/sub
//! connection, since a subscribed Redis connection cannot issue commands.

use async_trait::async_trait;
use futures_util::StreamExt;
use kindred_common::models::RoomId;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;

use crate::{Ack, SUBSCRIPTION_BUFFER, SignalTransport, Subscription, TransportError};

#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    publisher: ConnectionManager,
}

impl RedisBus {
    /// Connect to Redis. Fails fast if the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let client = redis::Client::open(url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        tracing::info!("Connected to Redis signal bus");
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl SignalTransport for RedisBus {
    async fn publish_raw(&self, room: &RoomId, raw: String) -> Result<Ack, TransportError> {
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn
            .publish(room.channel(), raw)
            .await
            .map_err(|e| TransportError::Publish {
                room: room.clone(),
                message: e.to_string(),
            })?;
        Ok(Ack {
            receivers: receivers.max(0) as usize,
        })
    }

    async fn subscribe(&self, room: &RoomId) -> Result<Subscription, TransportError> {
        let channel = room.channel();
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| TransportError::Subscribe {
                room: room.clone(),
                message: e.to_string(),
            })?;
        pubsub
            .subscribe(&channel)
            .await
            .map_err(|e| TransportError::Subscribe {
                room: room.clone(),
                message: e.to_string(),
            })?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let room_name = room.clone();

        let pump = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let raw: String = match msg.get_payload() {
                    Ok(raw) => raw,
                    Err(e) => {
                        tracing::warn!(room = %room_name, error = %e, "Non-text payload on signal channel");
                        continue;
                    }
                };
                if tx.send(raw).await.is_err() {
                    break;
                }
            }
            // Dropping `tx` here is what the subscriber sees as subscription loss.
            if !tx.is_closed() {
                tracing::warn!(room = %room_name, "Redis subscription stream ended");
            }
        });

        tracing::debug!(room = %room, channel = %channel, "Subscribed to Redis channel");
        Ok(Subscription::new(room.clone(), rx).with_pump(pump))
    }
}
