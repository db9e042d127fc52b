//! Live subscriber counts per room on this relay node.

use kindred_common::models::RoomId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct RoomStats {
    counts: Arc<RwLock<HashMap<RoomId, usize>>>,
}

impl RoomStats {
    pub async fn joined(&self, room: &RoomId) {
        let mut counts = self.counts.write().await;
        *counts.entry(room.clone()).or_insert(0) += 1;
    }

    pub async fn left(&self, room: &RoomId) {
        let mut counts = self.counts.write().await;
        if let Some(count) = counts.get_mut(room) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(room);
            }
        }
    }

    pub async fn subscribers(&self, room: &RoomId) -> usize {
        self.counts.read().await.get(room).copied().unwrap_or(0)
    }

    /// Rooms with at least one subscriber.
    pub async fn active_rooms(&self) -> usize {
        self.counts.read().await.len()
    }
}
