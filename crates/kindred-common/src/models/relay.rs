//! Relay protocol frames, shared between the relay server and `RelayClient`.
//!
//! Frames are JSON objects tagged `{"op": ..., "d": ...}`. Signal messages are
//! carried as raw JSON strings so the relay forwards exactly what was published.
//! Every client frame is answered by exactly one reply frame (`Subscribed`,
//! `Unsubscribed`, `Ack`, or `Error`), in the order the frames were sent;
//! `Signal` frames are unsolicited.

use serde::{Deserialize, Serialize};

use super::ids::RoomId;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "d")]
pub enum RelayFrame {
    // === Client → Relay ===
    /// Start receiving a room's signaling traffic.
    Subscribe { room: RoomId },

    /// Stop receiving a room's signaling traffic.
    Unsubscribe { room: RoomId },

    /// Publish a serialized `SignalMessage` to a room.
    Publish { room: RoomId, message: String },

    // === Relay → Client ===
    /// Subscription is live; messages published after this frame are delivered.
    Subscribed { room: RoomId },

    /// Subscription released.
    Unsubscribed { room: RoomId },

    /// A message published to a subscribed room.
    Signal { room: RoomId, message: String },

    /// Publish accepted; `receivers` is the fan-out count reported by the bus.
    Ack { room: RoomId, receivers: usize },

    /// Error occurred.
    Error { code: u32, message: String },
}

/// Error codes carried by [`RelayFrame::Error`].
pub mod codes {
    /// Frame or signal message could not be parsed / validated.
    pub const MALFORMED: u32 = 4000;
    /// Operation on a room the connection has not subscribed to.
    pub const NOT_SUBSCRIBED: u32 = 4001;
    /// `Publish` frame room differs from the message's room.
    pub const ROOM_MISMATCH: u32 = 4002;
    /// Frame is only valid relay → client.
    pub const INVALID_OPCODE: u32 = 4003;
    /// Backing bus failed.
    pub const BUS_UNAVAILABLE: u32 = 5000;
}

impl RelayFrame {
    pub fn error(code: u32, message: impl Into<String>) -> Self {
        RelayFrame::Error {
            code,
            message: message.into(),
        }
    }
}
