//! Participant and room identifiers.
//!
//! Both are opaque strings assigned by the account/match services. They are
//! ordered lexicographically, which is what politeness is derived from.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one participant (the authenticated user id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Identifier of a room (the conversation id both participants were matched into).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Pub/sub channel name for this room's signaling traffic.
    pub fn channel(&self) -> String {
        format!("room:{}", self.0)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_order_lexicographically() {
        assert!(ParticipantId::from("userA") < ParticipantId::from("userB"));
        assert!(ParticipantId::from("Zed") < ParticipantId::from("alice"));
    }

    #[test]
    fn room_channel_name() {
        assert_eq!(RoomId::from("room-1").channel(), "room:room-1");
    }
}
