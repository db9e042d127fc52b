//! Signaling messages exchanged between the two participants of a room.
//!
//! The wire shape mirrors what browser clients publish on the room channel:
//!
//! ```json
//! { "kind": "offer", "sender": "userA", "room": "room-1",
//!   "payload": { "type": "offer", "sdp": "v=0..." }, "sentAt": 1717171717171 }
//! ```
//!
//! Candidate payloads use the browser's `RTCIceCandidateInit` field names.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::ids::{ParticipantId, RoomId};
use crate::validation::validate_id;

/// What a signal message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Offer => write!(f, "offer"),
            SignalKind::Answer => write!(f, "answer"),
            SignalKind::Candidate => write!(f, "candidate"),
        }
    }
}

/// Session description type. Rollback never crosses the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Negotiated media/transport parameters for one side of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One reachable network path offered to the other peer.
///
/// An empty `candidate` string is the browser's end-of-candidates marker and
/// is relayed like any other candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl Candidate {
    pub fn new(candidate: impl Into<String>, sdp_mid: Option<String>, index: Option<u16>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid,
            sdp_m_line_index: index,
            username_fragment: None,
        }
    }

    /// Content signature used to recognise retransmitted candidates.
    ///
    /// Two candidates with the same line, media section, and ICE credentials
    /// produce the same signature regardless of which message carried them.
    pub fn signature(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.candidate.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.sdp_mid.as_deref().unwrap_or_default().as_bytes());
        hasher.update([0u8]);
        if let Some(index) = self.sdp_m_line_index {
            hasher.update(index.to_be_bytes());
        }
        hasher.update([0u8]);
        hasher.update(self.username_fragment.as_deref().unwrap_or_default().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Payload of a signal message: a session description or a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalPayload {
    Description(SessionDescription),
    Candidate(Candidate),
}

/// An immutable signaling message, relayed verbatim by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub kind: SignalKind,
    pub sender: ParticipantId,
    pub room: RoomId,
    pub payload: SignalPayload,
    /// Epoch milliseconds at the sender.
    #[serde(rename = "sentAt")]
    pub sent_at: i64,
}

/// A message that could not be parsed or is structurally inconsistent.
#[derive(Debug, thiserror::Error)]
pub enum MalformedSignal {
    #[error("Unparseable signal: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Payload does not match kind '{kind}'")]
    KindMismatch { kind: SignalKind },

    #[error("Session description has an empty SDP")]
    EmptySdp,

    #[error("Invalid {field}: {reason}")]
    InvalidId { field: &'static str, reason: String },
}

impl SignalMessage {
    pub fn offer(sender: ParticipantId, room: RoomId, description: SessionDescription) -> Self {
        Self::stamped(SignalKind::Offer, sender, room, SignalPayload::Description(description))
    }

    pub fn answer(sender: ParticipantId, room: RoomId, description: SessionDescription) -> Self {
        Self::stamped(SignalKind::Answer, sender, room, SignalPayload::Description(description))
    }

    pub fn candidate(sender: ParticipantId, room: RoomId, candidate: Candidate) -> Self {
        Self::stamped(SignalKind::Candidate, sender, room, SignalPayload::Candidate(candidate))
    }

    fn stamped(kind: SignalKind, sender: ParticipantId, room: RoomId, payload: SignalPayload) -> Self {
        Self {
            kind,
            sender,
            room,
            payload,
            sent_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Parse and structurally validate a message received from a transport.
    pub fn from_json(raw: &str) -> Result<Self, MalformedSignal> {
        let message: SignalMessage = serde_json::from_str(raw)?;
        message.validate()?;
        Ok(message)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Check that ids are usable and that the payload agrees with `kind`.
    pub fn validate(&self) -> Result<(), MalformedSignal> {
        validate_id(self.sender.as_str())
            .map_err(|reason| MalformedSignal::InvalidId { field: "sender", reason })?;
        validate_id(self.room.as_str())
            .map_err(|reason| MalformedSignal::InvalidId { field: "room", reason })?;

        match (&self.kind, &self.payload) {
            (SignalKind::Offer, SignalPayload::Description(d)) if d.sdp_type == SdpType::Offer => {
                non_empty_sdp(d)
            }
            (SignalKind::Answer, SignalPayload::Description(d))
                if d.sdp_type == SdpType::Answer =>
            {
                non_empty_sdp(d)
            }
            (SignalKind::Candidate, SignalPayload::Candidate(_)) => Ok(()),
            (kind, _) => Err(MalformedSignal::KindMismatch { kind: *kind }),
        }
    }

    pub fn description(&self) -> Option<&SessionDescription> {
        match &self.payload {
            SignalPayload::Description(d) => Some(d),
            SignalPayload::Candidate(_) => None,
        }
    }

    pub fn as_candidate(&self) -> Option<&Candidate> {
        match &self.payload {
            SignalPayload::Candidate(c) => Some(c),
            SignalPayload::Description(_) => None,
        }
    }
}

fn non_empty_sdp(description: &SessionDescription) -> Result<(), MalformedSignal> {
    if description.sdp.trim().is_empty() {
        Err(MalformedSignal::EmptySdp)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_browser_offer() {
        let raw = r#"{"kind":"offer","sender":"userA","room":"room-1",
            "payload":{"type":"offer","sdp":"v=0\r\n"},"sentAt":1717171717171}"#;
        let msg = SignalMessage::from_json(raw).expect("valid offer");
        assert_eq!(msg.kind, SignalKind::Offer);
        assert_eq!(msg.sender.as_str(), "userA");
        assert_eq!(msg.sent_at, 1_717_171_717_171);
        assert_eq!(msg.description().map(|d| d.sdp_type), Some(SdpType::Offer));
    }

    #[test]
    fn parses_browser_candidate() {
        let raw = r#"{"kind":"candidate","sender":"userB","room":"room-1",
            "payload":{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 54400 typ host",
            "sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"a1b2"},"sentAt":1}"#;
        let msg = SignalMessage::from_json(raw).expect("valid candidate");
        let candidate = msg.as_candidate().expect("candidate payload");
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_m_line_index, Some(0));
        assert_eq!(candidate.username_fragment.as_deref(), Some("a1b2"));
    }

    #[test]
    fn serializes_wire_field_names() {
        let msg = SignalMessage::candidate(
            ParticipantId::from("userA"),
            RoomId::from("room-1"),
            Candidate::new("candidate:1", Some("0".into()), Some(0)),
        );
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["kind"], "candidate");
        assert!(value["sentAt"].is_i64());
        assert_eq!(value["payload"]["sdpMLineIndex"], 0);
        assert!(value["payload"].get("usernameFragment").is_none());
    }

    #[test]
    fn rejects_kind_payload_mismatch() {
        let raw = r#"{"kind":"answer","sender":"userA","room":"room-1",
            "payload":{"type":"offer","sdp":"v=0"},"sentAt":1}"#;
        assert!(matches!(
            SignalMessage::from_json(raw),
            Err(MalformedSignal::KindMismatch { kind: SignalKind::Answer })
        ));

        let raw = r#"{"kind":"offer","sender":"userA","room":"room-1",
            "payload":{"candidate":"candidate:1"},"sentAt":1}"#;
        assert!(matches!(
            SignalMessage::from_json(raw),
            Err(MalformedSignal::KindMismatch { .. })
        ));
    }

    #[test]
    fn rejects_garbage_and_empty_sdp() {
        assert!(matches!(
            SignalMessage::from_json("not json"),
            Err(MalformedSignal::Json(_))
        ));
        let raw = r#"{"kind":"offer","sender":"userA","room":"room-1",
            "payload":{"type":"offer","sdp":"  "},"sentAt":1}"#;
        assert!(matches!(SignalMessage::from_json(raw), Err(MalformedSignal::EmptySdp)));
        let raw = r#"{"kind":"offer","sender":"","room":"room-1",
            "payload":{"type":"offer","sdp":"v=0"},"sentAt":1}"#;
        assert!(matches!(
            SignalMessage::from_json(raw),
            Err(MalformedSignal::InvalidId { field: "sender", .. })
        ));
    }

    #[test]
    fn candidate_signature_ignores_message_envelope() {
        let a = Candidate::new("candidate:1 1 udp 1 10.0.0.1 1 typ host", Some("0".into()), Some(0));
        let b = a.clone();
        let c = Candidate::new("candidate:1 1 udp 1 10.0.0.1 1 typ host", Some("1".into()), Some(1));
        assert_eq!(a.signature(), b.signature());
        assert_ne!(a.signature(), c.signature());
    }
}
