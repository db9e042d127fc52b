//! Per-room peer session: descriptions, signaling state, and negotiation flags.
//!
//! A [`PeerSession`] is owned by exactly one negotiator and only changes
//! through the transition methods below, each of which logs the move.

use kindred_common::models::{ParticipantId, RoomId, SessionDescription};
use serde::Serialize;
use tracing::debug;

/// Offer/answer progress of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Which side yields when both peers offer at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Politeness {
    /// Rolls back its own offer and answers the peer's.
    Polite,
    /// Keeps its offer and ignores the colliding one.
    Impolite,
}

impl Politeness {
    /// The lexicographically greater id is polite. Both peers compute the
    /// same answer, so exactly one of them yields.
    pub fn for_pair(local: &ParticipantId, remote: &ParticipantId) -> Self {
        if local > remote {
            Politeness::Polite
        } else {
            Politeness::Impolite
        }
    }
}

/// Connectivity of the underlying transport, as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectionState::Disconnected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSession {
    pub room: RoomId,
    pub local: ParticipantId,
    /// Learned from the first foreign message unless given up front.
    pub remote: Option<ParticipantId>,
    pub local_description: Option<SessionDescription>,
    pub remote_description: Option<SessionDescription>,
    pub signaling_state: SignalingState,
    pub negotiation_in_flight: bool,
    pub politeness: Option<Politeness>,
    pub connection_state: ConnectionState,

    /// Descriptions to restore if the pending offer is abandoned.
    #[serde(skip)]
    stashed_local: Option<SessionDescription>,
    #[serde(skip)]
    stashed_remote: Option<SessionDescription>,
}

impl PeerSession {
    pub fn new(room: RoomId, local: ParticipantId) -> Self {
        Self {
            room,
            local,
            remote: None,
            local_description: None,
            remote_description: None,
            signaling_state: SignalingState::Stable,
            negotiation_in_flight: false,
            politeness: None,
            connection_state: ConnectionState::New,
            stashed_local: None,
            stashed_remote: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.signaling_state == SignalingState::Closed
    }

    pub fn is_stable(&self) -> bool {
        self.signaling_state == SignalingState::Stable
    }

    /// Bind the remote participant. Returns false if `sender` is neither the
    /// bound remote nor the first one seen.
    pub fn identify_remote(&mut self, sender: &ParticipantId) -> bool {
        match &self.remote {
            Some(remote) => remote == sender,
            None => {
                let politeness = Politeness::for_pair(&self.local, sender);
                debug!(room = %self.room, peer = %sender, ?politeness, "Remote participant identified");
                self.remote = Some(sender.clone());
                self.politeness = Some(politeness);
                true
            }
        }
    }

    pub(crate) fn begin_offer(&mut self) {
        self.negotiation_in_flight = true;
    }

    pub(crate) fn end_offer(&mut self) {
        self.negotiation_in_flight = false;
    }

    pub(crate) fn commit_local_offer(&mut self, offer: SessionDescription) {
        self.stashed_local = self.local_description.replace(offer);
        self.transition(SignalingState::HaveLocalOffer);
    }

    /// Abandon the pending local offer and restore the previous description.
    pub(crate) fn rollback_local_offer(&mut self) {
        if self.signaling_state != SignalingState::HaveLocalOffer {
            return;
        }
        self.local_description = self.stashed_local.take();
        self.transition(SignalingState::Stable);
    }

    pub(crate) fn commit_remote_offer(&mut self, offer: SessionDescription) {
        self.stashed_remote = self.remote_description.replace(offer);
        self.transition(SignalingState::HaveRemoteOffer);
    }

    /// Undo a remote offer that could not be answered.
    pub(crate) fn abort_remote_offer(&mut self) {
        if self.signaling_state != SignalingState::HaveRemoteOffer {
            return;
        }
        self.remote_description = self.stashed_remote.take();
        self.transition(SignalingState::Stable);
    }

    pub(crate) fn commit_local_answer(&mut self, answer: SessionDescription) {
        self.local_description = Some(answer);
        self.complete_round();
    }

    pub(crate) fn commit_remote_answer(&mut self, answer: SessionDescription) {
        self.remote_description = Some(answer);
        self.complete_round();
    }

    pub(crate) fn set_connection_state(&mut self, state: ConnectionState) {
        self.connection_state = state;
    }

    pub(crate) fn close(&mut self) {
        self.negotiation_in_flight = false;
        self.stashed_local = None;
        self.stashed_remote = None;
        self.connection_state = ConnectionState::Closed;
        self.transition(SignalingState::Closed);
    }

    fn complete_round(&mut self) {
        self.stashed_local = None;
        self.stashed_remote = None;
        self.transition(SignalingState::Stable);
    }

    fn transition(&mut self, next: SignalingState) {
        let prev = std::mem::replace(&mut self.signaling_state, next);
        if prev != next {
            debug!(room = %self.room, peer = %self.local, from = ?prev, to = ?next, "Signaling state change");
        }
    }
}
