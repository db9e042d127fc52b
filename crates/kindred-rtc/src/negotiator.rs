//! Perfect-negotiation state machine for one peer session.
//!
//! The negotiator is driven by its room's dispatch loop, one event at a time:
//! caller commands, inbound signals, and engine events. Every handler
//! re-checks its preconditions against the current [`PeerSession`], so
//! redelivered or stale messages are harmless.

use std::sync::Arc;

use kindred_common::models::{
    Candidate, ParticipantId, RoomId, SdpType, SessionDescription, SignalKind, SignalMessage,
};
use kindred_signal::SignalTransport;
use tracing::{debug, info, warn};

use crate::candidates::CandidateQueue;
use crate::error::RtcError;
use crate::monitor::{ConnectionMonitor, RecoveryPolicy, Transition};
use crate::peer::PeerConnection;
use crate::session::{ConnectionState, PeerSession, Politeness, SignalingState};

/// What happened to an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// A remote offer was accepted and answered.
    Answered,
    /// The answer to our outstanding offer was committed.
    AnswerAccepted,
    /// A redelivered offer we already answered; the answer was published again.
    AnswerResent,
    CandidateQueued,
    CandidateApplied,
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    OwnMessage,
    OtherRoom,
    UnknownSender,
    SessionClosed,
    /// Colliding offer discarded by the impolite side.
    Glare,
    DuplicateOffer,
    StaleAnswer,
    DuplicateCandidate,
}

pub struct Negotiator {
    session: PeerSession,
    queue: CandidateQueue,
    monitor: ConnectionMonitor,
    peer: Box<dyn PeerConnection>,
    transport: Arc<dyn SignalTransport>,
    offer_received: bool,
}

impl Negotiator {
    pub fn new(
        room: RoomId,
        local: ParticipantId,
        peer: Box<dyn PeerConnection>,
        transport: Arc<dyn SignalTransport>,
        recovery: RecoveryPolicy,
    ) -> Self {
        Self {
            session: PeerSession::new(room, local),
            queue: CandidateQueue::new(),
            monitor: ConnectionMonitor::new(recovery),
            peer,
            transport,
            offer_received: false,
        }
    }

    /// Bind the remote participant up front, fixing politeness immediately.
    pub fn with_remote(mut self, remote: ParticipantId) -> Self {
        self.session.identify_remote(&remote);
        self
    }

    pub fn session(&self) -> &PeerSession {
        &self.session
    }

    pub fn queued_candidates(&self) -> usize {
        self.queue.len()
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    /// True once any offer from the peer has been seen.
    pub fn offer_received(&self) -> bool {
        self.offer_received
    }

    fn room(&self) -> &RoomId {
        &self.session.room
    }

    fn local(&self) -> &ParticipantId {
        &self.session.local
    }

    /// Start a negotiation round by publishing a local offer.
    ///
    /// While an offer is outstanding this returns that offer without sending
    /// another. On failure the session is put back to `Stable`.
    pub async fn initiate(&mut self) -> Result<SessionDescription, RtcError> {
        match self.session.signaling_state {
            SignalingState::Closed => return Err(RtcError::Closed),
            SignalingState::HaveLocalOffer => {
                if let Some(offer) = &self.session.local_description {
                    debug!(room = %self.room(), "Offer already outstanding");
                    return Ok(offer.clone());
                }
            }
            SignalingState::HaveRemoteOffer => {
                return Err(RtcError::Negotiation("remote offer pending".into()));
            }
            SignalingState::Stable => {}
        }

        self.session.begin_offer();
        let result = self.send_offer().await;
        self.session.end_offer();

        if let Err(e) = &result {
            warn!(room = %self.room(), error = %e, "Offer attempt aborted");
            self.abandon_local_offer().await;
        }
        result
    }

    async fn send_offer(&mut self) -> Result<SessionDescription, RtcError> {
        let offer = self.peer.create_offer().await?;
        self.peer.set_local_description(offer.clone()).await?;
        self.session.commit_local_offer(offer.clone());

        let message = SignalMessage::offer(self.local().clone(), self.room().clone(), offer.clone());
        self.transport.publish(self.room(), &message).await?;
        info!(room = %self.room(), peer = %self.local(), "Offer sent");
        Ok(offer)
    }

    async fn abandon_local_offer(&mut self) {
        if self.session.signaling_state != SignalingState::HaveLocalOffer {
            return;
        }
        if let Err(e) = self.peer.rollback().await {
            warn!(room = %self.room(), error = %e, "Engine rollback failed");
        }
        self.session.rollback_local_offer();
    }

    /// Parse and apply a raw transport message.
    pub async fn on_raw(&mut self, raw: &str) -> Result<Applied, RtcError> {
        let message = SignalMessage::from_json(raw)?;
        self.on_message(message).await
    }

    /// Single entry point for inbound signals.
    pub async fn on_message(&mut self, message: SignalMessage) -> Result<Applied, RtcError> {
        if self.session.is_closed() {
            return Ok(Applied::Ignored(IgnoreReason::SessionClosed));
        }
        if &message.sender == self.local() {
            return Ok(Applied::Ignored(IgnoreReason::OwnMessage));
        }
        if &message.room != self.room() {
            warn!(room = %self.room(), other = %message.room, "Signal for another room dropped");
            return Ok(Applied::Ignored(IgnoreReason::OtherRoom));
        }
        message.validate()?;
        if !self.session.identify_remote(&message.sender) {
            warn!(room = %self.room(), sender = %message.sender, "Signal from unexpected participant dropped");
            return Ok(Applied::Ignored(IgnoreReason::UnknownSender));
        }

        debug!(room = %self.room(), sender = %message.sender, kind = %message.kind, "Signal received");
        match message.kind {
            SignalKind::Offer | SignalKind::Answer => {
                let Some(description) = message.description().cloned() else {
                    return Err(RtcError::Negotiation(format!("{} without description", message.kind)));
                };
                if message.kind == SignalKind::Offer {
                    self.handle_offer(description).await
                } else {
                    self.handle_answer(description).await
                }
            }
            SignalKind::Candidate => {
                let Some(candidate) = message.as_candidate().cloned() else {
                    return Err(RtcError::Negotiation("candidate without payload".into()));
                };
                self.handle_candidate(candidate).await
            }
        }
    }

    async fn handle_offer(&mut self, offer: SessionDescription) -> Result<Applied, RtcError> {
        self.offer_received = true;

        if self.session.remote_description.as_ref() == Some(&offer) {
            return self.handle_redelivered_offer().await;
        }

        let collision = self.session.negotiation_in_flight || !self.session.is_stable();
        if collision {
            match self.session.politeness.unwrap_or(Politeness::Impolite) {
                Politeness::Impolite => {
                    info!(room = %self.room(), peer = %self.local(), "Glare: keeping local offer, ignoring peer's");
                    return Ok(Applied::Ignored(IgnoreReason::Glare));
                }
                Politeness::Polite => {
                    info!(room = %self.room(), peer = %self.local(), "Glare: rolling back local offer");
                    self.peer.rollback().await?;
                    self.session.rollback_local_offer();
                }
            }
        }

        self.accept_offer(offer).await?;
        Ok(Applied::Answered)
    }

    async fn accept_offer(&mut self, offer: SessionDescription) -> Result<(), RtcError> {
        self.peer.set_remote_description(offer.clone()).await?;
        self.session.commit_remote_offer(offer);
        self.flush_candidates().await;

        let answer = match self.build_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(room = %self.room(), error = %e, "Could not answer offer");
                if let Err(e) = self.peer.rollback().await {
                    warn!(room = %self.room(), error = %e, "Engine rollback failed");
                }
                self.session.abort_remote_offer();
                return Err(e);
            }
        };
        self.session.commit_local_answer(answer.clone());

        let message = SignalMessage::answer(self.local().clone(), self.room().clone(), answer);
        self.transport.publish(self.room(), &message).await?;
        info!(room = %self.room(), peer = %self.local(), "Answer sent");
        Ok(())
    }

    /// The peer re-sent an offer we already hold. If our answer to it is
    /// still current, publish it again: the first copy may never have left.
    async fn handle_redelivered_offer(&mut self) -> Result<Applied, RtcError> {
        let answer = match &self.session.local_description {
            Some(answer) if self.session.is_stable() && answer.sdp_type == SdpType::Answer => answer.clone(),
            _ => {
                debug!(room = %self.room(), "Redelivered offer ignored");
                return Ok(Applied::Ignored(IgnoreReason::DuplicateOffer));
            }
        };
        let message = SignalMessage::answer(self.local().clone(), self.room().clone(), answer);
        self.transport.publish(self.room(), &message).await?;
        info!(room = %self.room(), peer = %self.local(), "Answer re-sent for redelivered offer");
        Ok(Applied::AnswerResent)
    }

    async fn build_answer(&mut self) -> Result<SessionDescription, RtcError> {
        let answer = self.peer.create_answer().await?;
        self.peer.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    async fn handle_answer(&mut self, answer: SessionDescription) -> Result<Applied, RtcError> {
        if self.session.signaling_state != SignalingState::HaveLocalOffer {
            debug!(room = %self.room(), state = ?self.session.signaling_state, "Stale answer ignored");
            return Ok(Applied::Ignored(IgnoreReason::StaleAnswer));
        }

        if let Err(e) = self.peer.set_remote_description(answer.clone()).await {
            warn!(room = %self.room(), error = %e, "Could not apply answer, abandoning offer");
            self.abandon_local_offer().await;
            return Err(e.into());
        }
        self.session.commit_remote_answer(answer);
        self.flush_candidates().await;
        info!(room = %self.room(), peer = %self.local(), "Answer accepted");
        Ok(Applied::AnswerAccepted)
    }

    async fn handle_candidate(&mut self, candidate: Candidate) -> Result<Applied, RtcError> {
        if self.queue.is_known(&candidate) {
            return Ok(Applied::Ignored(IgnoreReason::DuplicateCandidate));
        }

        if self.session.remote_description.is_none() {
            self.queue.enqueue(candidate);
            debug!(room = %self.room(), queued = self.queue.len(), "Candidate queued");
            return Ok(Applied::CandidateQueued);
        }

        self.queue.mark_applied(&candidate);
        if let Err(e) = self.peer.add_ice_candidate(candidate.clone()).await {
            self.queue.forget(&candidate);
            return Err(e.into());
        }
        Ok(Applied::CandidateApplied)
    }

    async fn flush_candidates(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let peer = self.peer.as_ref();
        let report = self.queue.flush(|c| peer.add_ice_candidate(c)).await;
        debug!(room = %self.room(), applied = report.applied, failed = report.failed, "Candidate queue flushed");
    }

    /// Trickle a local candidate to the peer.
    pub async fn send_candidate(&mut self, candidate: Candidate) -> Result<(), RtcError> {
        if self.session.is_closed() {
            return Err(RtcError::Closed);
        }
        let message = SignalMessage::candidate(self.local().clone(), self.room().clone(), candidate);
        self.transport.publish(self.room(), &message).await?;
        Ok(())
    }

    /// Record an engine connectivity report. The impolite side leads
    /// recovery, so both peers never renegotiate at once.
    pub fn on_connection_state(&mut self, state: ConnectionState) -> Option<Transition> {
        if self.session.is_closed() {
            return None;
        }
        let leads = self.session.politeness == Some(Politeness::Impolite);
        let transition = self.monitor.observe(state, leads)?;
        self.session.set_connection_state(state);
        info!(room = %self.room(), peer = %self.local(), from = %transition.from, to = %transition.to, "Connection state change");
        Some(transition)
    }

    /// Move to `Closed`, drop queued candidates, release the engine.
    /// Returns false if already closed.
    pub async fn close(&mut self) -> bool {
        if self.session.is_closed() {
            return false;
        }
        self.session.close();
        self.queue.clear();
        self.peer.close().await;
        info!(room = %self.room(), peer = %self.local(), "Session closed");
        true
    }
}
