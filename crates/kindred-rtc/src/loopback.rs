//! Deterministic in-memory engine.
//!
//! Produces minimal SDP with one `m=` section per local track, trickles one
//! host candidate after the first local description, and reports
//! `Connecting` → `Connected` whenever an offer/answer round completes.
//! Tests use the factory handle to inject failures and connectivity changes
//! and to inspect what the engine was given.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use kindred_common::models::{Candidate, SdpType, SessionDescription};
use tokio::sync::mpsc;

use crate::error::{EngineError, MediaCause};
use crate::peer::{
    LocalTrack, LocalTracks, MediaSource, PeerConnection, PeerConnectionFactory, PeerEvent, RemoteTrack,
    RtcConfig, TrackKind,
};
use crate::session::ConnectionState;

static NEXT_PORT: AtomicU32 = AtomicU32::new(0);

/// Engine operations that can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddCandidate,
}

impl Step {
    fn name(&self) -> &'static str {
        match self {
            Step::CreateOffer => "createOffer",
            Step::CreateAnswer => "createAnswer",
            Step::SetLocalDescription => "setLocalDescription",
            Step::SetRemoteDescription => "setRemoteDescription",
            Step::AddCandidate => "addIceCandidate",
        }
    }
}

#[derive(Default)]
struct Shared {
    fail_next: HashSet<Step>,
    applied: Vec<Candidate>,
    peers: Vec<Arc<LoopbackPeer>>,
    rollbacks: usize,
}

/// Factory and inspection handle for loopback peers. Cheap to clone.
#[derive(Clone)]
pub struct LoopbackFactory {
    shared: Arc<Mutex<Shared>>,
    gather_candidates: bool,
}

impl Default for LoopbackFactory {
    fn default() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            gather_candidates: true,
        }
    }
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peers created by this factory never trickle local candidates.
    pub fn without_candidates(mut self) -> Self {
        self.gather_candidates = false;
        self
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next call of `step` fail.
    pub fn fail_next(&self, step: Step) {
        self.shared().fail_next.insert(step);
    }

    /// Remote candidates the engine accepted, in application order.
    pub fn applied_candidates(&self) -> Vec<Candidate> {
        self.shared().applied.clone()
    }

    pub fn rollbacks(&self) -> usize {
        self.shared().rollbacks
    }

    pub fn closed_peers(&self) -> usize {
        self.shared().peers.iter().filter(|p| p.state().closed).count()
    }

    /// Report a connectivity change from every live peer.
    pub fn set_connection_state(&self, state: ConnectionState) {
        let peers = self.shared().peers.clone();
        for peer in peers {
            peer.report(state);
        }
    }
}

#[async_trait]
impl PeerConnectionFactory for LoopbackFactory {
    async fn create(
        &self,
        config: &RtcConfig,
        tracks: &LocalTracks,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Box<dyn PeerConnection>, EngineError> {
        let port = 50000 + NEXT_PORT.fetch_add(1, Ordering::Relaxed) % 10000;
        tracing::debug!(port, ice_servers = config.ice_servers.len(), "Loopback peer created");

        let peer = Arc::new(LoopbackPeer {
            factory: self.shared.clone(),
            events,
            tracks: tracks.clone(),
            port,
            gather_candidates: self.gather_candidates,
            state: Mutex::new(PeerState::default()),
        });
        self.shared().peers.push(peer.clone());
        Ok(Box::new(LoopbackConnection(peer)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Signaling {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

#[derive(Default)]
struct PeerState {
    signaling: Signaling,
    local: Option<SessionDescription>,
    previous_local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    previous_remote: Option<SessionDescription>,
    connection: Option<ConnectionState>,
    version: u32,
    gathered: bool,
    announced_tracks: HashSet<String>,
    closed: bool,
}

struct LoopbackPeer {
    factory: Arc<Mutex<Shared>>,
    events: mpsc::Sender<PeerEvent>,
    tracks: LocalTracks,
    port: u32,
    gather_candidates: bool,
    state: Mutex<PeerState>,
}

impl LoopbackPeer {
    fn state(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self, step: Step) -> Result<(), EngineError> {
        if self.state().closed {
            return Err(EngineError::Closed);
        }
        let mut factory = self.factory.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if factory.fail_next.remove(&step) {
            return Err(EngineError::operation(step.name(), "injected failure"));
        }
        Ok(())
    }

    fn emit(&self, event: PeerEvent) {
        if self.events.try_send(event).is_err() {
            tracing::warn!(port = self.port, "Loopback event dropped");
        }
    }

    fn report(&self, state: ConnectionState) {
        {
            let mut s = self.state();
            if s.closed {
                return;
            }
            s.connection = Some(state);
        }
        self.emit(PeerEvent::ConnectionState(state));
    }

    fn sdp(&self, sdp_type: SdpType, version: u32) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {port} {version} IN IP4 127.0.0.1\r\ns=kindred-loopback\r\nt=0 0\r\na=type:{kind}\r\n",
            port = self.port,
            kind = match sdp_type {
                SdpType::Offer => "offer",
                SdpType::Answer => "answer",
            },
        );
        for (mid, track) in self.tracks.tracks.iter().enumerate() {
            sdp.push_str(&format!(
                "m={} {} UDP/TLS/RTP/SAVPF 0\r\na=mid:{mid}\r\na=msid:{} {}\r\n",
                track.kind, self.port, self.tracks.stream_id, track.id
            ));
        }
        sdp
    }

    /// Tracks announced in a remote description that were not reported yet.
    fn new_remote_tracks(state: &mut PeerState, description: &SessionDescription) -> Vec<RemoteTrack> {
        let mut found = Vec::new();
        let mut kind = None;
        for line in description.sdp.lines() {
            if let Some(rest) = line.strip_prefix("m=") {
                kind = match rest.split_whitespace().next() {
                    Some("audio") => Some(TrackKind::Audio),
                    Some("video") => Some(TrackKind::Video),
                    _ => None,
                };
            } else if let (Some(k), Some(rest)) = (kind, line.strip_prefix("a=msid:")) {
                let mut parts = rest.split_whitespace();
                if let (Some(stream_id), Some(id)) = (parts.next(), parts.next()) {
                    if state.announced_tracks.insert(id.to_owned()) {
                        found.push(RemoteTrack {
                            id: id.to_owned(),
                            kind: k,
                            stream_id: stream_id.to_owned(),
                        });
                    }
                }
            }
        }
        found
    }

    /// A completed round (re)establishes connectivity.
    fn round_completed(&self) {
        let connection = self.state().connection;
        match connection {
            None | Some(ConnectionState::New) => {
                self.report(ConnectionState::Connecting);
                self.report(ConnectionState::Connected);
            }
            Some(ConnectionState::Disconnected) | Some(ConnectionState::Connecting) => {
                self.report(ConnectionState::Connected);
            }
            _ => {}
        }
    }
}

struct LoopbackConnection(Arc<LoopbackPeer>);

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        self.0.check(Step::CreateOffer)?;
        let version = {
            let mut s = self.0.state();
            s.version += 1;
            s.version
        };
        Ok(SessionDescription::offer(self.0.sdp(SdpType::Offer, version)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.0.check(Step::CreateAnswer)?;
        let version = {
            let mut s = self.0.state();
            if s.signaling != Signaling::HaveRemoteOffer {
                return Err(EngineError::operation("createAnswer", "no remote offer"));
            }
            s.version += 1;
            s.version
        };
        Ok(SessionDescription::answer(self.0.sdp(SdpType::Answer, version)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        self.0.check(Step::SetLocalDescription)?;
        let (completed, gather) = {
            let mut s = self.0.state();
            let completed = match (description.sdp_type, s.signaling) {
                (SdpType::Offer, Signaling::Stable) => {
                    s.previous_local = s.local.take();
                    s.signaling = Signaling::HaveLocalOffer;
                    false
                }
                (SdpType::Answer, Signaling::HaveRemoteOffer) => {
                    s.signaling = Signaling::Stable;
                    true
                }
                (sdp_type, signaling) => {
                    return Err(EngineError::operation(
                        "setLocalDescription",
                        format!("{sdp_type:?} in {signaling:?}"),
                    ));
                }
            };
            s.local = Some(description);
            let gather = self.0.gather_candidates && !s.gathered;
            s.gathered = true;
            (completed, gather)
        };

        if gather {
            self.0.emit(PeerEvent::LocalCandidate(Candidate::new(
                format!(
                    "candidate:1 1 udp 2122260223 127.0.0.1 {} typ host",
                    self.0.port
                ),
                Some("0".into()),
                Some(0),
            )));
        }
        if completed {
            self.0.round_completed();
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        self.0.check(Step::SetRemoteDescription)?;
        let (completed, tracks) = {
            let mut s = self.0.state();
            let completed = match (description.sdp_type, s.signaling) {
                (SdpType::Offer, Signaling::Stable) => {
                    s.previous_remote = s.remote.clone();
                    s.signaling = Signaling::HaveRemoteOffer;
                    false
                }
                (SdpType::Answer, Signaling::HaveLocalOffer) => {
                    s.signaling = Signaling::Stable;
                    true
                }
                (sdp_type, signaling) => {
                    return Err(EngineError::operation(
                        "setRemoteDescription",
                        format!("{sdp_type:?} in {signaling:?}"),
                    ));
                }
            };
            let tracks = LoopbackPeer::new_remote_tracks(&mut s, &description);
            s.remote = Some(description);
            (completed, tracks)
        };

        for track in tracks {
            self.0.emit(PeerEvent::RemoteTrack(track));
        }
        if completed {
            self.0.round_completed();
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Candidate) -> Result<(), EngineError> {
        self.0.check(Step::AddCandidate)?;
        if self.0.state().remote.is_none() {
            return Err(EngineError::operation("addIceCandidate", "no remote description"));
        }
        self.0
            .factory
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .applied
            .push(candidate);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), EngineError> {
        {
            let mut s = self.0.state();
            match s.signaling {
                Signaling::Stable => return Ok(()),
                Signaling::HaveLocalOffer => s.local = s.previous_local.take(),
                Signaling::HaveRemoteOffer => s.remote = s.previous_remote.take(),
            }
            s.signaling = Signaling::Stable;
        }
        self.0
            .factory
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .rollbacks += 1;
        Ok(())
    }

    async fn close(&self) {
        let mut s = self.0.state();
        s.closed = true;
        s.connection = Some(ConnectionState::Closed);
    }
}

/// Media source with fixed tracks, or a fixed failure.
#[derive(Debug, Clone)]
pub struct LoopbackMedia {
    result: Result<LocalTracks, MediaCause>,
}

impl LoopbackMedia {
    pub fn audio_video(stream_id: impl Into<String>) -> Self {
        let stream_id = stream_id.into();
        Self {
            result: Ok(LocalTracks {
                tracks: vec![
                    LocalTrack {
                        id: format!("{stream_id}-audio"),
                        kind: TrackKind::Audio,
                    },
                    LocalTrack {
                        id: format!("{stream_id}-video"),
                        kind: TrackKind::Video,
                    },
                ],
                stream_id,
            }),
        }
    }

    pub fn unavailable(cause: MediaCause) -> Self {
        Self { result: Err(cause) }
    }
}

#[async_trait]
impl MediaSource for LoopbackMedia {
    async fn local_tracks(&self) -> Result<LocalTracks, EngineError> {
        self.result.clone().map_err(EngineError::Media)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn peer(factory: &LoopbackFactory, stream: &str) -> (Box<dyn PeerConnection>, mpsc::Receiver<PeerEvent>) {
        let tracks = LoopbackMedia::audio_video(stream).local_tracks().await.unwrap();
        let (tx, rx) = mpsc::channel(32);
        let pc = factory.create(&RtcConfig::default(), &tracks, tx).await.unwrap();
        (pc, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<PeerEvent>) -> Vec<PeerEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn completed_round_connects_both_sides() {
        let factory = LoopbackFactory::new();
        let (a, mut a_events) = peer(&factory, "a").await;
        let (b, mut b_events) = peer(&factory, "b").await;

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        let a_seen = drain(&mut a_events);
        assert!(matches!(a_seen[0], PeerEvent::LocalCandidate(_)));
        assert!(a_seen.contains(&PeerEvent::ConnectionState(ConnectionState::Connected)));
        let remote: Vec<_> = a_seen
            .iter()
            .filter_map(|e| match e {
                PeerEvent::RemoteTrack(t) => Some(t.kind),
                _ => None,
            })
            .collect();
        assert_eq!(remote, vec![TrackKind::Audio, TrackKind::Video]);

        let b_seen = drain(&mut b_events);
        assert_eq!(
            b_seen.last(),
            Some(&PeerEvent::ConnectionState(ConnectionState::Connected))
        );
    }

    #[tokio::test]
    async fn candidates_need_a_remote_description() {
        let factory = LoopbackFactory::new();
        let (a, _events) = peer(&factory, "a").await;
        let c = Candidate::new("candidate:9 1 udp 1 10.0.0.9 9 typ host", Some("0".into()), Some(0));
        assert!(a.add_ice_candidate(c).await.is_err());
        assert!(factory.applied_candidates().is_empty());
    }

    #[tokio::test]
    async fn injected_failures_fire_once() {
        let factory = LoopbackFactory::new().without_candidates();
        let (a, mut events) = peer(&factory, "a").await;
        factory.fail_next(Step::CreateOffer);
        assert!(matches!(
            a.create_offer().await,
            Err(EngineError::Operation { operation: "createOffer", .. })
        ));
        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer).await.unwrap();
        assert!(drain(&mut events).is_empty());

        a.rollback().await.unwrap();
        assert_eq!(factory.rollbacks(), 1);
    }

    #[tokio::test]
    async fn media_failure_carries_cause() {
        let media = LoopbackMedia::unavailable(MediaCause::PermissionDenied);
        assert!(matches!(
            media.local_tracks().await,
            Err(EngineError::Media(MediaCause::PermissionDenied))
        ));
    }
}
