//! Seams to the media engine.
//!
//! The engine owns ICE, DTLS and media; negotiation only needs descriptions
//! and candidates in and out. Engine callbacks arrive as [`PeerEvent`]s on
//! the channel handed to [`PeerConnectionFactory::create`].

use async_trait::async_trait;
use kindred_common::config::IceSettings;
use kindred_common::models::{Candidate, SessionDescription};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::session::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Captured local media, attached to the connection when it is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LocalTracks {
    pub stream_id: String,
    pub tracks: Vec<LocalTrack>,
}

impl LocalTracks {
    pub fn kinds(&self) -> impl Iterator<Item = TrackKind> + '_ {
        self.tracks.iter().map(|t| t.kind)
    }
}

/// Media received from the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
}

/// Everything the engine reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A local candidate to trickle to the peer.
    LocalCandidate(Candidate),
    ConnectionState(ConnectionState),
    RemoteTrack(RemoteTrack),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Engine configuration handed to the factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcConfig {
    pub ice_servers: Vec<IceServer>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::stun("stun:stun1.l.google.com:19302"),
                IceServer::stun("stun:stun2.l.google.com:19302"),
            ],
        }
    }
}

impl From<&IceSettings> for RtcConfig {
    fn from(s: &IceSettings) -> Self {
        Self {
            ice_servers: s.urls.iter().map(IceServer::stun).collect(),
        }
    }
}

/// One peer connection inside the engine.
///
/// Methods take `&self`; engines are handles over shared internal state.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), EngineError>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), EngineError>;

    async fn add_ice_candidate(&self, candidate: Candidate) -> Result<(), EngineError>;

    /// Abandon a pending local offer.
    async fn rollback(&self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Release engine resources. No events are emitted afterwards.
    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Create a connection with `tracks` attached. The engine reports through
    /// `events` until it is closed.
    async fn create(
        &self,
        config: &RtcConfig,
        tracks: &LocalTracks,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Box<dyn PeerConnection>, EngineError>;
}

/// Local capture devices.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire local tracks. Failures carry a [`MediaCause`](crate::error::MediaCause).
    async fn local_tracks(&self) -> Result<LocalTracks, EngineError>;
}
