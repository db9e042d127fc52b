//! # kindred-rtc
//!
//! Peer session negotiation for Kindred video chat.
//!
//! One coordinator per (room, local participant) turns the room's signaling
//! traffic into a converged pair of session descriptions and a live
//! connection:
//! - glare is resolved by politeness, a pure function of the two ids
//! - remote candidates are buffered until a remote description exists
//! - connectivity is tracked with a bounded renegotiation budget
//!
//! The media engine and capture devices stay outside, behind the traits in
//! [`peer`]. [`loopback`] provides an in-memory engine.

pub mod candidates;
pub mod coordinator;
pub mod error;
pub mod loopback;
pub mod monitor;
pub mod negotiator;
pub mod peer;
pub mod session;

pub use coordinator::{
    CloseReason, CoordinatorHandle, CoordinatorRegistry, NegotiationConfig, SessionContext, SessionSnapshot, open,
};
pub use error::{EngineError, MediaCause, RtcError};
pub use monitor::{ConnectionStatus, RecoveryPolicy};
pub use negotiator::{Applied, IgnoreReason, Negotiator};
pub use session::{ConnectionState, PeerSession, Politeness, SignalingState};
