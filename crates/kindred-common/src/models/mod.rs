//! Wire models shared between the negotiation core, transports, and the relay.

pub mod ids;
pub mod relay;
pub mod signal;

pub use ids::{ParticipantId, RoomId};
pub use relay::RelayFrame;
pub use signal::{
    Candidate, MalformedSignal, SdpType, SessionDescription, SignalKind, SignalMessage,
    SignalPayload,
};
