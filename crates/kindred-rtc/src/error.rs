//! Error types for session negotiation.

use kindred_common::models::{MalformedSignal, RoomId};
use kindred_signal::TransportError;
use serde::Serialize;

/// Why local media could not be acquired. Each cause has a stable code that
/// callers surface to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaCause {
    PermissionDenied,
    DeviceNotFound,
    DeviceBusy,
}

impl MediaCause {
    pub fn code(&self) -> &'static str {
        match self {
            MediaCause::PermissionDenied => "PERMISSION_DENIED",
            MediaCause::DeviceNotFound => "DEVICE_NOT_FOUND",
            MediaCause::DeviceBusy => "DEVICE_BUSY",
        }
    }
}

impl std::fmt::Display for MediaCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Failure reported by the underlying session engine or media source.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Media unavailable: {0}")]
    Media(MediaCause),

    #[error("{operation} failed: {message}")]
    Operation {
        operation: &'static str,
        message: String,
    },

    #[error("Peer connection is closed")]
    Closed,
}

impl EngineError {
    pub fn operation(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Operation {
            operation,
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RtcError {
    /// Publishing failed. The session stays open; `initiate()` may be retried.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Malformed signal: {0}")]
    MalformedSignal(#[from] MalformedSignal),

    #[error("Media unavailable ({cause})")]
    MediaUnavailable { cause: MediaCause },

    /// The current attempt was aborted and the session restored.
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Subscription to {room} was lost")]
    SubscriptionLost { room: RoomId },

    #[error("Session is closed")]
    Closed,
}

impl RtcError {
    /// Fatal errors end the session; everything else is recoverable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RtcError::MediaUnavailable { .. } | RtcError::SubscriptionLost { .. }
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            RtcError::Transport(_) => "TRANSPORT_ERROR",
            RtcError::MalformedSignal(_) => "MALFORMED_SIGNAL",
            RtcError::MediaUnavailable { cause } => cause.code(),
            RtcError::Negotiation(_) => "NEGOTIATION_ERROR",
            RtcError::SubscriptionLost { .. } => "SUBSCRIPTION_LOST",
            RtcError::Closed => "SESSION_CLOSED",
        }
    }
}

impl From<EngineError> for RtcError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Media(cause) => RtcError::MediaUnavailable { cause },
            EngineError::Closed => RtcError::Closed,
            other => RtcError::Negotiation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_causes_have_distinct_codes() {
        let err = RtcError::from(EngineError::Media(MediaCause::DeviceBusy));
        assert!(err.is_fatal());
        assert_eq!(err.code(), "DEVICE_BUSY");
        assert_eq!(RtcError::MediaUnavailable { cause: MediaCause::PermissionDenied }.code(), "PERMISSION_DENIED");
        assert_eq!(serde_json::to_string(&MediaCause::DeviceNotFound).unwrap(), "\"DEVICE_NOT_FOUND\"");
    }

    #[test]
    fn engine_failures_are_negotiation_errors() {
        let err = RtcError::from(EngineError::operation("createOffer", "no codecs"));
        assert!(!err.is_fatal());
        assert!(matches!(err, RtcError::Negotiation(ref m) if m.contains("no codecs")));
    }

    #[test]
    fn subscription_loss_is_fatal() {
        let err = RtcError::SubscriptionLost { room: RoomId::from("room-1") };
        assert!(err.is_fatal());
        assert!(!RtcError::Transport(TransportError::Closed).is_fatal());
    }
}
