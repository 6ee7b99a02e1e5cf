//! Error taxonomy shared by the handshake, the relay and the transport.

use std::time::Duration;

use crate::connection::CloseReason;
use crate::protocol::{ParticipantId, SignalingMessage};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    #[error("Authentication failed")]
    AuthFailure,
    #[error("Peer {0} is not in the room")]
    UnknownPeer(ParticipantId),
    #[error("Connection has not joined a room")]
    NotActive,
    #[error("Room creation denied")]
    RoomCreationDenied,
    #[error("Signaling channel failure: {0}")]
    ChannelFailure(String),
    #[error("Outbound queue overflow")]
    QueueOverflow,
    #[error("Too many failed attempts, retry in {}s", .retry_after.as_secs())]
    RateLimited { retry_after: Duration },
    #[error("Invalid room id")]
    InvalidRoomId,
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
    #[error("Already joined")]
    AlreadyJoined,
    #[error("Invite links need a public_url")]
    InvitesUnavailable,
}

impl SignalError {
    /// Stable code used in `error` frames and HTTP bodies
    pub fn code(&self) -> &'static str {
        match self {
            SignalError::AuthFailure => "auth-failure",
            SignalError::UnknownPeer(_) => "unknown-peer",
            SignalError::NotActive => "not-active",
            SignalError::RoomCreationDenied => "room-creation-denied",
            SignalError::ChannelFailure(_) => "channel-failure",
            SignalError::QueueOverflow => "queue-overflow",
            SignalError::RateLimited { .. } => "rate-limited",
            SignalError::InvalidRoomId => "invalid-room-id",
            SignalError::MalformedMessage(_) => "malformed-message",
            SignalError::AlreadyJoined => "already-joined",
            SignalError::InvitesUnavailable => "invites-unavailable",
        }
    }

    /// Reason to close the offending connection, if this error is fatal to it
    pub fn close_reason(&self) -> Option<CloseReason> {
        match self {
            SignalError::NotActive => Some(CloseReason::ProtocolViolation),
            SignalError::QueueOverflow => Some(CloseReason::QueueOverflow),
            SignalError::ChannelFailure(_) => Some(CloseReason::ChannelError),
            SignalError::AuthFailure => Some(CloseReason::AuthFailure),
            _ => None,
        }
    }

    /// The `error` frame reported back to the client
    pub fn to_message(&self) -> SignalingMessage {
        SignalingMessage::Error {
            code: self.code().to_string(),
            payload: self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_peer_is_not_fatal() {
        let err = SignalError::UnknownPeer(ParticipantId::from("p1"));
        assert!(err.close_reason().is_none());
        assert_eq!(
            err.to_message(),
            SignalingMessage::Error {
                code: "unknown-peer".to_string(),
                payload: "Peer p1 is not in the room".to_string(),
            }
        );
    }

    #[test]
    fn test_protocol_violations_close() {
        assert_eq!(
            SignalError::NotActive.close_reason(),
            Some(CloseReason::ProtocolViolation)
        );
        assert_eq!(
            SignalError::QueueOverflow.close_reason(),
            Some(CloseReason::QueueOverflow)
        );
    }

    #[test]
    fn test_rate_limited_message() {
        let err = SignalError::RateLimited {
            retry_after: Duration::from_secs(42),
        };
        assert_eq!(err.to_string(), "Too many failed attempts, retry in 42s");
    }
}
