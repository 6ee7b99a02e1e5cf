//! Signaling Protocol
//!
//! Defines the message format carried on each participant's signaling
//! channel. Every frame is a single JSON object tagged by `type`.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Server-assigned identifier of one signaling connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Generate a fresh identifier. Clients never choose their own.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// STUN/TURN server entry, handed to clients without interpretation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }
}

/// Signaling messages exchanged between clients and the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    // Client -> Server
    Join {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ParticipantId>,
    },
    Leave {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ParticipantId>,
    },
    Ping,

    // Client -> Server -> Client, payload is opaque SDP / candidate text
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ParticipantId>,
        to: ParticipantId,
        payload: String,
    },
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ParticipantId>,
        to: ParticipantId,
        payload: String,
    },
    #[serde(rename = "ice")]
    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ParticipantId>,
        to: ParticipantId,
        payload: String,
    },

    // Server -> Client
    Roster {
        to: ParticipantId,
        peers: Vec<ParticipantId>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        ice_servers: Vec<IceServer>,
        heartbeat_interval_secs: u64,
    },
    PeerJoined {
        from: ParticipantId,
    },
    PeerLeft {
        from: ParticipantId,
    },
    Pong,
    Error {
        code: String,
        payload: String,
    },
}

impl SignalingMessage {
    /// Wire name of the message type, for logs
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Join { .. } => "join",
            SignalingMessage::Leave { .. } => "leave",
            SignalingMessage::Ping => "ping",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice",
            SignalingMessage::Roster { .. } => "roster",
            SignalingMessage::PeerJoined { .. } => "peer-joined",
            SignalingMessage::PeerLeft { .. } => "peer-left",
            SignalingMessage::Pong => "pong",
            SignalingMessage::Error { .. } => "error",
        }
    }

    /// Offer, Answer and IceCandidate are forwarded peer to peer
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            SignalingMessage::Offer { .. }
                | SignalingMessage::Answer { .. }
                | SignalingMessage::IceCandidate { .. }
        )
    }

    /// Target peer of a negotiation message
    pub fn target(&self) -> Option<&ParticipantId> {
        match self {
            SignalingMessage::Offer { to, .. }
            | SignalingMessage::Answer { to, .. }
            | SignalingMessage::IceCandidate { to, .. } => Some(to),
            _ => None,
        }
    }

    /// Overwrite the sender field with the server-known identity
    pub fn with_sender(self, sender: ParticipantId) -> Self {
        match self {
            SignalingMessage::Join { .. } => SignalingMessage::Join { from: Some(sender) },
            SignalingMessage::Leave { .. } => SignalingMessage::Leave { from: Some(sender) },
            SignalingMessage::Offer { to, payload, .. } => SignalingMessage::Offer {
                from: Some(sender),
                to,
                payload,
            },
            SignalingMessage::Answer { to, payload, .. } => SignalingMessage::Answer {
                from: Some(sender),
                to,
                payload,
            },
            SignalingMessage::IceCandidate { to, payload, .. } => SignalingMessage::IceCandidate {
                from: Some(sender),
                to,
                payload,
            },
            other => other,
        }
    }

    /// Serialize the message to a JSON text frame
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize a message from a JSON text frame
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_client_join_without_sender() {
        let parsed = SignalingMessage::from_json(r#"{"type":"join"}"#).unwrap();
        assert_eq!(parsed, SignalingMessage::Join { from: None });
    }

    #[test]
    fn test_offer_wire_shape() {
        let msg = SignalingMessage::Offer {
            from: None,
            to: ParticipantId::from("peer-a"),
            payload: "v=0\r\no=- 1 2 IN IP4 127.0.0.1".to_string(),
        }
        .with_sender(ParticipantId::from("peer-b"));

        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "offer",
                "from": "peer-b",
                "to": "peer-a",
                "payload": "v=0\r\no=- 1 2 IN IP4 127.0.0.1",
            })
        );
    }

    #[test]
    fn test_ice_uses_short_tag() {
        let parsed = SignalingMessage::from_json(
            r#"{"type":"ice","to":"x","payload":"candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host"}"#,
        )
        .unwrap();
        assert!(parsed.is_negotiation());
        assert_eq!(parsed.kind(), "ice");
        assert_eq!(parsed.target(), Some(&ParticipantId::from("x")));
    }

    #[test]
    fn test_negotiation_requires_target() {
        let result = SignalingMessage::from_json(r#"{"type":"answer","payload":"sdp"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_peer_left_omits_payload() {
        let msg = SignalingMessage::PeerLeft {
            from: ParticipantId::from("gone"),
        };
        assert_eq!(msg.to_json().unwrap(), r#"{"type":"peer-left","from":"gone"}"#);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(ParticipantId::generate(), ParticipantId::generate());
    }
}
