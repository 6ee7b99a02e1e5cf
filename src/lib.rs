//! Room Signal - WebRTC Signaling Server Library
//!
//! Password-gated rooms, ephemeral membership and relay of opaque
//! session-description and ICE-candidate messages between peers. Media
//! never passes through this crate.

pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod gateway;
pub mod handshake;
pub mod protocol;
pub mod relay;
pub mod room;
pub mod session;

pub use config::{RoomPolicy, ServerConfig};
pub use connection::{CloseReason, ConnectionState, ParticipantConnection};
pub use crypto::secret::{SecretDigest, SessionAuthenticator};
pub use error::SignalError;
pub use gateway::AppState;
pub use handshake::JoinHandshake;
pub use protocol::{ParticipantId, SignalingMessage};
pub use relay::SignalingRelay;
pub use room::{Room, RoomRegistry};
