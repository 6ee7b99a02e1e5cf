//! Configuration
//!
//! Server configuration loaded from TOML. Every field has a default so an
//! empty file (or no file at all) yields a working open-mode server.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use crate::protocol::IceServer;
use crate::room::is_valid_room_id;

/// Environment variable holding the shared room password
pub const ROOM_PASSWORD_ENV: &str = "ROOM_PASS";

/// Whether unknown rooms may be created on first join
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomPolicy {
    Open,
    Restricted,
}

/// A room provisioned ahead of time with a fixed password
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomEntry {
    pub id: String,
    pub password: String,
}

/// Brute-force mitigation for the join handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_lockout_secs")]
    pub lockout_secs: u64,
}

fn default_max_failures() -> u32 {
    5
}

fn default_window_secs() -> u64 {
    60
}

fn default_lockout_secs() -> u64 {
    300
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            window_secs: default_window_secs(),
            lockout_secs: default_lockout_secs(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Address of the web client; invite links are only built when set
    #[serde(default)]
    pub public_url: Option<String>,
    /// Reverse proxies whose `X-Forwarded-For` header is believed
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
    #[serde(default = "default_room_policy")]
    pub room_policy: RoomPolicy,
    /// Password applied to rooms created on demand in open mode
    #[serde(default)]
    pub default_password: Option<String>,
    #[serde(default)]
    pub rooms: Vec<RoomEntry>,
    /// Room joined when the client names none
    #[serde(default = "default_room")]
    pub default_room: String,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_idle_room_timeout_secs")]
    pub idle_room_timeout_secs: u64,
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,
    #[serde(default = "default_outbound_queue_bound")]
    pub outbound_queue_bound: usize,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServer>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_room_policy() -> RoomPolicy {
    RoomPolicy::Open
}

fn default_room() -> String {
    "lobby".to_string()
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_idle_room_timeout_secs() -> u64 {
    300
}

fn default_eviction_interval_secs() -> u64 {
    10
}

fn default_outbound_queue_bound() -> usize {
    64
}

fn default_token_ttl_secs() -> u64 {
    60
}

// Signaling frames are small JSON documents; SDP rarely exceeds a few KB
fn default_max_message_bytes() -> usize {
    64 * 1024
}

fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer::stun("stun:stun.l.google.com:19302")]
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: None,
            trusted_proxies: Vec::new(),
            room_policy: default_room_policy(),
            default_password: None,
            rooms: Vec::new(),
            default_room: default_room(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            idle_room_timeout_secs: default_idle_room_timeout_secs(),
            eviction_interval_secs: default_eviction_interval_secs(),
            outbound_queue_bound: default_outbound_queue_bound(),
            token_ttl_secs: default_token_ttl_secs(),
            max_message_bytes: default_max_message_bytes(),
            ice_servers: default_ice_servers(),
            rate_limit: RateLimitConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Take the shared room password from `ROOM_PASS` if it is set
    pub fn apply_env(&mut self) {
        if let Ok(password) = std::env::var(ROOM_PASSWORD_ENV) {
            if !password.is_empty() {
                self.default_password = Some(password);
            }
        }
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        for room in &self.rooms {
            if !is_valid_room_id(&room.id) {
                return Err(ConfigError::Invalid(format!("invalid room id {:?}", room.id)));
            }
            if room.password.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "room {} has an empty password",
                    room.id
                )));
            }
        }
        if !is_valid_room_id(&self.default_room) {
            return Err(ConfigError::Invalid(format!(
                "invalid default_room {:?}",
                self.default_room
            )));
        }
        if matches!(&self.default_password, Some(p) if p.is_empty()) {
            return Err(ConfigError::Invalid("default_password is empty".to_string()));
        }
        if self.heartbeat_interval_secs == 0
            || self.idle_room_timeout_secs == 0
            || self.eviction_interval_secs == 0
            || self.token_ttl_secs == 0
        {
            return Err(ConfigError::Invalid("intervals must be non-zero".to_string()));
        }
        if self.outbound_queue_bound == 0 {
            return Err(ConfigError::Invalid(
                "outbound_queue_bound must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn idle_room_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_room_timeout_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    /// Base URL for invite links, without a trailing slash. The signaling
    /// server serves no page of its own, so there is no fallback.
    pub fn invite_base(&self) -> Option<String> {
        self.public_url
            .as_deref()
            .map(|url| url.trim_end_matches('/').to_string())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.room_policy, RoomPolicy::Open);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.ice_servers[0].urls[0], "stun:stun.l.google.com:19302");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_restricted_config() {
        let config = ServerConfig::from_toml(
            r#"
            room_policy = "restricted"
            public_url = "https://meet.example.org/"
            outbound_queue_bound = 8

            [[rooms]]
            id = "lobby"
            password = "swordfish"

            [rate_limit]
            max_failures = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.room_policy, RoomPolicy::Restricted);
        assert_eq!(config.rooms.len(), 1);
        assert_eq!(config.outbound_queue_bound, 8);
        assert_eq!(config.rate_limit.max_failures, 3);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(
            config.invite_base().as_deref(),
            Some("https://meet.example.org")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_proxies_and_default_room() {
        let config = ServerConfig::from_toml(
            r#"
            trusted_proxies = ["10.0.0.1", "::1"]
            default_room = "standup"
            "#,
        )
        .unwrap();
        assert_eq!(config.trusted_proxies.len(), 2);
        assert_eq!(config.default_room, "standup");
        assert!(ServerConfig::default().invite_base().is_none());

        let bad = ServerConfig {
            default_room: "no/slashes".to_string(),
            ..ServerConfig::default()
        };
        assert!(matches!(bad.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_bad_room_id() {
        let mut config = ServerConfig::default();
        config.rooms.push(RoomEntry {
            id: "no spaces/allowed".to_string(),
            password: "x".to_string(),
        });
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_queue() {
        let config = ServerConfig {
            outbound_queue_bound: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_policy_is_parse_error() {
        let result = ServerConfig::from_toml(r#"room_policy = "sometimes""#);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}
