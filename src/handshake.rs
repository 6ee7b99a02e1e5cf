//! Join Handshake
//!
//! Out-of-band password check that precedes the signaling channel. A
//! successful check yields a short-lived, single-use session token bound to
//! the room; repeated failures from one address are rate limited.

use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{RateLimitConfig, ServerConfig};
use crate::crypto::secret::random_token;
use crate::error::SignalError;
use crate::protocol::IceServer;
use crate::room::{Room, RoomRegistry};

const TOKEN_BYTES: usize = 32;

/// Returned to the client after a successful password check
#[derive(Debug, Clone, Serialize)]
pub struct JoinGrant {
    pub token: String,
    pub room: String,
    pub expires_in_secs: u64,
    pub ice_servers: Vec<IceServer>,
}

/// Returned once when a room is created on request
#[derive(Debug, Clone, Serialize)]
pub struct CreatedRoom {
    pub room: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invite_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

struct IssuedToken {
    room: Arc<Room>,
    expires_at: Instant,
}

/// Outstanding session tokens. Each one holds a reservation on its room.
pub struct TokenStore {
    ttl: Duration,
    tokens: Mutex<HashMap<String, IssuedToken>>,
}

impl TokenStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a token for a room the caller has already reserved
    pub fn issue(&self, room: Arc<Room>, now: Instant) -> String {
        let token = random_token(TOKEN_BYTES);
        self.tokens.lock().insert(
            token.clone(),
            IssuedToken {
                room,
                expires_at: now + self.ttl,
            },
        );
        token
    }

    /// Whether a token is currently valid, without consuming it
    pub fn is_valid(&self, token: &str, now: Instant) -> bool {
        self.tokens
            .lock()
            .get(token)
            .map_or(false, |issued| now < issued.expires_at)
    }

    /// Consume a token. Expired tokens are removed and their room returned
    /// as `Err` so the caller can release the reservation.
    pub fn redeem(&self, token: &str, now: Instant) -> Option<Result<Arc<Room>, Arc<Room>>> {
        let issued = self.tokens.lock().remove(token)?;
        if now < issued.expires_at {
            Some(Ok(issued.room))
        } else {
            Some(Err(issued.room))
        }
    }

    /// Remove expired tokens, returning the rooms they were holding
    pub fn purge_expired(&self, now: Instant) -> Vec<Arc<Room>> {
        let mut released = Vec::new();
        self.tokens.lock().retain(|_, issued| {
            if now < issued.expires_at {
                true
            } else {
                released.push(issued.room.clone());
                false
            }
        });
        released
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Attempts {
    failures: u32,
    window_start: Instant,
    locked_until: Option<Instant>,
}

/// Per-address failure counter for brute-force mitigation
pub struct RateLimiter {
    max_failures: u32,
    window: Duration,
    lockout: Duration,
    attempts: Mutex<HashMap<IpAddr, Attempts>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            max_failures: config.max_failures.max(1),
            window: Duration::from_secs(config.window_secs),
            lockout: Duration::from_secs(config.lockout_secs),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Fails with `RateLimited` while the address is locked out
    pub fn check(&self, client: IpAddr, now: Instant) -> Result<(), SignalError> {
        let attempts = self.attempts.lock();
        match attempts.get(&client).and_then(|a| a.locked_until) {
            Some(until) if now < until => Err(SignalError::RateLimited {
                retry_after: until.saturating_duration_since(now).max(Duration::from_secs(1)),
            }),
            _ => Ok(()),
        }
    }

    pub fn record_failure(&self, client: IpAddr, now: Instant) {
        let mut attempts = self.attempts.lock();
        let entry = attempts.entry(client).or_insert(Attempts {
            failures: 0,
            window_start: now,
            locked_until: None,
        });

        let lockout_over = entry.locked_until.map_or(false, |until| now >= until);
        if lockout_over || now.saturating_duration_since(entry.window_start) >= self.window {
            entry.failures = 0;
            entry.window_start = now;
            entry.locked_until = None;
        }

        entry.failures += 1;
        if entry.failures >= self.max_failures {
            entry.locked_until = Some(now + self.lockout);
            warn!("Rate limiting join attempts from {}", client);
        }
    }

    pub fn record_success(&self, client: IpAddr) {
        self.attempts.lock().remove(&client);
    }

    /// Forget addresses with no lockout and no recent failures
    pub fn purge(&self, now: Instant) {
        let window = self.window;
        self.attempts.lock().retain(|_, a| match a.locked_until {
            Some(until) => now < until,
            None => now.saturating_duration_since(a.window_start) < window,
        });
    }
}

/// Password check, token issue and token redemption
pub struct JoinHandshake {
    registry: Arc<RoomRegistry>,
    tokens: TokenStore,
    limiter: RateLimiter,
    ice_servers: Vec<IceServer>,
    invite_base: Option<String>,
}

impl JoinHandshake {
    pub fn new(registry: Arc<RoomRegistry>, config: &ServerConfig) -> Self {
        Self {
            registry,
            tokens: TokenStore::new(config.token_ttl()),
            limiter: RateLimiter::new(&config.rate_limit),
            ice_servers: config.ice_servers.clone(),
            invite_base: config.invite_base(),
        }
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn join(
        &self,
        room_id: &str,
        password: &str,
        client: IpAddr,
    ) -> Result<JoinGrant, SignalError> {
        self.join_at(room_id, password, client, Instant::now())
    }

    /// Check the password for a room and issue a session token.
    ///
    /// Wrong passwords and unknown rooms both count towards the rate limit,
    /// which slows down room enumeration in restricted mode.
    pub fn join_at(
        &self,
        room_id: &str,
        password: &str,
        client: IpAddr,
        now: Instant,
    ) -> Result<JoinGrant, SignalError> {
        self.limiter.check(client, now)?;

        match self.registry.authorize(room_id, password) {
            Ok(room) => {
                self.limiter.record_success(client);
                let token = self.tokens.issue(room, now);
                info!("Issued session token for room {} to {}", room_id, client);
                Ok(JoinGrant {
                    token,
                    room: room_id.to_string(),
                    expires_in_secs: self.tokens.ttl().as_secs(),
                    ice_servers: self.ice_servers.clone(),
                })
            }
            Err(e) => {
                if matches!(e, SignalError::AuthFailure | SignalError::RoomCreationDenied) {
                    self.limiter.record_failure(client, now);
                }
                info!("Rejected join from {}: {}", client, e.code());
                Err(e)
            }
        }
    }

    /// Create a room with generated id and password
    pub fn create_room(&self) -> Result<CreatedRoom, SignalError> {
        let (room, password) = self.registry.create_room()?;
        Ok(CreatedRoom {
            room: room.id().to_string(),
            password,
            invite_url: self.invite_url(room.id()),
            created_at: room.created_at(),
        })
    }

    /// Link to the web client for a room; says nothing about whether the
    /// room exists. `None` without a configured `public_url`.
    pub fn invite_url(&self, room_id: &str) -> Option<String> {
        self.invite_base
            .as_ref()
            .map(|base| format!("{}/?room={}", base, room_id))
    }

    pub fn is_valid_token(&self, token: &str) -> bool {
        self.tokens.is_valid(token, Instant::now())
    }

    pub fn redeem(&self, token: &str) -> Result<Arc<Room>, SignalError> {
        self.redeem_at(token, Instant::now())
    }

    /// Consume a session token. The room's reservation passes to the caller,
    /// which must either join or release it.
    pub fn redeem_at(&self, token: &str, now: Instant) -> Result<Arc<Room>, SignalError> {
        match self.tokens.redeem(token, now) {
            Some(Ok(room)) => Ok(room),
            Some(Err(room)) => {
                self.release(&room);
                Err(SignalError::AuthFailure)
            }
            None => Err(SignalError::AuthFailure),
        }
    }

    fn release(&self, room: &Room) {
        room.release_reservation();
        self.registry.remove_if_empty(room.id());
    }

    /// Drop expired tokens and stale rate-limit entries. Returns the number
    /// of tokens purged.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let released = self.tokens.purge_expired(now);
        for room in &released {
            self.release(room);
        }
        self.limiter.purge(now);
        released.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RoomEntry, RoomPolicy};
    use std::net::Ipv4Addr;

    const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10));
    const OTHER: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 11));

    fn handshake(policy: RoomPolicy) -> JoinHandshake {
        let config = ServerConfig {
            room_policy: policy,
            public_url: Some("https://meet.example.org".to_string()),
            rooms: vec![RoomEntry {
                id: "lobby".to_string(),
                password: "swordfish".to_string(),
            }],
            rate_limit: RateLimitConfig {
                max_failures: 3,
                window_secs: 60,
                lockout_secs: 120,
            },
            ..ServerConfig::default()
        };
        let registry = Arc::new(RoomRegistry::from_config(&config));
        JoinHandshake::new(registry, &config)
    }

    #[test]
    fn test_successful_join_issues_single_use_token() {
        let hs = handshake(RoomPolicy::Restricted);
        let grant = hs.join("lobby", "swordfish", CLIENT).unwrap();
        assert_eq!(grant.room, "lobby");
        assert_eq!(grant.expires_in_secs, 60);
        assert!(!grant.ice_servers.is_empty());

        assert!(hs.is_valid_token(&grant.token));
        let room = hs.redeem(&grant.token).unwrap();
        assert_eq!(room.id(), "lobby");
        assert!(matches!(hs.redeem(&grant.token), Err(SignalError::AuthFailure)));
    }

    #[test]
    fn test_wrong_password_is_auth_failure() {
        let hs = handshake(RoomPolicy::Open);
        assert!(matches!(
            hs.join("lobby", "guess", CLIENT),
            Err(SignalError::AuthFailure)
        ));
        assert!(hs.tokens().is_empty());
    }

    #[test]
    fn test_restricted_unknown_room() {
        let hs = handshake(RoomPolicy::Restricted);
        assert!(matches!(
            hs.join("secret-room", "swordfish", CLIENT),
            Err(SignalError::RoomCreationDenied)
        ));
    }

    #[test]
    fn test_repeated_failures_are_rate_limited() {
        let hs = handshake(RoomPolicy::Open);
        let now = Instant::now();

        for _ in 0..3 {
            assert!(matches!(
                hs.join_at("lobby", "guess", CLIENT, now),
                Err(SignalError::AuthFailure)
            ));
        }
        // Even the right password is refused during the lockout
        assert!(matches!(
            hs.join_at("lobby", "swordfish", CLIENT, now),
            Err(SignalError::RateLimited { .. })
        ));
        // Other addresses are unaffected
        assert!(hs.join_at("lobby", "swordfish", OTHER, now).is_ok());

        let after = now + Duration::from_secs(121);
        assert!(hs.join_at("lobby", "swordfish", CLIENT, after).is_ok());
    }

    #[test]
    fn test_failures_outside_window_do_not_accumulate() {
        let hs = handshake(RoomPolicy::Open);
        let start = Instant::now();

        hs.join_at("lobby", "guess", CLIENT, start).unwrap_err();
        hs.join_at("lobby", "guess", CLIENT, start).unwrap_err();
        let later = start + Duration::from_secs(61);
        hs.join_at("lobby", "guess", CLIENT, later).unwrap_err();

        assert!(hs.join_at("lobby", "swordfish", CLIENT, later).is_ok());
    }

    #[test]
    fn test_expired_token_releases_room() {
        let hs = handshake(RoomPolicy::Open);
        let now = Instant::now();
        let grant = hs.join_at("lobby", "swordfish", CLIENT, now).unwrap();
        assert!(hs.registry.get("lobby").is_some());

        let later = now + Duration::from_secs(61);
        assert!(matches!(
            hs.redeem_at(&grant.token, later),
            Err(SignalError::AuthFailure)
        ));
        assert!(hs.registry.get("lobby").is_none());
    }

    #[test]
    fn test_purge_releases_unredeemed_tokens() {
        let hs = handshake(RoomPolicy::Open);
        let now = Instant::now();
        hs.join_at("lobby", "swordfish", CLIENT, now).unwrap();
        hs.join_at("lobby", "swordfish", OTHER, now).unwrap();

        assert_eq!(hs.purge_expired(now), 0);
        assert_eq!(hs.purge_expired(now + Duration::from_secs(61)), 2);
        assert!(hs.tokens().is_empty());
        assert!(hs.registry.get("lobby").is_none());
    }

    #[test]
    fn test_created_room_and_invite() {
        let hs = handshake(RoomPolicy::Open);
        let created = hs.create_room().unwrap();
        assert_eq!(
            created.invite_url,
            Some(format!("https://meet.example.org/?room={}", created.room))
        );
        assert!(hs.join(&created.room, &created.password, CLIENT).is_ok());

        let restricted = handshake(RoomPolicy::Restricted);
        assert!(matches!(
            restricted.create_room(),
            Err(SignalError::RoomCreationDenied)
        ));
    }

    #[test]
    fn test_no_invite_links_without_public_url() {
        let config = ServerConfig::default();
        let registry = Arc::new(RoomRegistry::from_config(&config));
        let hs = JoinHandshake::new(registry, &config);

        assert_eq!(hs.invite_url("lobby"), None);
        let created = hs.create_room().unwrap();
        assert!(created.invite_url.is_none());
        let body = serde_json::to_value(&created).unwrap();
        assert!(body.get("invite_url").is_none());
    }
}
