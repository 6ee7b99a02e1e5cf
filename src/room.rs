//! Room Management
//!
//! Rooms, their per-room membership critical section, and the registry that
//! owns every live room.

use chrono::{DateTime, Utc};
use log::info;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::{RoomPolicy, ServerConfig};
use crate::connection::ParticipantConnection;
use crate::crypto::secret::{SecretDigest, SessionAuthenticator};
use crate::error::SignalError;
use crate::protocol::ParticipantId;

const MAX_ROOM_ID_LEN: usize = 64;

/// Room ids are 1..=64 characters of `[A-Za-z0-9_-]`
pub fn is_valid_room_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ROOM_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Where a room's secret came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretOrigin {
    /// Per-room password from configuration
    Provisioned,
    /// Server-wide shared password
    Shared,
    /// Random secret generated for this room instance only
    Generated,
}

/// One entry in a room's membership list
pub(crate) struct Member {
    pub(crate) id: ParticipantId,
    pub(crate) connection: Weak<ParticipantConnection>,
}

/// State guarded by the per-room lock.
///
/// Every roster read and membership change for a room happens while holding
/// this lock, which makes joins and leaves linearizable per room.
pub(crate) struct Membership {
    /// Active members in join order
    members: Vec<Member>,
    /// Issued but not yet joined session tokens
    reserved: usize,
    /// Set once the registry has dropped this room
    closed: bool,
    empty_since: Option<Instant>,
}

impl Membership {
    fn new() -> Self {
        Self {
            members: Vec::new(),
            reserved: 0,
            closed: false,
            empty_since: Some(Instant::now()),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn is_vacant(&self) -> bool {
        self.members.is_empty() && self.reserved == 0
    }

    pub(crate) fn members(&self) -> &[Member] {
        &self.members
    }

    pub(crate) fn roster(&self) -> Vec<ParticipantId> {
        self.members.iter().map(|m| m.id.clone()).collect()
    }

    pub(crate) fn contains(&self, id: &ParticipantId) -> bool {
        self.members.iter().any(|m| &m.id == id)
    }

    /// Live connection handle for a member
    pub(crate) fn find(&self, id: &ParticipantId) -> Option<Arc<ParticipantConnection>> {
        self.members
            .iter()
            .find(|m| &m.id == id)
            .and_then(|m| m.connection.upgrade())
    }

    /// Add a member, consuming the reservation its token placed
    pub(crate) fn insert(&mut self, connection: &Arc<ParticipantConnection>) {
        self.reserved = self.reserved.saturating_sub(1);
        self.members.push(Member {
            id: connection.id().clone(),
            connection: Arc::downgrade(connection),
        });
        self.empty_since = None;
    }

    /// Remove a member; returns false if it was not present
    pub(crate) fn remove(&mut self, id: &ParticipantId) -> bool {
        let before = self.members.len();
        self.members.retain(|m| &m.id != id);
        let removed = self.members.len() != before;
        self.mark_if_vacant();
        removed
    }

    fn reserve(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.reserved += 1;
        self.empty_since = None;
        true
    }

    pub(crate) fn release_reservation(&mut self) {
        self.reserved = self.reserved.saturating_sub(1);
        self.mark_if_vacant();
    }

    fn mark_if_vacant(&mut self) {
        if self.is_vacant() && self.empty_since.is_none() {
            self.empty_since = Some(Instant::now());
        }
    }

    fn idle_for(&self, now: Instant) -> Option<Duration> {
        if !self.is_vacant() {
            return None;
        }
        self.empty_since.map(|since| now.saturating_duration_since(since))
    }
}

/// Represents a signaling room
pub struct Room {
    id: String,
    secret: SecretDigest,
    origin: SecretOrigin,
    created_at: DateTime<Utc>,
    membership: Mutex<Membership>,
}

impl Room {
    fn new(id: String, secret: SecretDigest, origin: SecretOrigin) -> Self {
        Self {
            id,
            secret,
            origin,
            created_at: Utc::now(),
            membership: Mutex::new(Membership::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn origin(&self) -> SecretOrigin {
        self.origin
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Snapshot of active member ids in join order
    pub fn roster(&self) -> Vec<ParticipantId> {
        self.membership.lock().roster()
    }

    pub fn member_count(&self) -> usize {
        self.membership.lock().members.len()
    }

    pub fn is_closed(&self) -> bool {
        self.membership.lock().closed
    }

    /// Check a candidate password against this room's secret
    pub fn verify(&self, candidate: &str) -> bool {
        SessionAuthenticator::verify(candidate, &self.secret)
    }

    /// Enter the room's critical section
    pub(crate) fn lock(&self) -> MutexGuard<'_, Membership> {
        self.membership.lock()
    }

    /// Hold the room open for a pending join; fails once the room is closed
    pub(crate) fn reserve(&self) -> bool {
        self.membership.lock().reserve()
    }

    pub(crate) fn release_reservation(&self) {
        self.membership.lock().release_reservation();
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Owns every live room. The only process-wide mutable state.
pub struct RoomRegistry {
    policy: RoomPolicy,
    provisioned: HashMap<String, SecretDigest>,
    shared_secret: Option<SecretDigest>,
    idle_timeout: Duration,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl RoomRegistry {
    pub fn new(policy: RoomPolicy, idle_timeout: Duration) -> Self {
        Self {
            policy,
            provisioned: HashMap::new(),
            shared_secret: None,
            idle_timeout,
            rooms: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        let mut registry = Self::new(config.room_policy, config.idle_room_timeout());
        for entry in &config.rooms {
            registry = registry.with_room(&entry.id, &entry.password);
        }
        if let Some(password) = &config.default_password {
            registry = registry.with_shared_password(password);
        }
        registry
    }

    /// Provision a room password ahead of time
    pub fn with_room(mut self, room_id: &str, password: &str) -> Self {
        self.provisioned
            .insert(room_id.to_string(), SecretDigest::of(password));
        self
    }

    /// Password for rooms created on demand in open mode
    pub fn with_shared_password(mut self, password: &str) -> Self {
        self.shared_secret = Some(SecretDigest::of(password));
        self
    }

    pub fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().get(room_id).cloned()
    }

    /// All live rooms
    pub fn rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.read().values().cloned().collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    /// Live or provisioned
    pub fn is_known(&self, room_id: &str) -> bool {
        self.provisioned.contains_key(room_id) || self.rooms.read().contains_key(room_id)
    }

    /// Secret a new room with this id would receive
    fn secret_for_new(&self, room_id: &str) -> Result<(SecretDigest, SecretOrigin), SignalError> {
        if let Some(secret) = self.provisioned.get(room_id) {
            return Ok((secret.clone(), SecretOrigin::Provisioned));
        }
        if self.policy == RoomPolicy::Restricted {
            return Err(SignalError::RoomCreationDenied);
        }
        match &self.shared_secret {
            Some(secret) => Ok((secret.clone(), SecretOrigin::Shared)),
            None => {
                let (_, digest) = SessionAuthenticator::generate_secret();
                Ok((digest, SecretOrigin::Generated))
            }
        }
    }

    /// Return the live room or create it according to policy
    pub fn get_or_create(&self, room_id: &str) -> Result<Arc<Room>, SignalError> {
        if !is_valid_room_id(room_id) {
            return Err(SignalError::InvalidRoomId);
        }
        if let Some(room) = self.get(room_id) {
            return Ok(room);
        }

        let (secret, origin) = self.secret_for_new(room_id)?;
        let mut rooms = self.rooms.write();
        let room = rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                info!("Created room {} ({:?} secret)", room_id, origin);
                Arc::new(Room::new(room_id.to_string(), secret, origin))
            })
            .clone();
        Ok(room)
    }

    /// Create a room with a server-generated id and password.
    ///
    /// Returns the plaintext password; it is not retained anywhere.
    pub fn create_room(&self) -> Result<(Arc<Room>, String), SignalError> {
        if self.policy == RoomPolicy::Restricted {
            return Err(SignalError::RoomCreationDenied);
        }
        let (password, secret) = SessionAuthenticator::generate_secret();
        let room_id = Uuid::new_v4().simple().to_string();
        let room = Arc::new(Room::new(room_id.clone(), secret, SecretOrigin::Generated));
        self.rooms.write().insert(room_id.clone(), room.clone());
        info!("Created room {} on request", room_id);
        Ok((room, password))
    }

    /// Check a candidate against the live room, or the secret a new room
    /// would be created with. Never logs the candidate.
    pub fn validate_secret(&self, room_id: &str, candidate: &str) -> bool {
        if let Some(room) = self.get(room_id) {
            return room.verify(candidate);
        }
        match self.secret_for_new(room_id) {
            Ok((secret, _)) => SessionAuthenticator::verify(candidate, &secret),
            Err(_) => false,
        }
    }

    /// Verify a join credential and reserve a place in the room.
    ///
    /// Unknown rooms are only created once the credential has been accepted,
    /// so failed attempts leave the registry untouched.
    pub fn authorize(&self, room_id: &str, candidate: &str) -> Result<Arc<Room>, SignalError> {
        if !is_valid_room_id(room_id) {
            return Err(SignalError::InvalidRoomId);
        }
        if self.policy == RoomPolicy::Restricted && !self.is_known(room_id) {
            return Err(SignalError::RoomCreationDenied);
        }

        loop {
            if !self.validate_secret(room_id, candidate) {
                return Err(SignalError::AuthFailure);
            }
            let room = self.get_or_create(room_id)?;
            // Another caller may have created the room with a different secret
            if !room.verify(candidate) {
                return Err(SignalError::AuthFailure);
            }
            if room.reserve() {
                return Ok(room);
            }
            // Closed between lookup and reservation; the registry no longer
            // holds it, so go round again
        }
    }

    /// Drop the room if nobody is in it or about to join it
    pub fn remove_if_empty(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.write();
        let room = match rooms.get(room_id) {
            Some(room) => room.clone(),
            None => return false,
        };

        let mut membership = room.lock();
        if !membership.is_vacant() {
            return false;
        }
        membership.closed = true;
        drop(membership);

        rooms.remove(room_id);
        info!("Removed empty room {}", room_id);
        true
    }

    /// Remove rooms that have been vacant for longer than the idle timeout
    pub fn evict_idle(&self, now: Instant) -> Vec<String> {
        let idle_timeout = self.idle_timeout;
        let mut evicted = Vec::new();

        self.rooms.write().retain(|room_id, room| {
            let mut membership = room.lock();
            let expired = membership
                .idle_for(now)
                .map_or(false, |idle| idle >= idle_timeout);
            if expired {
                membership.closed = true;
                evicted.push(room_id.clone());
            }
            !expired
        });

        for room_id in &evicted {
            info!("Evicted idle room {}", room_id);
        }
        evicted
    }
}
