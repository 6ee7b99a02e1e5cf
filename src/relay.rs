//! Signaling Relay
//!
//! Join, leave and peer-to-peer forwarding of negotiation messages. All
//! roster reads and membership changes for a room happen inside that room's
//! lock, and outbound messages produced by a change are enqueued before the
//! lock is released. Every member therefore observes joins and leaves in the
//! same order the relay applied them. Enqueueing never blocks; connections
//! whose queue overflows are closed after the lock is dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::connection::{CloseReason, ConnectionState, ParticipantConnection};
use crate::error::SignalError;
use crate::protocol::{IceServer, ParticipantId, SignalingMessage};
use crate::room::{Room, RoomRegistry};

/// What the inbound loop should do after handling a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Close,
}

type Eviction = (Arc<ParticipantConnection>, CloseReason);

pub struct SignalingRelay {
    registry: Arc<RoomRegistry>,
    ice_servers: Vec<IceServer>,
    heartbeat_interval: Duration,
}

impl SignalingRelay {
    pub fn new(
        registry: Arc<RoomRegistry>,
        ice_servers: Vec<IceServer>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            registry,
            ice_servers,
            heartbeat_interval,
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Admit an authenticated connection into its room.
    ///
    /// The roster snapshot, the insertion and the `peer-joined` fan-out all
    /// happen under the room lock, so no peer can slip in or out between
    /// the snapshot and the insertion. Returns the roster the joiner saw.
    pub fn join(
        &self,
        connection: &Arc<ParticipantConnection>,
    ) -> Result<Vec<ParticipantId>, SignalError> {
        match connection.state() {
            ConnectionState::Authenticated => {}
            ConnectionState::Active => return Err(SignalError::AlreadyJoined),
            _ => return Err(SignalError::NotActive),
        }
        let room = connection
            .room()
            .ok_or_else(|| SignalError::ChannelFailure("room no longer exists".to_string()))?;

        let mut evictions: Vec<Eviction> = Vec::new();
        let roster = {
            let mut membership = room.lock();
            if membership.is_closed() {
                return Err(SignalError::ChannelFailure(
                    "room no longer exists".to_string(),
                ));
            }

            let roster = membership.roster();
            connection.activate()?;
            membership.insert(connection);

            let welcome = SignalingMessage::Roster {
                to: connection.id().clone(),
                peers: roster.clone(),
                ice_servers: self.ice_servers.clone(),
                heartbeat_interval_secs: self.heartbeat_interval.as_secs(),
            };
            if connection.send(welcome).is_err() {
                evictions.push((connection.clone(), CloseReason::QueueOverflow));
            }

            let announcement = SignalingMessage::PeerJoined {
                from: connection.id().clone(),
            };
            for member in membership.members() {
                if &member.id == connection.id() {
                    continue;
                }
                if let Some(peer) = member.connection.upgrade() {
                    if let Err(e) = peer.send(announcement.clone()) {
                        if let Some(reason) = e.close_reason() {
                            evictions.push((peer, reason));
                        }
                    }
                }
            }
            roster
        };

        info!(
            "Participant {} joined room {} ({} existing peers)",
            connection.id(),
            room.id(),
            roster.len()
        );
        self.evict(evictions);
        Ok(roster)
    }

    /// Forward an Offer, Answer or IceCandidate to its target verbatim.
    ///
    /// A missing target is reported as `UnknownPeer`, which the caller turns
    /// into a non-fatal error frame for the sender.
    pub fn relay(
        &self,
        sender: &Arc<ParticipantConnection>,
        message: SignalingMessage,
    ) -> Result<(), SignalError> {
        if !sender.is_active() {
            return Err(SignalError::NotActive);
        }
        let target = message.target().cloned().ok_or_else(|| {
            SignalError::MalformedMessage(format!("{} cannot be relayed", message.kind()))
        })?;
        let room = sender
            .room()
            .ok_or_else(|| SignalError::ChannelFailure("room no longer exists".to_string()))?;

        let kind = message.kind();
        let forwarded = message.with_sender(sender.id().clone());
        let delivery = {
            let membership = room.lock();
            if !membership.contains(sender.id()) {
                return Err(SignalError::NotActive);
            }
            let peer = membership
                .find(&target)
                .filter(|peer| peer.is_active() && peer.id() != sender.id())
                .ok_or_else(|| SignalError::UnknownPeer(target.clone()))?;
            peer.send(forwarded).map_err(|e| (peer, e))
        };

        match delivery {
            Ok(()) => {
                debug!("Relayed {} from {} to {}", kind, sender.id(), target);
                Ok(())
            }
            Err((peer, e)) => {
                if let Some(reason) = e.close_reason() {
                    self.leave(&peer, reason);
                }
                Err(SignalError::UnknownPeer(target))
            }
        }
    }

    /// Remove a connection from its room and tell the remaining members.
    ///
    /// Safe to call concurrently from any number of places; only the first
    /// call performs the transition and the `peer-left` broadcast. Returns
    /// whether this call did so.
    pub fn leave(&self, connection: &Arc<ParticipantConnection>, reason: CloseReason) -> bool {
        let mut pending = Vec::new();
        let performed = self.depart(connection, reason, &mut pending);
        self.evict(pending);
        performed
    }

    fn depart(
        &self,
        connection: &Arc<ParticipantConnection>,
        reason: CloseReason,
        evictions: &mut Vec<Eviction>,
    ) -> bool {
        let previous = match connection.begin_close(reason) {
            Some(previous) => previous,
            None => return false,
        };

        if let Some(room) = connection.room() {
            match previous {
                ConnectionState::Active => {
                    Self::remove_member(&room, connection.id(), evictions);
                }
                ConnectionState::Connecting | ConnectionState::Authenticated => {
                    room.release_reservation();
                }
                ConnectionState::Closing | ConnectionState::Closed => {}
            }
        }
        connection.finish_close();
        self.registry.remove_if_empty(connection.room_id());

        info!(
            "Participant {} left room {} ({})",
            connection.id(),
            connection.room_id(),
            reason.as_str()
        );
        true
    }

    /// Drop a member entry and broadcast `peer-left`, if it was still there
    fn remove_member(room: &Room, id: &ParticipantId, evictions: &mut Vec<Eviction>) -> bool {
        let mut membership = room.lock();
        if !membership.remove(id) {
            return false;
        }
        let notice = SignalingMessage::PeerLeft { from: id.clone() };
        for member in membership.members() {
            if let Some(peer) = member.connection.upgrade() {
                if let Err(e) = peer.send(notice.clone()) {
                    if let Some(reason) = e.close_reason() {
                        evictions.push((peer, reason));
                    }
                }
            }
        }
        true
    }

    /// Close connections that failed delivery. Each departure can overflow
    /// further peers, so this works through a queue.
    fn evict(&self, mut pending: Vec<Eviction>) {
        while let Some((connection, reason)) = pending.pop() {
            if reason == CloseReason::QueueOverflow {
                warn!(
                    "Closing {}: outbound queue overflow",
                    connection.id()
                );
            }
            self.depart(&connection, reason, &mut pending);
        }
    }

    /// Treat members silent past the heartbeat interval as having left, and
    /// purge entries whose connection was closed or dropped without leaving.
    /// Returns the number of members removed.
    pub fn sweep_heartbeats(&self, now: Instant) -> usize {
        let mut expired = Vec::new();
        let mut detached = Vec::new();

        for room in self.registry.rooms() {
            let membership = room.lock();
            for member in membership.members() {
                match member.connection.upgrade() {
                    Some(connection) if connection.state() == ConnectionState::Closed => {
                        detached.push((room.clone(), member.id.clone()));
                    }
                    Some(connection) => {
                        if connection.is_active()
                            && connection.is_expired(now, self.heartbeat_interval)
                        {
                            expired.push(connection);
                        }
                    }
                    None => detached.push((room.clone(), member.id.clone())),
                }
            }
        }

        let mut removed = 0;
        for connection in expired {
            if self.leave(&connection, CloseReason::HeartbeatTimeout) {
                warn!("Participant {} missed its heartbeat", connection.id());
                removed += 1;
            }
        }
        for (room, id) in detached {
            let mut evictions = Vec::new();
            if Self::remove_member(&room, &id, &mut evictions) {
                debug!("Purged detached member {} from room {}", id, room.id());
                removed += 1;
            }
            self.evict(evictions);
            self.registry.remove_if_empty(room.id());
        }
        removed
    }

    /// Handle one inbound message from a client
    pub fn handle_message(
        &self,
        connection: &Arc<ParticipantConnection>,
        message: SignalingMessage,
    ) -> Disposition {
        match self.dispatch(connection, message) {
            Ok(disposition) => disposition,
            Err(e) => self.reject(connection, e),
        }
    }

    fn dispatch(
        &self,
        connection: &Arc<ParticipantConnection>,
        message: SignalingMessage,
    ) -> Result<Disposition, SignalError> {
        match message {
            SignalingMessage::Join { .. } => {
                self.join(connection)?;
                Ok(Disposition::Continue)
            }
            SignalingMessage::Leave { .. } => {
                self.leave(connection, CloseReason::Leave);
                Ok(Disposition::Close)
            }
            SignalingMessage::Ping => {
                connection.send(SignalingMessage::Pong)?;
                Ok(Disposition::Continue)
            }
            SignalingMessage::Pong => Ok(Disposition::Continue),
            message if message.is_negotiation() => {
                self.relay(connection, message)?;
                Ok(Disposition::Continue)
            }
            other => Err(SignalError::MalformedMessage(format!(
                "{} is sent by the server only",
                other.kind()
            ))),
        }
    }

    /// Report an error to the client; fatal errors also close the connection
    pub fn reject(&self, connection: &Arc<ParticipantConnection>, error: SignalError) -> Disposition {
        if let Some(reason) = error.close_reason() {
            warn!("Closing {}: {}", connection.id(), error);
            // Closing drops the outbox, so the report goes out as the farewell
            connection.set_farewell(error.to_message());
            self.leave(connection, reason);
            return Disposition::Close;
        }

        debug!("Rejected message from {}: {}", connection.id(), error);
        match connection.send(error.to_message()) {
            Ok(()) => Disposition::Continue,
            Err(e) => {
                self.leave(connection, e.close_reason().unwrap_or(CloseReason::ChannelError));
                Disposition::Close
            }
        }
    }
}
