//! Participant Connections
//!
//! One live signaling link: identity, lifecycle state, liveness and the
//! bounded outbound queue drained by the connection's own writer task.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

use crate::error::SignalError;
use crate::protocol::{ParticipantId, SignalingMessage};
use crate::room::Room;

/// Per-connection lifecycle. Transitions only ever move one step forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Active,
    Closing,
    Closed,
}

impl ConnectionState {
    fn successor(self) -> Option<ConnectionState> {
        match self {
            ConnectionState::Connecting => Some(ConnectionState::Authenticated),
            ConnectionState::Authenticated => Some(ConnectionState::Active),
            ConnectionState::Active => Some(ConnectionState::Closing),
            ConnectionState::Closing => Some(ConnectionState::Closed),
            ConnectionState::Closed => None,
        }
    }
}

/// Why a connection was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Leave,
    ChannelClosed,
    ChannelError,
    HeartbeatTimeout,
    QueueOverflow,
    ProtocolViolation,
    AuthFailure,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Leave => "leave",
            CloseReason::ChannelClosed => "channel-closed",
            CloseReason::ChannelError => "channel-error",
            CloseReason::HeartbeatTimeout => "heartbeat-timeout",
            CloseReason::QueueOverflow => "queue-overflow",
            CloseReason::ProtocolViolation => "protocol-violation",
            CloseReason::AuthFailure => "auth-failure",
            CloseReason::Shutdown => "shutdown",
        }
    }

    /// WebSocket close code reported to the client
    pub fn close_code(&self) -> u16 {
        match self {
            CloseReason::Leave | CloseReason::ChannelClosed => 1000,
            CloseReason::Shutdown => 1001,
            CloseReason::ChannelError => 1011,
            CloseReason::HeartbeatTimeout
            | CloseReason::ProtocolViolation
            | CloseReason::AuthFailure => 1008,
            CloseReason::QueueOverflow => 1013,
        }
    }
}

struct Lifecycle {
    state: ConnectionState,
    close_reason: Option<CloseReason>,
}

/// Represents one signaling connection inside a room
pub struct ParticipantConnection {
    id: ParticipantId,
    room_id: String,
    room: Weak<Room>,
    outbox: mpsc::Sender<SignalingMessage>,
    lifecycle: Mutex<Lifecycle>,
    last_activity: Mutex<Instant>,
    /// Sent by the writer after the outbox is dropped, ahead of the close frame
    farewell: Mutex<Option<SignalingMessage>>,
    closed_tx: watch::Sender<bool>,
}

impl ParticipantConnection {
    /// Create a connection bound to `room` with an outbound queue of
    /// `queue_bound` messages. The receiver goes to the writer task.
    pub fn new(
        room: &Arc<Room>,
        queue_bound: usize,
    ) -> (Arc<Self>, mpsc::Receiver<SignalingMessage>) {
        let (outbox, outbox_rx) = mpsc::channel(queue_bound.max(1));
        let (closed_tx, _) = watch::channel(false);
        let connection = Arc::new(Self {
            id: ParticipantId::generate(),
            room_id: room.id().to_string(),
            room: Arc::downgrade(room),
            outbox,
            lifecycle: Mutex::new(Lifecycle {
                state: ConnectionState::Connecting,
                close_reason: None,
            }),
            last_activity: Mutex::new(Instant::now()),
            farewell: Mutex::new(None),
            closed_tx,
        });
        (connection, outbox_rx)
    }

    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// The owning room, if it is still alive
    pub fn room(&self) -> Option<Arc<Room>> {
        self.room.upgrade()
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.lifecycle.lock().close_reason
    }

    fn advance(&self, from: ConnectionState) -> Result<(), SignalError> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != from {
            return Err(SignalError::NotActive);
        }
        lifecycle.state = from.successor().ok_or(SignalError::NotActive)?;
        Ok(())
    }

    /// Connecting -> Authenticated, once the session token has been redeemed
    pub fn authenticate(&self) -> Result<(), SignalError> {
        self.advance(ConnectionState::Connecting)
    }

    /// Authenticated -> Active; only the relay does this, inside the room lock
    pub(crate) fn activate(&self) -> Result<(), SignalError> {
        self.advance(ConnectionState::Authenticated)
    }

    /// Record inbound activity
    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    pub fn touch_at(&self, at: Instant) {
        let mut last = self.last_activity.lock();
        if at > *last {
            *last = at;
        }
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Instant by which the next sign of life must arrive
    pub fn heartbeat_deadline(&self, interval: Duration) -> Instant {
        self.last_activity() + interval
    }

    pub fn is_expired(&self, now: Instant, interval: Duration) -> bool {
        now >= self.heartbeat_deadline(interval)
    }

    /// Enqueue a message for this client without blocking.
    ///
    /// A full queue yields `QueueOverflow`; the caller is expected to close
    /// this connection rather than wait.
    pub fn send(&self, message: SignalingMessage) -> Result<(), SignalError> {
        match self.state() {
            ConnectionState::Closing | ConnectionState::Closed => {
                return Err(SignalError::ChannelFailure("connection closed".to_string()));
            }
            ConnectionState::Active => {}
            _ if message.is_negotiation() => return Err(SignalError::NotActive),
            _ => {}
        }

        self.outbox.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SignalError::QueueOverflow,
            mpsc::error::TrySendError::Closed(_) => {
                SignalError::ChannelFailure("writer stopped".to_string())
            }
        })
    }

    /// Leave a last message for the client. Unlike [`send`](Self::send) it
    /// survives the close, which discards everything still in the outbox.
    pub(crate) fn set_farewell(&self, message: SignalingMessage) {
        *self.farewell.lock() = Some(message);
    }

    pub(crate) fn take_farewell(&self) -> Option<SignalingMessage> {
        self.farewell.lock().take()
    }

    /// Start closing. Only the first caller gets the previous state back;
    /// every later caller gets `None`.
    pub(crate) fn begin_close(&self, reason: CloseReason) -> Option<ConnectionState> {
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            ConnectionState::Closing | ConnectionState::Closed => None,
            previous => {
                lifecycle.state = ConnectionState::Closing;
                lifecycle.close_reason = Some(reason);
                Some(previous)
            }
        }
    }

    /// Closing -> Closed, cancelling the writer and the inbound wait
    pub(crate) fn finish_close(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != ConnectionState::Closing {
                return;
            }
            lifecycle.state = ConnectionState::Closed;
        }
        self.closed_tx.send_replace(true);
    }

    /// Close the connection. Idempotent: returns true only for the call
    /// that performed the transition.
    ///
    /// This does not touch room membership; active members should leave
    /// through [`crate::relay::SignalingRelay::leave`].
    pub fn close(&self, reason: CloseReason) -> bool {
        if self.begin_close(reason).is_none() {
            return false;
        }
        self.finish_close();
        true
    }

    /// Resolves once the connection reaches Closed
    pub async fn wait_closed(&self) {
        let mut closed = self.closed_tx.subscribe();
        while !*closed.borrow_and_update() {
            if closed.changed().await.is_err() {
                return;
            }
        }
    }
}

impl std::fmt::Debug for ParticipantConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParticipantConnection")
            .field("id", &self.id)
            .field("room_id", &self.room_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
