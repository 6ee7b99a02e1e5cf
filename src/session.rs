//! Signaling Sessions
//!
//! Drives one WebSocket: an inbound loop that waits for the next frame or the
//! heartbeat deadline, and a writer task that drains the connection's
//! outbox. Closing the connection stops both.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitStream;
use futures::{Sink, SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::connection::{CloseReason, ParticipantConnection};
use crate::error::SignalError;
use crate::protocol::SignalingMessage;
use crate::relay::{Disposition, SignalingRelay};
use crate::room::Room;

/// Upper bound on writing the final frames to a client that may have
/// stopped reading
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Run a signaling session for a redeemed token until the connection closes
pub async fn run_session(
    socket: WebSocket,
    room: Arc<Room>,
    relay: Arc<SignalingRelay>,
    queue_bound: usize,
) {
    let (connection, outbox) = ParticipantConnection::new(&room, queue_bound);
    // The registry keeps the room alive from here on
    drop(room);

    if let Err(e) = connection.authenticate() {
        error!("Connection {} failed to authenticate: {}", connection.id(), e);
        relay.leave(&connection, CloseReason::AuthFailure);
        return;
    }
    info!(
        "Participant {} connected to room {}",
        connection.id(),
        connection.room_id()
    );

    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(deliver(sink, outbox, connection.clone(), relay.clone()));

    let reason = receive(stream, &connection, &relay).await;
    relay.leave(&connection, reason);

    match tokio::time::timeout(CLOSE_GRACE * 2, &mut writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Writer task for {} failed: {}", connection.id(), e),
        Err(_) => {
            warn!("Writer task for {} did not stop, aborting", connection.id());
            writer.abort();
        }
    }
}

/// Turn away a socket whose token could not be redeemed
pub async fn refuse(mut socket: WebSocket, error: SignalError) {
    let frame = CloseFrame {
        code: CloseReason::AuthFailure.close_code(),
        reason: error.code().into(),
    };
    let goodbye = async {
        if let Ok(text) = error.to_message().to_json() {
            socket.send(Message::Text(text)).await?;
        }
        socket.send(Message::Close(Some(frame))).await
    };
    if !matches!(tokio::time::timeout(CLOSE_GRACE, goodbye).await, Ok(Ok(()))) {
        debug!("Could not deliver refusal ({})", error.code());
    }
}

async fn receive(
    mut stream: SplitStream<WebSocket>,
    connection: &Arc<ParticipantConnection>,
    relay: &SignalingRelay,
) -> CloseReason {
    let interval = relay.heartbeat_interval();

    loop {
        let deadline = tokio::time::Instant::from_std(connection.heartbeat_deadline(interval));
        let frame = tokio::select! {
            _ = connection.wait_closed() => {
                return connection.close_reason().unwrap_or(CloseReason::Shutdown);
            }
            frame = tokio::time::timeout_at(deadline, stream.next()) => frame,
        };

        let message = match frame {
            Err(_) => return CloseReason::HeartbeatTimeout,
            Ok(None) => return CloseReason::ChannelClosed,
            Ok(Some(Err(e))) => {
                debug!("Read from {} failed: {}", connection.id(), e);
                return CloseReason::ChannelError;
            }
            Ok(Some(Ok(message))) => message,
        };
        connection.touch();

        let text = match message {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    let error = SignalError::MalformedMessage("binary frame is not UTF-8".into());
                    if relay.reject(connection, error) == Disposition::Close {
                        return connection.close_reason().unwrap_or(CloseReason::ChannelError);
                    }
                    continue;
                }
            },
            // Transport-level keepalives only refresh liveness
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return CloseReason::ChannelClosed,
        };

        let disposition = match SignalingMessage::from_json(&text) {
            Ok(message) => relay.handle_message(connection, message),
            Err(e) => relay.reject(connection, SignalError::MalformedMessage(e.to_string())),
        };
        if disposition == Disposition::Close {
            return connection.close_reason().unwrap_or(CloseReason::Leave);
        }
    }
}

async fn deliver<S>(
    mut sink: S,
    mut outbox: mpsc::Receiver<SignalingMessage>,
    connection: Arc<ParticipantConnection>,
    relay: Arc<SignalingRelay>,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    loop {
        // Closing takes priority; whatever is still queued is dropped
        let message = tokio::select! {
            biased;
            _ = connection.wait_closed() => break,
            message = outbox.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode {} for {}: {}", message.kind(), connection.id(), e);
                continue;
            }
        };
        // A client that stopped reading stalls the write; closing abandons it
        let written = tokio::select! {
            biased;
            _ = connection.wait_closed() => break,
            written = sink.send(Message::Text(text)) => written,
        };
        if let Err(e) = written {
            debug!("Write to {} failed: {}", connection.id(), e);
            relay.leave(&connection, CloseReason::ChannelError);
            return;
        }
    }

    let farewell = connection.take_farewell();
    let reason = connection.close_reason().unwrap_or(CloseReason::Shutdown);
    let frame = CloseFrame {
        code: reason.close_code(),
        reason: reason.as_str().into(),
    };
    let goodbye = async {
        if let Some(Ok(text)) = farewell.map(|message| message.to_json()) {
            sink.send(Message::Text(text)).await?;
        }
        sink.send(Message::Close(Some(frame))).await
    };
    match tokio::time::timeout(CLOSE_GRACE, goodbye).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Close to {} failed: {}", connection.id(), e),
        Err(_) => debug!("Close to {} timed out", connection.id()),
    }
}
