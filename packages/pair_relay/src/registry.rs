//! Connection Registry
//!
//! Per-socket ephemeral state. An entry is created when a socket opens
//! (PENDING), bound to a UID by a handshake (ACTIVE) and dropped when the
//! socket closes or is superseded. Nothing here outlives its socket.

use axum::body::Bytes;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{error, trace, warn};
use uuid::Uuid;

use crate::protocol::ServerMessage;

/// Ephemeral identity of one socket.
pub type ConnectionId = Uuid;

/// Frames the hub asks a socket task to emit.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Binary(Bytes),
    /// Transport-level ping; the pong comes back as a hub event.
    Ping,
    /// Send a close frame, then stop.
    Close,
    /// Drop the socket without a close handshake.
    Terminate,
}

/// Frames a socket task may have queued before new ones are dropped.
pub const OUTBOUND_CAPACITY: usize = 256;

/// The hub's end of a socket task's queue. The hang-up switch stops the task
/// when a close frame no longer fits in the queue.
#[derive(Debug, Clone)]
pub struct OutboundTx {
    frames: mpsc::Sender<Outbound>,
    hangup: CancellationToken,
}

/// The socket task's end of its queue.
#[derive(Debug)]
pub struct OutboundRx {
    frames: mpsc::Receiver<Outbound>,
    hangup: CancellationToken,
}

pub fn outbound_channel() -> (OutboundTx, OutboundRx) {
    let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let hangup = CancellationToken::new();
    (
        OutboundTx {
            frames: tx,
            hangup: hangup.clone(),
        },
        OutboundRx { frames: rx, hangup },
    )
}

impl OutboundRx {
    /// Next frame to write. `None` once the hub is done with the socket.
    pub async fn recv(&mut self) -> Option<Outbound> {
        tokio::select! {
            biased;
            _ = self.hangup.cancelled() => None,
            frame = self.frames.recv() => frame,
        }
    }

    pub fn try_recv(&mut self) -> Result<Outbound, TryRecvError> {
        if self.hangup.is_cancelled() {
            return Err(TryRecvError::Disconnected);
        }
        self.frames.try_recv()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Opened, waiting for `new-connection` or `reconnect`.
    Pending,
    /// Bound to a UID.
    Active,
}

pub struct Connection {
    pub id: ConnectionId,
    pub state: HandshakeState,
    pub uid: Option<String>,
    /// Cleared by the heartbeat sweep, set again on pong.
    pub alive: bool,
    pub opened_at: Instant,
    tx: OutboundTx,
    handshake_cancel: Option<CancellationToken>,
}

impl Connection {
    pub fn new(id: ConnectionId, tx: OutboundTx, now: Instant) -> Self {
        Self {
            id,
            state: HandshakeState::Pending,
            uid: None,
            alive: true,
            opened_at: now,
            tx,
            handshake_cancel: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == HandshakeState::Pending
    }

    /// Arm the handshake timeout. The returned token is cancelled when the
    /// handshake completes or the entry is discarded.
    pub fn arm_handshake_timeout(&mut self) -> CancellationToken {
        let token = CancellationToken::new();
        self.handshake_cancel = Some(token.clone());
        token
    }

    /// Transition PENDING -> ACTIVE and cancel the handshake timeout.
    pub fn activate(&mut self, uid: &str) {
        self.state = HandshakeState::Active;
        self.uid = Some(uid.to_string());
        self.cancel_handshake_timeout();
    }

    pub fn cancel_handshake_timeout(&mut self) {
        if let Some(token) = self.handshake_cancel.take() {
            token.cancel();
        }
    }

    /// Queue a frame for the socket task. Returns false if the frame was
    /// dropped: the task is gone or its queue is full. A close that does not
    /// fit hangs the socket up instead.
    pub fn push(&self, frame: Outbound) -> bool {
        match self.tx.frames.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(Outbound::Binary(_))) => {
                trace!(conn_id = %self.id, "Outbound queue full, dropping audio frame");
                false
            }
            Err(TrySendError::Full(Outbound::Close | Outbound::Terminate)) => {
                warn!(conn_id = %self.id, "Outbound queue full, hanging up");
                self.tx.hangup.cancel();
                false
            }
            Err(TrySendError::Full(frame)) => {
                warn!(conn_id = %self.id, ?frame, "Outbound queue full, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn send_message(&self, msg: &ServerMessage) -> bool {
        match serde_json::to_string(msg) {
            Ok(json) => {
                trace!(conn_id = %self.id, "-> {}", json);
                self.push(Outbound::Text(json))
            }
            Err(e) => {
                error!(conn_id = %self.id, "Failed to serialize message: {}", e);
                false
            }
        }
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, conn: Connection) -> &mut Connection {
        self.connections.entry(conn.id).insert_entry(conn).into_mut()
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: &ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Discard an entry and cancel its timers.
    pub fn remove(&mut self, id: &ConnectionId) -> Option<Connection> {
        let mut conn = self.connections.remove(id)?;
        conn.cancel_handshake_timeout();
        Some(conn)
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.values_mut()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.connections.values().filter(|c| c.is_pending()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> (Connection, OutboundRx) {
        let (tx, rx) = outbound_channel();
        (Connection::new(Uuid::new_v4(), tx, Instant::now()), rx)
    }

    #[test]
    fn new_connection_is_pending_and_alive() {
        let (c, _rx) = conn();
        assert!(c.is_pending());
        assert!(c.alive);
        assert!(c.uid.is_none());
    }

    #[test]
    fn activate_cancels_handshake_timeout() {
        let (mut c, _rx) = conn();
        let token = c.arm_handshake_timeout();
        assert!(!token.is_cancelled());
        c.activate("A1B2C3D4");
        assert!(token.is_cancelled());
        assert_eq!(c.state, HandshakeState::Active);
        assert_eq!(c.uid.as_deref(), Some("A1B2C3D4"));
    }

    #[test]
    fn remove_cancels_handshake_timeout() {
        let mut reg = ConnectionRegistry::new();
        let (mut c, _rx) = conn();
        let id = c.id;
        let token = c.arm_handshake_timeout();
        reg.insert(c);
        assert_eq!(reg.pending_count(), 1);
        assert!(reg.remove(&id).is_some());
        assert!(token.is_cancelled());
        assert!(reg.is_empty());
    }

    #[test]
    fn push_reports_closed_receiver() {
        let (c, rx) = conn();
        assert!(c.push(Outbound::Ping));
        drop(rx);
        assert!(!c.push(Outbound::Ping));
    }

    #[test]
    fn push_drops_frames_when_queue_is_full() {
        let (c, mut rx) = conn();
        for _ in 0..OUTBOUND_CAPACITY {
            assert!(c.push(Outbound::Binary(Bytes::from_static(&[1, 0xaa]))));
        }
        assert!(!c.push(Outbound::Binary(Bytes::from_static(&[1, 0xbb]))));
        assert!(!c.push(Outbound::Ping));

        // Draining one slot makes room again
        assert!(rx.try_recv().is_ok());
        assert!(c.push(Outbound::Ping));
    }

    #[tokio::test]
    async fn close_on_full_queue_hangs_up() {
        let (c, mut rx) = conn();
        for _ in 0..OUTBOUND_CAPACITY {
            c.push(Outbound::Ping);
        }
        assert!(!c.push(Outbound::Close));
        // Queued frames are abandoned; the socket task sees the end at once
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn send_message_serializes_json() {
        let (c, mut rx) = conn();
        assert!(c.send_message(&ServerMessage::Pong));
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Text(r#"{"type":"pong"}"#.to_string())
        );
    }
}
