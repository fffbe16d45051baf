//! Relay Hub
//!
//! The single owner of the session store and the connection registry. Every
//! socket event, timer firing and status query arrives here as a method
//! call from the hub actor, one at a time, so the maps are mutated in event
//! arrival order without locks.
//!
//! The hub never touches a socket. Its only side effects are frames pushed
//! onto each connection's outbound channel.

use axum::body::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ProtocolError;
use crate::metrics::ServerMetrics;
use crate::protocol::{AudioType, ClientMessage, Inbound, ServerMessage, parse_binary, parse_text};
use crate::registry::{Connection, ConnectionId, ConnectionRegistry, Outbound, OutboundTx};
use crate::session_store::{Role, SessionStore};
use crate::uid::generate_uid;

/// Point-in-time view of the relay for logs and the status endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayStatus {
    /// Sockets that completed a handshake.
    pub connections: usize,
    /// Sockets still waiting for a handshake.
    pub pending: usize,
    pub askers: usize,
    pub helpers: usize,
    pub unassigned: usize,
    pub sessions: usize,
    pub pairs: Vec<PairView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairView {
    pub asker: String,
    pub helper: String,
    pub asker_online: bool,
    pub helper_online: bool,
}

pub struct RelayHub {
    sessions: SessionStore,
    connections: ConnectionRegistry,
    metrics: Arc<ServerMetrics>,
}

impl RelayHub {
    pub fn new(session_ttl: Duration, metrics: Arc<ServerMetrics>) -> Self {
        Self {
            sessions: SessionStore::new(session_ttl),
            connections: ConnectionRegistry::new(),
            metrics,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    /// Register a freshly opened socket in PENDING state and greet it.
    /// The caller owns the returned token's timer.
    pub fn open(&mut self, id: ConnectionId, tx: OutboundTx, now: Instant) -> CancellationToken {
        self.metrics.connection_opened();
        let conn = self.connections.insert(Connection::new(id, tx, now));
        let token = conn.arm_handshake_timeout();
        conn.send_message(&ServerMessage::ConnectionReady {
            client_id: id.to_string(),
        });
        info!(conn_id = %id, "New connection, awaiting handshake");
        token
    }

    /// The handshake window elapsed. No-op unless the socket is still PENDING.
    pub fn handshake_timeout(&mut self, id: ConnectionId) {
        let still_pending = self.connections.get(&id).is_some_and(|c| c.is_pending());
        if !still_pending {
            return;
        }
        info!(conn_id = %id, "Removing unresponsive connection");
        ServerMetrics::incr(&self.metrics.handshake_timeouts);
        self.discard(id, Outbound::Close);
    }

    /// The socket is gone (graceful close, transport error, or terminated by
    /// the heartbeat sweep). The session stays warm for its TTL and the
    /// pairing is kept so the peer can resume silently.
    pub fn close(&mut self, id: ConnectionId, now: Instant) {
        let Some(conn) = self.connections.remove(&id) else {
            // Superseded or timed out earlier; already accounted for.
            return;
        };
        self.metrics.connection_closed();
        let connected_secs = now.saturating_duration_since(conn.opened_at).as_secs();

        let Some(uid) = conn.uid else {
            debug!(conn_id = %id, connected_secs, "Pending connection closed");
            return;
        };

        let Some(session) = self.sessions.get_mut(&uid) else {
            return;
        };
        if session.connection == Some(id) {
            session.connection = None;
        }
        session.last_seen = now;
        let partner = session.paired_with.clone();

        info!(
            conn_id = %id,
            uid = %uid,
            connected_secs,
            window_secs = self.sessions.ttl().as_secs(),
            "Connection closed, session preserved for reconnection"
        );

        if let Some(partner) = partner {
            let window = self.sessions.remaining_window(&uid, now).as_secs();
            if let Some(partner_conn) = self.live_connection(&partner) {
                partner_conn.send_message(&ServerMessage::PartnerDisconnected {
                    can_reconnect: true,
                    reconnect_window: window,
                });
                debug!(uid = %uid, partner = %partner, "Notified partner of disconnect");
            }
        }
        self.log_status();
    }

    /// Transport-level pong: the socket is alive and so is its session.
    pub fn pong(&mut self, id: ConnectionId, now: Instant) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        conn.alive = true;
        if let Some(uid) = conn.uid.clone() {
            self.sessions.touch(&uid, now);
        }
    }

    /// One heartbeat tick: terminate sockets that missed the previous ping,
    /// ping the rest. Returns how many were terminated.
    pub fn heartbeat_sweep(&mut self, now: Instant) -> usize {
        let mut dead = Vec::new();
        for conn in self.connections.iter_mut() {
            if conn.alive {
                conn.alive = false;
                conn.push(Outbound::Ping);
            } else {
                conn.push(Outbound::Terminate);
                dead.push(conn.id);
            }
        }

        for id in &dead {
            warn!(conn_id = %id, "Connection missed heartbeat, terminating");
            ServerMetrics::incr(&self.metrics.dead_connections_reaped);
            self.close(*id, now);
        }
        dead.len()
    }

    /// Drop sessions unseen for longer than the TTL. Returns the count.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let purged = self.sessions.purge_expired(now);
        if !purged.is_empty() {
            info!(count = purged.len(), "Cleaned up expired sessions");
            ServerMetrics::add(&self.metrics.sessions_purged, purged.len() as u64);
        }
        purged.len()
    }

    /// Ask every socket to close. Used on server shutdown.
    pub fn close_all(&mut self) {
        for conn in self.connections.iter() {
            conn.push(Outbound::Close);
        }
    }

    // =========================================================================
    // Inbound frames
    // =========================================================================

    pub fn handle_text(&mut self, id: ConnectionId, text: &str, now: Instant) {
        self.handle_inbound(id, parse_text(text), now);
    }

    pub fn handle_binary(&mut self, id: ConnectionId, frame: Bytes, now: Instant) {
        self.handle_inbound(id, parse_binary(frame), now);
    }

    fn handle_inbound(
        &mut self,
        id: ConnectionId,
        inbound: Result<Inbound, ProtocolError>,
        now: Instant,
    ) {
        let Some(conn) = self.connections.get(&id) else {
            return;
        };
        let pending = conn.is_pending();

        let inbound = match inbound {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(conn_id = %id, "Error parsing message: {}", e);
                ServerMetrics::incr(&self.metrics.malformed_messages);
                self.reply_error(id, e);
                return;
            }
        };

        match inbound {
            Inbound::Message(msg) => {
                if pending && !msg.is_handshake() {
                    self.reject_before_handshake(id);
                    return;
                }
                if !pending && msg.is_handshake() {
                    self.reject(id, ProtocolError::AlreadyHandshaken);
                    return;
                }
                self.dispatch(id, msg, now);
            }
            Inbound::Audio { audio_type, frame } => {
                if pending {
                    self.reject_before_handshake(id);
                    return;
                }
                self.relay_audio_frame(id, audio_type, frame);
            }
            Inbound::Unrecognized(msg_type) => {
                debug!(conn_id = %id, msg_type = %msg_type, "Unknown message type, ignoring");
            }
        }
    }

    fn dispatch(&mut self, id: ConnectionId, msg: ClientMessage, now: Instant) {
        debug!(conn_id = %id, "Message: {:?}", msg);
        match msg {
            ClientMessage::NewConnection => self.new_connection(id, now),
            ClientMessage::Reconnect { uid, role, .. } => {
                self.reconnect(id, &uid, role.as_deref(), now)
            }
            ClientMessage::SetRole {
                role,
                pair_with_uid,
            } => self.set_role(id, &role, pair_with_uid.as_deref(), now),
            ClientMessage::SendQuestion { question } => self.send_question(id, question),
            ClientMessage::SendAnswer { answer } => self.send_answer(id, answer),
            ClientMessage::StartAudio { audio_type } => {
                self.relay_audio_control(id, audio_type, true)
            }
            ClientMessage::StopAudio { audio_type } => {
                self.relay_audio_control(id, audio_type, false)
            }
            ClientMessage::AudioStream { audio_type, data } => {
                self.relay_legacy_audio(id, audio_type, data)
            }
            ClientMessage::Ping => {
                if let Some(uid) = self.uid_of(id) {
                    self.sessions.touch(&uid, now);
                }
                self.send_to(id, &ServerMessage::Pong);
            }
            ClientMessage::Unknown => {}
        }
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    fn new_connection(&mut self, id: ConnectionId, now: Instant) {
        let uid = generate_uid();
        self.sessions.create(&uid, Some(id), now);
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        conn.activate(&uid);
        conn.send_message(&ServerMessage::Connected {
            client_id: id.to_string(),
            uid: uid.clone(),
        });
        ServerMetrics::incr(&self.metrics.handshakes_new);
        info!(conn_id = %id, uid = %uid, "Assigned new UID");
        self.log_status();
    }

    fn reconnect(&mut self, id: ConnectionId, uid: &str, role: Option<&str>, now: Instant) {
        if !self.sessions.is_resumable(uid, now) {
            info!(conn_id = %id, uid = %uid, "Session expired or not found, assigning new UID");
            self.new_connection(id, now);
            return;
        }

        // Newest handshake for a UID wins.
        let previous = self.sessions.get(uid).and_then(|s| s.connection);
        if let Some(old_id) = previous.filter(|old| *old != id) {
            if self.discard(old_id, Outbound::Close).is_some() {
                info!(uid = %uid, old_conn = %old_id, "Superseding stale connection");
                ServerMetrics::incr(&self.metrics.supersessions);
            }
        }

        // A partner whose own session lapsed cannot be resumed with.
        let stale_partner = self
            .sessions
            .get(uid)
            .and_then(|s| s.paired_with.clone())
            .filter(|partner| !self.sessions.is_resumable(partner, now));
        if let Some(partner) = stale_partner {
            debug!(uid = %uid, partner = %partner, "Dropping pairing with expired partner");
            self.sessions.unpair(uid);
        }

        let Some(session) = self.sessions.get_mut(uid) else {
            return;
        };
        if let Some(role) = role.and_then(|r| r.parse::<Role>().ok()) {
            session.role = Some(role);
        }
        session.connection = Some(id);
        session.last_seen = now;
        let reply = ServerMessage::Reconnected {
            uid: uid.to_string(),
            role: session.role,
            paired_with: session.paired_with.clone(),
        };
        let partner = session.paired_with.clone();

        if let Some(conn) = self.connections.get_mut(&id) {
            conn.activate(uid);
            conn.send_message(&reply);
        }
        ServerMetrics::incr(&self.metrics.sessions_resumed);
        info!(conn_id = %id, uid = %uid, "Session resumed");

        if let Some(partner) = partner {
            if let Some(partner_conn) = self.live_connection(&partner) {
                partner_conn.send_message(&ServerMessage::PartnerReconnected {
                    partner_uid: uid.to_string(),
                });
                debug!(uid = %uid, partner = %partner, "Notified partner of reconnect");
            }
        }
        self.log_status();
    }

    // =========================================================================
    // Pairing
    // =========================================================================

    fn set_role(&mut self, id: ConnectionId, role: &str, pair_with: Option<&str>, now: Instant) {
        let Some(uid) = self.uid_of(id) else {
            return;
        };
        let role = match role.parse::<Role>() {
            Ok(role) => role,
            Err(bad) => {
                self.reject(id, ProtocolError::InvalidRole(bad));
                return;
            }
        };

        self.sessions.set_role(&uid, role, now);
        info!(uid = %uid, role = %role, "Role set");

        let target = pair_with.map(str::trim).filter(|t| !t.is_empty());
        if let (Role::Helper, Some(asker_uid)) = (role, target) {
            self.pair_helper(id, &uid, asker_uid, now);
        }

        self.send_to(
            id,
            &ServerMessage::RoleSet {
                role,
                uid: uid.clone(),
            },
        );
        self.log_status();
    }

    fn pair_helper(&mut self, id: ConnectionId, helper_uid: &str, asker_uid: &str, now: Instant) {
        let asker_found = asker_uid != helper_uid
            && self.sessions.is_resumable(asker_uid, now)
            && self
                .sessions
                .get(asker_uid)
                .is_some_and(|s| s.role == Some(Role::Asker));
        if !asker_found {
            warn!(uid = %helper_uid, asker = %asker_uid, "Asker not found");
            self.reply_error(id, ProtocolError::AskerNotFound);
            return;
        }

        // Former partners of either side lose their pairing
        let displaced: Vec<String> = [asker_uid, helper_uid]
            .iter()
            .filter_map(|uid| self.sessions.get(uid).and_then(|s| s.paired_with.clone()))
            .filter(|uid| uid != asker_uid && uid != helper_uid)
            .collect();

        self.sessions.set_pairing(helper_uid, asker_uid, now);
        ServerMetrics::incr(&self.metrics.pairings);

        for uid in &displaced {
            info!(uid = %uid, helper = %helper_uid, asker = %asker_uid, "Pairing replaced");
            if let Some(conn) = self.live_connection(uid) {
                conn.send_message(&ServerMessage::error(ProtocolError::PairingReplaced));
            }
        }

        self.send_to(
            id,
            &ServerMessage::Paired {
                paired_with_uid: asker_uid.to_string(),
                role: Role::Helper,
            },
        );
        if let Some(asker_conn) = self.live_connection(asker_uid) {
            asker_conn.send_message(&ServerMessage::Paired {
                paired_with_uid: helper_uid.to_string(),
                role: Role::Asker,
            });
        }
        info!(helper = %helper_uid, asker = %asker_uid, "Paired");
    }

    // =========================================================================
    // Relay
    // =========================================================================

    fn send_question(&mut self, id: ConnectionId, question: String) {
        let Some((uid, partner)) = self.sender_with_role(id, Role::Asker) else {
            return;
        };
        match self.live_partner_with_role(partner.as_deref(), Role::Helper) {
            Some(helper) => {
                helper.send_message(&ServerMessage::QuestionReceived {
                    question,
                    from: uid.clone(),
                });
                ServerMetrics::incr(&self.metrics.questions_relayed);
                debug!(from = %uid, "Forwarded question");
            }
            None => {
                debug!(uid = %uid, "No helper paired");
                self.reply_error(id, ProtocolError::NoHelperPaired);
            }
        }
    }

    fn send_answer(&mut self, id: ConnectionId, answer: String) {
        let Some((uid, partner)) = self.sender_with_role(id, Role::Helper) else {
            return;
        };
        match self.live_partner_with_role(partner.as_deref(), Role::Asker) {
            Some(asker) => {
                asker.send_message(&ServerMessage::AnswerReceived {
                    answer,
                    from: uid.clone(),
                });
                ServerMetrics::incr(&self.metrics.answers_relayed);
                debug!(from = %uid, "Forwarded answer");
            }
            None => {
                debug!(uid = %uid, "No asker paired");
                self.reply_error(id, ProtocolError::NoAskerPaired);
            }
        }
    }

    fn relay_audio_control(&mut self, id: ConnectionId, audio_type: AudioType, started: bool) {
        let Some(uid) = self.uid_of(id) else {
            return;
        };
        debug!(uid = %uid, audio_type = %audio_type, started, "Audio control");
        let msg = if started {
            ServerMessage::AudioStarted {
                audio_type,
                from: uid.clone(),
            }
        } else {
            ServerMessage::AudioStopped {
                audio_type,
                from: uid.clone(),
            }
        };
        if let Some(partner) = self.partner_connection(&uid) {
            partner.send_message(&msg);
        }
    }

    fn relay_legacy_audio(&mut self, id: ConnectionId, audio_type: AudioType, data: String) {
        let Some(uid) = self.uid_of(id) else {
            return;
        };
        if let Some(partner) = self.partner_connection(&uid) {
            partner.send_message(&ServerMessage::AudioReceived {
                audio_type,
                data,
                from: uid,
            });
        }
    }

    /// Binary audio goes out verbatim; with no live partner it is dropped.
    fn relay_audio_frame(&mut self, id: ConnectionId, audio_type: AudioType, frame: Bytes) {
        let Some(uid) = self.uid_of(id) else {
            return;
        };
        let delivered = self
            .partner_connection(&uid)
            .is_some_and(|partner| partner.push(Outbound::Binary(frame)));
        if delivered {
            ServerMetrics::incr(&self.metrics.audio_frames_relayed);
        } else {
            ServerMetrics::incr(&self.metrics.audio_frames_dropped);
            tracing::trace!(uid = %uid, audio_type = %audio_type, "Dropped audio frame, no live partner");
        }
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    fn uid_of(&self, id: ConnectionId) -> Option<String> {
        self.connections.get(&id)?.uid.clone()
    }

    /// The live connection bound to `uid`, if its session points at one.
    fn live_connection(&self, uid: &str) -> Option<&Connection> {
        let conn_id = self.sessions.get(uid)?.connection?;
        self.connections
            .get(&conn_id)
            .filter(|c| c.uid.as_deref() == Some(uid))
    }

    /// The live connection of `uid`'s partner, whatever its role.
    fn partner_connection(&self, uid: &str) -> Option<&Connection> {
        let partner = self.sessions.get(uid)?.paired_with.as_deref()?;
        self.live_connection(partner)
    }

    fn live_partner_with_role(&self, partner: Option<&str>, role: Role) -> Option<&Connection> {
        let partner = partner?;
        let session = self.sessions.get(partner)?;
        if session.role != Some(role) {
            return None;
        }
        self.live_connection(partner)
    }

    /// The sender's UID and partner, if its session holds `role`. Senders
    /// in the wrong role are dropped without a reply.
    fn sender_with_role(&self, id: ConnectionId, role: Role) -> Option<(String, Option<String>)> {
        let uid = self.uid_of(id)?;
        let session = self.sessions.get(&uid)?;
        if session.role != Some(role) {
            warn!(uid = %uid, expected = %role, "Message from sender in wrong role, dropping");
            ServerMetrics::incr(&self.metrics.rejected_messages);
            return None;
        }
        Some((uid, session.paired_with.clone()))
    }

    // =========================================================================
    // Output helpers
    // =========================================================================

    fn send_to(&self, id: ConnectionId, msg: &ServerMessage) {
        if let Some(conn) = self.connections.get(&id) {
            conn.send_message(msg);
        }
    }

    fn reply_error(&self, id: ConnectionId, err: ProtocolError) {
        self.send_to(id, &ServerMessage::error(err));
    }

    fn reject(&self, id: ConnectionId, err: ProtocolError) {
        warn!(conn_id = %id, "Rejected message: {}", err);
        ServerMetrics::incr(&self.metrics.rejected_messages);
        self.reply_error(id, err);
    }

    /// Anything but a handshake on a PENDING socket is malformed.
    fn reject_before_handshake(&self, id: ConnectionId) {
        warn!(conn_id = %id, "Message before handshake");
        ServerMetrics::incr(&self.metrics.malformed_messages);
        self.reply_error(id, ProtocolError::InvalidFormat);
    }

    /// Remove a registry entry without disconnect handling and tell its
    /// socket task to stop.
    fn discard(&mut self, id: ConnectionId, frame: Outbound) -> Option<Connection> {
        let conn = self.connections.remove(&id)?;
        conn.push(frame);
        self.metrics.connection_closed();
        Some(conn)
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub fn status(&self) -> RelayStatus {
        let mut status = RelayStatus {
            pending: self.connections.pending_count(),
            sessions: self.sessions.len(),
            ..Default::default()
        };

        for conn in self.connections.iter() {
            let Some(uid) = conn.uid.as_deref() else {
                continue;
            };
            status.connections += 1;
            match self.sessions.get(uid).and_then(|s| s.role) {
                Some(Role::Asker) => status.askers += 1,
                Some(Role::Helper) => status.helpers += 1,
                None => status.unassigned += 1,
            }
        }

        for helper in self
            .sessions
            .iter()
            .filter(|s| s.role == Some(Role::Helper))
        {
            let Some(asker) = helper.paired_with.as_deref() else {
                continue;
            };
            status.pairs.push(PairView {
                asker: asker.to_string(),
                helper: helper.uid.clone(),
                asker_online: self.live_connection(asker).is_some(),
                helper_online: self.live_connection(&helper.uid).is_some(),
            });
        }
        status.pairs.sort_by(|a, b| a.asker.cmp(&b.asker));
        status
    }

    fn log_status(&self) {
        let s = self.status();
        debug!(
            connections = s.connections,
            askers = s.askers,
            helpers = s.helpers,
            unassigned = s.unassigned,
            pending = s.pending,
            sessions = s.sessions,
            "Relay status"
        );
    }
}
