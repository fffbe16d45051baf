//! Relay metrics for observability
//!
//! Counters are bumped from the hub task and read from HTTP handlers.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Relay-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Currently open sockets (pending or active)
    pub active_connections: AtomicU64,
    /// Total sockets accepted since start
    pub total_connections: AtomicU64,
    /// Handshakes that minted a new UID
    pub handshakes_new: AtomicU64,
    /// Handshakes that resumed an existing session
    pub sessions_resumed: AtomicU64,
    /// Older sockets closed because a newer handshake claimed their UID
    pub supersessions: AtomicU64,
    /// Sockets closed for not completing the handshake in time
    pub handshake_timeouts: AtomicU64,
    /// Sockets terminated by the heartbeat sweep
    pub dead_connections_reaped: AtomicU64,

    // Session metrics
    pub pairings: AtomicU64,
    pub sessions_purged: AtomicU64,

    // Relay metrics
    pub questions_relayed: AtomicU64,
    pub answers_relayed: AtomicU64,
    pub audio_frames_relayed: AtomicU64,
    /// Audio frames with no live partner to receive them
    pub audio_frames_dropped: AtomicU64,

    // Error metrics
    pub malformed_messages: AtomicU64,
    pub rejected_messages: AtomicU64,

    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: load(&self.active_connections),
                total: load(&self.total_connections),
                handshakes_new: load(&self.handshakes_new),
                sessions_resumed: load(&self.sessions_resumed),
                supersessions: load(&self.supersessions),
                handshake_timeouts: load(&self.handshake_timeouts),
                dead_reaped: load(&self.dead_connections_reaped),
            },
            sessions: SessionMetrics {
                pairings: load(&self.pairings),
                purged: load(&self.sessions_purged),
            },
            relay: RelayMetrics {
                questions: load(&self.questions_relayed),
                answers: load(&self.answers_relayed),
                audio_frames: load(&self.audio_frames_relayed),
                audio_frames_dropped: load(&self.audio_frames_dropped),
            },
            errors: ErrorMetrics {
                malformed: load(&self.malformed_messages),
                rejected: load(&self.rejected_messages),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub sessions: SessionMetrics,
    pub relay: RelayMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
    pub handshakes_new: u64,
    pub sessions_resumed: u64,
    pub supersessions: u64,
    pub handshake_timeouts: u64,
    pub dead_reaped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub pairings: u64,
    pub purged: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMetrics {
    pub questions: u64,
    pub answers: u64,
    pub audio_frames: u64,
    pub audio_frames_dropped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub malformed: u64,
    pub rejected: u64,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub connections: u64,
    pub sessions: usize,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_tracking() {
        let metrics = ServerMetrics::new();
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();

        let snap = metrics.snapshot();
        assert_eq!(snap.connections.active, 1);
        assert_eq!(snap.connections.total, 2);
    }

    #[test]
    fn test_counters_show_in_snapshot() {
        let metrics = ServerMetrics::new();
        ServerMetrics::incr(&metrics.questions_relayed);
        ServerMetrics::add(&metrics.sessions_purged, 3);
        let snap = metrics.snapshot();
        assert_eq!(snap.relay.questions, 1);
        assert_eq!(snap.sessions.purged, 3);
        assert_eq!(snap.errors.malformed, 0);
    }
}
