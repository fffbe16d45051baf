//! Hub actor
//!
//! Owns the [`RelayHub`] on a single task. Socket tasks, timers and HTTP
//! handlers talk to it through [`RelayHandle`].

use anyhow::Result;
use axum::body::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RelayConfig;
use crate::hub::{RelayHub, RelayStatus};
use crate::metrics::ServerMetrics;
use crate::registry::{ConnectionId, OutboundTx};

const INBOX_CAPACITY: usize = 1024;

/// Everything that can change relay state, in arrival order.
#[derive(Debug)]
pub enum HubEvent {
    Opened { id: ConnectionId, tx: OutboundTx },
    Text { id: ConnectionId, text: String },
    Binary { id: ConnectionId, frame: Bytes },
    Pong { id: ConnectionId },
    Closed { id: ConnectionId },
    HandshakeTimeout { id: ConnectionId },
    Status { respond_to: oneshot::Sender<RelayStatus> },
}

/// Handle to the hub actor
#[derive(Clone)]
pub struct RelayHandle {
    sender: mpsc::Sender<HubEvent>,
}

impl RelayHandle {
    /// Spawn the hub actor. It runs until `shutdown` is cancelled.
    pub fn spawn(config: &RelayConfig, metrics: Arc<ServerMetrics>, shutdown: CancellationToken) -> Self {
        let (sender, inbox) = mpsc::channel(INBOX_CAPACITY);
        let actor = HubActor {
            hub: RelayHub::new(config.session_ttl, metrics),
            inbox,
            timers: sender.downgrade(),
            config: config.clone(),
            shutdown,
        };
        tokio::spawn(actor.run());
        Self { sender }
    }

    async fn send(&self, event: HubEvent) -> Result<()> {
        self.sender
            .send(event)
            .await
            .map_err(|_| anyhow::anyhow!("Relay hub is gone"))
    }

    pub async fn opened(&self, id: ConnectionId, tx: OutboundTx) -> Result<()> {
        self.send(HubEvent::Opened { id, tx }).await
    }

    pub async fn text(&self, id: ConnectionId, text: String) -> Result<()> {
        self.send(HubEvent::Text { id, text }).await
    }

    pub async fn binary(&self, id: ConnectionId, frame: Bytes) -> Result<()> {
        self.send(HubEvent::Binary { id, frame }).await
    }

    pub async fn pong(&self, id: ConnectionId) -> Result<()> {
        self.send(HubEvent::Pong { id }).await
    }

    pub async fn closed(&self, id: ConnectionId) -> Result<()> {
        self.send(HubEvent::Closed { id }).await
    }

    pub async fn status(&self) -> Result<RelayStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(HubEvent::Status { respond_to: tx }).await?;
        rx.await
            .map_err(|_| anyhow::anyhow!("Relay hub didn't respond"))
    }
}

struct HubActor {
    hub: RelayHub,
    inbox: mpsc::Receiver<HubEvent>,
    /// For timer tasks; weak so the actor does not keep its own inbox open.
    timers: mpsc::WeakSender<HubEvent>,
    config: RelayConfig,
    shutdown: CancellationToken,
}

impl HubActor {
    async fn run(mut self) {
        info!(
            ttl_secs = self.config.session_ttl.as_secs(),
            heartbeat_secs = self.config.heartbeat_interval.as_secs(),
            "Relay hub started"
        );

        let mut purge = ticker(self.config.purge_interval);
        let mut heartbeat = ticker(self.config.heartbeat_interval);
        let mut status_log = ticker(self.config.status_log_interval);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.hub.close_all();
                    break;
                }
                event = self.inbox.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = purge.tick() => {
                    self.hub.purge_expired(Instant::now());
                }
                _ = heartbeat.tick() => {
                    let reaped = self.hub.heartbeat_sweep(Instant::now());
                    if reaped > 0 {
                        debug!(reaped, "Heartbeat sweep");
                    }
                }
                _ = status_log.tick() => {
                    let s = self.hub.status();
                    info!(
                        connections = s.connections,
                        askers = s.askers,
                        helpers = s.helpers,
                        unassigned = s.unassigned,
                        sessions = s.sessions,
                        pairs = s.pairs.len(),
                        "Relay status"
                    );
                }
            }
        }

        info!("Relay hub stopped");
    }

    fn handle(&mut self, event: HubEvent) {
        let now = Instant::now();
        match event {
            HubEvent::Opened { id, tx } => {
                let token = self.hub.open(id, tx, now);
                self.arm_handshake_timer(id, token);
            }
            HubEvent::Text { id, text } => self.hub.handle_text(id, &text, now),
            HubEvent::Binary { id, frame } => self.hub.handle_binary(id, frame, now),
            HubEvent::Pong { id } => self.hub.pong(id, now),
            HubEvent::Closed { id } => self.hub.close(id, now),
            HubEvent::HandshakeTimeout { id } => self.hub.handshake_timeout(id),
            HubEvent::Status { respond_to } => {
                let _ = respond_to.send(self.hub.status());
            }
        }
    }

    /// Post a timeout event unless the handshake completes (or the entry is
    /// discarded) first. The hub re-checks PENDING when the event arrives.
    fn arm_handshake_timer(&self, id: ConnectionId, token: CancellationToken) {
        let timers = self.timers.clone();
        let timeout = self.config.handshake_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some(sender) = timers.upgrade() {
                        let _ = sender.send(HubEvent::HandshakeTimeout { id }).await;
                    }
                }
            }
        });
    }
}

/// An interval whose first tick is one full period away.
fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
