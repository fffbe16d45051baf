//! Reconnecting relay client
//!
//! [`RelayClient`] owns one logical connection to the relay. Each transport
//! it opens is stamped with a generation number; events from a transport
//! whose generation is no longer current are dropped, so a superseded socket
//! can neither resolve a connect nor trigger a reconnect.
//!
//! When an established transport drops while connection parameters are
//! still saved, a background task retries with exponential backoff and
//! resumes the saved UID. Manual [`RelayClient::disconnect`] clears the
//! parameters and cancels every timer.

use axum::body::Bytes;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::future::{BoxFuture, FutureExt};
use futures::{SinkExt, StreamExt};
use futures_util::stream::{SplitSink, SplitStream};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::protocol::{AudioType, ClientMessage, ServerMessage, decode_audio_frame, encode_audio_frame};
use crate::session_store::Role;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_CAPACITY: usize = 256;

/// `min(base * 2^attempt, cap)`.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

/// Lifecycle and relay events, fanned out to every subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Handshake completed with a freshly minted UID. If a UID was being
    /// resumed and this one differs, the old session expired.
    Connected { uid: String },
    Reconnected {
        uid: String,
        role: Option<Role>,
        paired_with: Option<String>,
    },
    Disconnected,
    Reconnecting { attempt: u32, delay: Duration },
    ReconnectFailed { reason: String },
    RoleSet { role: Role, uid: String },
    Paired { paired_with_uid: String, role: Role },
    QuestionReceived { question: String, from: String },
    AnswerReceived { answer: String, from: String },
    PartnerDisconnected { reconnect_window: u64 },
    PartnerReconnected { partner_uid: String },
    AudioStarted { audio_type: AudioType, from: String },
    AudioStopped { audio_type: AudioType, from: String },
    /// Legacy JSON audio, already base64-decoded.
    AudioReceived {
        audio_type: AudioType,
        data: Vec<u8>,
        from: String,
    },
    /// Binary audio frame from the partner.
    AudioFrame { audio_type: AudioType, payload: Bytes },
    ServerError { error: String },
    TransportError { error: String },
}

/// Parameters kept for automatic and manual reconnection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedConnection {
    pub uid: Option<String>,
    pub role: Role,
    pub pair_with: Option<String>,
    pub server_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStatus {
    pub connected: bool,
    pub saved_connection: Option<SavedConnection>,
    pub reconnect_attempts: u32,
}

#[derive(Default)]
struct ClientState {
    connected: bool,
    saved: Option<SavedConnection>,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    /// Cancels the current transport's reader, writer and keepalive.
    transport_cancel: Option<CancellationToken>,
    /// Cancels the background retry loop, if one is running.
    retry_cancel: Option<CancellationToken>,
    attempts: u32,
}

struct Inner {
    config: ClientConfig,
    /// Bumped (under the state lock) whenever a new transport supersedes the
    /// current one or the client is torn down.
    generation: AtomicU64,
    state: Mutex<ClientState>,
    events: broadcast::Sender<ClientEvent>,
}

/// Handle to the reconnecting client. Cheap to clone.
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<Inner>,
}

impl RelayClient {
    pub fn new(config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                generation: AtomicU64::new(0),
                state: Mutex::new(ClientState::default()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Connect and complete the handshake. Resolves with the bound UID.
    ///
    /// `server_url` falls back to the configured URL. With `existing_uid`
    /// the client asks to resume that session.
    pub async fn connect(
        &self,
        role: Role,
        pair_with: Option<String>,
        server_url: Option<String>,
        existing_uid: Option<String>,
    ) -> Result<String, ClientError> {
        {
            let mut st = self.inner.state.lock().await;
            if st.connected {
                return Err(ClientError::AlreadyConnected);
            }
            let server_url = server_url
                .filter(|u| !u.is_empty())
                .or_else(|| Some(self.inner.config.server_url.clone()).filter(|u| !u.is_empty()))
                .ok_or(ClientError::NoServerUrl)?;

            if let Some(retry) = st.retry_cancel.take() {
                retry.cancel();
            }
            st.attempts = 0;
            st.saved = Some(SavedConnection {
                uid: existing_uid,
                role,
                pair_with: pair_with.filter(|p| !p.trim().is_empty()),
                server_url,
            });
        }
        self.establish().await
    }

    /// Drop the current transport (if any) and resume the saved session now.
    pub async fn reconnect(&self) -> Result<String, ClientError> {
        {
            let mut st = self.inner.state.lock().await;
            if st.saved.is_none() {
                return Err(ClientError::NoSavedConnection);
            }
            if let Some(retry) = st.retry_cancel.take() {
                retry.cancel();
            }
            st.attempts = 0;
        }
        self.establish().await
    }

    /// Close the connection for good: saved parameters are forgotten and no
    /// automatic reconnection will follow.
    pub async fn disconnect(&self) {
        let was_connected = {
            let mut st = self.inner.state.lock().await;
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            st.saved = None;
            st.attempts = 0;
            st.outbound = None;
            if let Some(retry) = st.retry_cancel.take() {
                retry.cancel();
            }
            if let Some(transport) = st.transport_cancel.take() {
                transport.cancel();
            }
            std::mem::replace(&mut st.connected, false)
        };
        if was_connected {
            info!("Disconnected from relay");
            self.emit(ClientEvent::Disconnected);
        }
    }

    pub async fn status(&self) -> ClientStatus {
        let st = self.inner.state.lock().await;
        ClientStatus {
            connected: st.connected,
            saved_connection: st.saved.clone(),
            reconnect_attempts: st.attempts,
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.state.lock().await.connected
    }

    pub async fn uid(&self) -> Option<String> {
        let st = self.inner.state.lock().await;
        st.saved.as_ref().and_then(|s| s.uid.clone())
    }

    // =========================================================================
    // Senders
    // =========================================================================

    /// Change role (and, for helpers, the asker to pair with). Also updates
    /// the parameters used when resuming.
    pub async fn set_role(&self, role: Role, pair_with: Option<String>) -> Result<(), ClientError> {
        let pair_with = pair_with.filter(|p| !p.trim().is_empty());
        {
            let mut st = self.inner.state.lock().await;
            if let Some(saved) = st.saved.as_mut() {
                saved.role = role;
                saved.pair_with = pair_with.clone();
            }
        }
        self.send(&ClientMessage::SetRole {
            role: role.to_string(),
            pair_with_uid: pair_with,
        })
        .await
    }

    pub async fn send_question(&self, question: impl Into<String>) -> Result<(), ClientError> {
        self.send(&ClientMessage::SendQuestion {
            question: question.into(),
        })
        .await
    }

    pub async fn send_answer(&self, answer: impl Into<String>) -> Result<(), ClientError> {
        self.send(&ClientMessage::SendAnswer {
            answer: answer.into(),
        })
        .await
    }

    pub async fn start_audio(&self, audio_type: AudioType) -> Result<(), ClientError> {
        self.send(&ClientMessage::StartAudio { audio_type }).await
    }

    pub async fn stop_audio(&self, audio_type: AudioType) -> Result<(), ClientError> {
        self.send(&ClientMessage::StopAudio { audio_type }).await
    }

    /// Send raw audio as a binary frame.
    pub async fn send_audio(&self, audio_type: AudioType, payload: &[u8]) -> Result<(), ClientError> {
        let frame = encode_audio_frame(audio_type, payload);
        self.send_raw(Message::Binary(frame.into())).await
    }

    /// Send audio through the JSON base64 path older peers understand.
    pub async fn send_audio_legacy(
        &self,
        audio_type: AudioType,
        payload: &[u8],
    ) -> Result<(), ClientError> {
        self.send(&ClientMessage::AudioStream {
            audio_type,
            data: BASE64.encode(payload),
        })
        .await
    }

    async fn send(&self, msg: &ClientMessage) -> Result<(), ClientError> {
        let json = serde_json::to_string(msg)?;
        self.send_raw(Message::Text(json.into())).await
    }

    async fn send_raw(&self, msg: Message) -> Result<(), ClientError> {
        let st = self.inner.state.lock().await;
        let tx = st.outbound.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(msg).map_err(|_| ClientError::NotConnected)
    }

    // =========================================================================
    // Transport lifecycle
    // =========================================================================

    fn emit(&self, event: ClientEvent) {
        let _ = self.inner.events.send(event);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.generation.load(Ordering::SeqCst) == generation
    }

    /// One attempt: open a transport, handshake with the saved parameters and
    /// install the transport tasks. Any older transport is superseded.
    async fn establish(&self) -> Result<String, ClientError> {
        let (generation, saved) = {
            let mut st = self.inner.state.lock().await;
            let saved = st.saved.clone().ok_or(ClientError::NoSavedConnection)?;
            let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(old) = st.transport_cancel.take() {
                old.cancel();
            }
            st.connected = false;
            st.outbound = None;
            (generation, saved)
        };

        debug!(url = %saved.server_url, resume = ?saved.uid, "Connecting to relay");
        let (ws, reply) = match tokio::time::timeout(
            self.inner.config.connect_timeout,
            handshake(&saved),
        )
        .await
        {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!(url = %saved.server_url, "Connection timeout, no response from relay");
                return Err(ClientError::Timeout);
            }
        };

        let (uid, event, resend_role) = match reply {
            ServerMessage::Connected { uid, .. } => {
                if let Some(previous) = saved.uid.as_deref().filter(|p| *p != uid) {
                    info!(previous = %previous, uid = %uid, "Session expired, assigned new UID");
                }
                (uid.clone(), ClientEvent::Connected { uid }, true)
            }
            ServerMessage::Reconnected {
                uid,
                role,
                paired_with,
            } => {
                let repair = paired_with.is_none() && saved.pair_with.is_some();
                (
                    uid.clone(),
                    ClientEvent::Reconnected {
                        uid,
                        role,
                        paired_with,
                    },
                    repair,
                )
            }
            _ => return Err(ClientError::Closed),
        };

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut st = self.inner.state.lock().await;
            if !self.is_current(generation) || st.saved.is_none() {
                debug!("Handshake finished for a superseded attempt, dropping it");
                return Err(ClientError::Superseded);
            }
            st.connected = true;
            st.attempts = 0;
            st.outbound = Some(tx.clone());
            st.transport_cancel = Some(cancel.clone());
            if let Some(retry) = st.retry_cancel.take() {
                retry.cancel();
            }
            if let Some(saved) = st.saved.as_mut() {
                saved.uid = Some(uid.clone());
            }
        }

        let (write, read) = ws.split();
        tokio::spawn(run_writer(write, rx, cancel.clone()));
        tokio::spawn(run_keepalive(tx.clone(), self.inner.config.keepalive, cancel.clone()));
        tokio::spawn(self.clone().run_reader(read, generation, cancel));

        info!(uid = %uid, "Connected to relay");
        self.emit(event);

        if resend_role {
            let set_role = ClientMessage::SetRole {
                role: saved.role.to_string(),
                pair_with_uid: saved.pair_with.clone(),
            };
            let _ = tx.send(Message::Text(serde_json::to_string(&set_role)?.into()));
        }
        Ok(uid)
    }

    /// Boxed so the reader → retry → establish → reader cycle has a
    /// concrete `Send` type.
    fn run_reader(
        self,
        mut read: SplitStream<WsStream>,
        generation: u64,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        async move {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = read.next() => next,
                };
                match next {
                    Some(Ok(Message::Text(text))) => {
                        if !self.is_current(generation) {
                            continue;
                        }
                        match serde_json::from_str::<ServerMessage>(text.as_str()) {
                            Ok(msg) => {
                                if let Some(event) = translate(msg) {
                                    self.emit(event);
                                }
                            }
                            Err(e) => debug!("Ignoring unparseable relay message: {}", e),
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if !self.is_current(generation) {
                            continue;
                        }
                        match decode_audio_frame(&data) {
                            Ok((audio_type, _)) => self.emit(ClientEvent::AudioFrame {
                                audio_type,
                                payload: data.slice(1..),
                            }),
                            Err(_) => debug!(len = data.len(), "Ignoring unknown binary frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        if self.is_current(generation) {
                            self.emit(ClientEvent::TransportError {
                                error: e.to_string(),
                            });
                        }
                        break;
                    }
                }
            }
            self.transport_closed(generation).await;
        }
        .boxed()
    }

    /// The current transport went away without a manual disconnect.
    async fn transport_closed(&self, generation: u64) {
        let retry = {
            let mut st = self.inner.state.lock().await;
            if !self.is_current(generation) {
                debug!("Close from superseded transport, ignoring");
                return;
            }
            st.connected = false;
            st.outbound = None;
            if let Some(transport) = st.transport_cancel.take() {
                transport.cancel();
            }
            if st.saved.is_none() {
                None
            } else if st.retry_cancel.as_ref().is_some_and(|t| !t.is_cancelled()) {
                None
            } else {
                let token = CancellationToken::new();
                st.retry_cancel = Some(token.clone());
                Some(token)
            }
        };

        info!("Relay connection lost");
        self.emit(ClientEvent::Disconnected);

        if let Some(token) = retry {
            tokio::spawn(self.clone().retry_loop(token));
        }
    }

    async fn retry_loop(self, token: CancellationToken) {
        let config = &self.inner.config;
        loop {
            let attempt = {
                let mut st = self.inner.state.lock().await;
                if token.is_cancelled() || st.saved.is_none() {
                    return;
                }
                if st.attempts >= config.max_attempts {
                    warn!(attempts = st.attempts, "Max reconnect attempts reached");
                    token.cancel();
                    drop(st);
                    self.emit(ClientEvent::ReconnectFailed {
                        reason: "Max attempts reached".to_string(),
                    });
                    return;
                }
                let attempt = st.attempts;
                st.attempts += 1;
                attempt
            };

            let delay = backoff_delay(attempt, config.base_delay, config.max_delay);
            info!(
                attempt = attempt + 1,
                max = config.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Attempting reconnection"
            );
            self.emit(ClientEvent::Reconnecting {
                attempt: attempt + 1,
                delay,
            });

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if token.is_cancelled() {
                return;
            }

            match self.establish().await {
                Ok(_) => return,
                Err(ClientError::Superseded) | Err(ClientError::NoSavedConnection) => return,
                Err(e) => {
                    debug!(attempt = attempt + 1, "Reconnect failed: {}", e);
                    self.emit(ClientEvent::TransportError {
                        error: e.to_string(),
                    });
                }
            }
        }
    }
}

/// Open the socket, wait for `connection-ready`, then send the handshake and
/// wait for its reply.
async fn handshake(saved: &SavedConnection) -> Result<(WsStream, ServerMessage), ClientError> {
    let (mut ws, _) = tokio_tungstenite::connect_async(saved.server_url.as_str()).await?;

    loop {
        match next_server_message(&mut ws).await? {
            ServerMessage::ConnectionReady { .. } => break,
            other => debug!("Ignoring {:?} before connection-ready", other),
        }
    }

    let hello = match &saved.uid {
        Some(uid) => ClientMessage::Reconnect {
            uid: uid.clone(),
            role: Some(saved.role.to_string()),
            pair_with_uid: saved.pair_with.clone(),
        },
        None => ClientMessage::NewConnection,
    };
    ws.send(Message::Text(serde_json::to_string(&hello)?.into()))
        .await?;

    loop {
        match next_server_message(&mut ws).await? {
            reply @ (ServerMessage::Connected { .. } | ServerMessage::Reconnected { .. }) => {
                return Ok((ws, reply));
            }
            ServerMessage::Error { error } => warn!("Relay rejected handshake message: {}", error),
            other => debug!("Ignoring {:?} during handshake", other),
        }
    }
}

async fn next_server_message(ws: &mut WsStream) -> Result<ServerMessage, ClientError> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str(text.as_str()) {
                Ok(msg) => return Ok(msg),
                Err(e) => debug!("Ignoring unparseable relay message: {}", e),
            },
            Some(Ok(Message::Close(_))) | None => return Err(ClientError::Closed),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

async fn run_writer(
    mut write: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            msg = rx.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = write.send(msg).await {
                        debug!("Relay write failed: {}", e);
                        break;
                    }
                }
                None => break,
            }
        }
    }
}

/// Application-level ping so the relay keeps the session's last-seen fresh.
async fn run_keepalive(
    tx: mpsc::UnboundedSender<Message>,
    every: Duration,
    cancel: CancellationToken,
) {
    let ping = match serde_json::to_string(&ClientMessage::Ping) {
        Ok(json) => json,
        Err(_) => return,
    };
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if tx.send(Message::Text(ping.clone().into())).is_err() {
                    break;
                }
            }
        }
    }
}

/// Map a post-handshake relay message to a client event.
fn translate(msg: ServerMessage) -> Option<ClientEvent> {
    let event = match msg {
        ServerMessage::RoleSet { role, uid } => ClientEvent::RoleSet { role, uid },
        ServerMessage::Paired {
            paired_with_uid,
            role,
        } => ClientEvent::Paired {
            paired_with_uid,
            role,
        },
        ServerMessage::QuestionReceived { question, from } => {
            ClientEvent::QuestionReceived { question, from }
        }
        ServerMessage::AnswerReceived { answer, from } => ClientEvent::AnswerReceived { answer, from },
        ServerMessage::AudioStarted { audio_type, from } => {
            ClientEvent::AudioStarted { audio_type, from }
        }
        ServerMessage::AudioStopped { audio_type, from } => {
            ClientEvent::AudioStopped { audio_type, from }
        }
        ServerMessage::AudioReceived {
            audio_type,
            data,
            from,
        } => match BASE64.decode(data.as_bytes()) {
            Ok(data) => ClientEvent::AudioReceived {
                audio_type,
                data,
                from,
            },
            Err(e) => {
                debug!("Dropping legacy audio with bad base64: {}", e);
                return None;
            }
        },
        ServerMessage::PartnerDisconnected {
            reconnect_window, ..
        } => ClientEvent::PartnerDisconnected { reconnect_window },
        ServerMessage::PartnerReconnected { partner_uid } => {
            ClientEvent::PartnerReconnected { partner_uid }
        }
        ServerMessage::Error { error } => ClientEvent::ServerError { error },
        ServerMessage::ConnectionReady { .. }
        | ServerMessage::Connected { .. }
        | ServerMessage::Reconnected { .. }
        | ServerMessage::Pong => return None,
    };
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_secs(1);
    const CAP: Duration = Duration::from_secs(30);

    #[test]
    fn test_backoff_doubles_from_base() {
        assert_eq!(backoff_delay(0, BASE, CAP), Duration::from_secs(1));
        assert_eq!(backoff_delay(1, BASE, CAP), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, BASE, CAP), Duration::from_secs(4));
        assert_eq!(backoff_delay(4, BASE, CAP), Duration::from_secs(16));
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff_delay(5, BASE, CAP), CAP);
        assert_eq!(backoff_delay(9, BASE, CAP), CAP);
        // Overflowing exponents still land on the cap
        assert_eq!(backoff_delay(40, BASE, CAP), CAP);
        assert_eq!(backoff_delay(u32::MAX, BASE, CAP), CAP);
    }

    #[test]
    fn test_translate_relay_messages() {
        assert_eq!(
            translate(ServerMessage::QuestionReceived {
                question: "q".into(),
                from: "A1B2C3D4".into()
            }),
            Some(ClientEvent::QuestionReceived {
                question: "q".into(),
                from: "A1B2C3D4".into()
            })
        );
        assert_eq!(
            translate(ServerMessage::error("No helper paired")),
            Some(ClientEvent::ServerError {
                error: "No helper paired".into()
            })
        );
        assert_eq!(translate(ServerMessage::Pong), None);
    }

    #[test]
    fn test_translate_decodes_legacy_audio() {
        let event = translate(ServerMessage::AudioReceived {
            audio_type: AudioType::Mic,
            data: BASE64.encode([1u8, 2, 3]),
            from: "A1B2C3D4".into(),
        });
        assert_eq!(
            event,
            Some(ClientEvent::AudioReceived {
                audio_type: AudioType::Mic,
                data: vec![1, 2, 3],
                from: "A1B2C3D4".into()
            })
        );
        assert_eq!(
            translate(ServerMessage::AudioReceived {
                audio_type: AudioType::Mic,
                data: "***".into(),
                from: "A1B2C3D4".into(),
            }),
            None
        );
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_client_futures_are_send() {
        // Spawned reconnect paths (reader -> retry loop -> establish) must
        // stay `Send` for `tokio::spawn`
        let client = RelayClient::new(ClientConfig::default());
        assert_send(&client.connect(Role::Asker, None, None, None));
        assert_send(&client.reconnect());
        assert_send(&client.clone().retry_loop(CancellationToken::new()));
    }

    #[tokio::test]
    async fn test_connect_times_out_against_silent_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accepts TCP and never answers the upgrade
        let silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let client = RelayClient::new(ClientConfig {
            server_url: format!("ws://{addr}/ws"),
            connect_timeout: Duration::from_millis(300),
            ..ClientConfig::default()
        });
        let mut events = client.subscribe();
        let started = tokio::time::Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            client.connect(Role::Asker, None, None, None),
        )
        .await
        .expect("connect should give up on its own");

        assert!(matches!(result, Err(ClientError::Timeout)));
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(!client.is_connected().await);
        // A failed first connect does not start retrying
        assert!(client.status().await.saved_connection.is_some());
        assert!(events.try_recv().is_err());
        silent.abort();
    }

    #[tokio::test]
    async fn test_senders_fail_when_not_connected() {
        let client = RelayClient::new(ClientConfig::default());
        assert!(matches!(
            client.send_question("hello").await,
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            client.send_audio(AudioType::Mic, &[1, 2]).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_reconnect_without_saved_connection() {
        let client = RelayClient::new(ClientConfig::default());
        assert!(matches!(
            client.reconnect().await,
            Err(ClientError::NoSavedConnection)
        ));
    }

    #[tokio::test]
    async fn test_connect_requires_server_url() {
        let config = ClientConfig {
            server_url: String::new(),
            ..ClientConfig::default()
        };
        let client = RelayClient::new(config);
        assert!(matches!(
            client.connect(Role::Asker, None, None, None).await,
            Err(ClientError::NoServerUrl)
        ));
        assert!(client.status().await.saved_connection.is_none());
    }

    #[tokio::test]
    async fn test_failed_connect_keeps_saved_parameters() {
        let config = ClientConfig {
            connect_timeout: Duration::from_secs(2),
            ..ClientConfig::default()
        };
        let client = RelayClient::new(config);
        // Port 9 (discard) on loopback is refused in test environments
        let result = client
            .connect(
                Role::Helper,
                Some("A1B2C3D4".into()),
                Some("ws://127.0.0.1:9/ws".into()),
                None,
            )
            .await;
        assert!(result.is_err());

        let status = client.status().await;
        assert!(!status.connected);
        let saved = status.saved_connection.unwrap();
        assert_eq!(saved.role, Role::Helper);
        assert_eq!(saved.pair_with.as_deref(), Some("A1B2C3D4"));

        client.disconnect().await;
        assert!(client.status().await.saved_connection.is_none());
    }
}
