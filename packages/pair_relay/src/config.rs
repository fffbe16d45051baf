use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// File config (figment-deserialized from defaults / pair-relay.toml / env vars)
// =============================================================================
//
//   pair-relay.toml:   [session]
//                      ttl_secs = 600
//
//   env var:           PAIR_RELAY_SESSION__TTL_SECS=600   (double underscore = nesting)

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "pair-relay.toml";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatFileConfig,
    #[serde(default)]
    pub client: ClientFileConfig,
}

/// Listener settings (lives under `[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Session lifetime settings (lives under `[session]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionFileConfig {
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl_secs(),
            purge_interval_secs: default_purge_interval_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
        }
    }
}

/// Liveness sweep settings (lives under `[heartbeat]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatFileConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_status_log_interval_secs")]
    pub status_log_interval_secs: u64,
}

impl Default for HeartbeatFileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval_secs(),
            status_log_interval_secs: default_status_log_interval_secs(),
        }
    }
}

/// Reconnecting client settings (lives under `[client]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientFileConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

impl Default for ClientFileConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_session_ttl_secs() -> u64 {
    30 * 60
}
fn default_purge_interval_secs() -> u64 {
    5 * 60
}
fn default_handshake_timeout_secs() -> u64 {
    10
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_status_log_interval_secs() -> u64 {
    5 * 60
}
fn default_server_url() -> String {
    "ws://127.0.0.1:8080/ws".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    10
}
fn default_keepalive_secs() -> u64 {
    30
}

/// Build a figment that layers: defaults → config file → PAIR_RELAY_* env vars.
///
/// A missing config file is not an error; its layer is simply empty.
///
/// Env vars use double-underscore for nesting into sections:
///   `PAIR_RELAY_SERVER__PORT=9000`  →  `server.port = 9000`
///   `PAIR_RELAY_CLIENT__MAX_ATTEMPTS=3`  →  `client.max_attempts = 3`
pub fn load_config(config_file: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_file))
        .merge(Env::prefixed("PAIR_RELAY_").split("__"))
}

// =============================================================================
// Runtime config structs
// =============================================================================

/// Relay server configuration (runtime view).
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// How long a session stays resumable after it was last seen
    pub session_ttl: Duration,
    pub purge_interval: Duration,
    /// PENDING sockets are closed after this long without a handshake
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub status_log_interval: Duration,
}

impl RelayConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            host: fc.server.host.clone(),
            port: fc.server.port,
            session_ttl: Duration::from_secs(fc.session.ttl_secs),
            purge_interval: Duration::from_secs(fc.session.purge_interval_secs.max(1)),
            handshake_timeout: Duration::from_secs(fc.session.handshake_timeout_secs),
            heartbeat_interval: Duration::from_secs(fc.heartbeat.interval_secs.max(1)),
            status_log_interval: Duration::from_secs(fc.heartbeat.status_log_interval_secs.max(1)),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}

/// Reconnecting client configuration (runtime view).
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub server_url: String,
    /// Bound on opening the socket plus completing the handshake
    pub connect_timeout: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Interval between application-level pings while connected
    pub keepalive: Duration,
}

impl ClientConfig {
    pub fn from_file(fc: &ClientFileConfig) -> Self {
        Self {
            server_url: fc.server_url.clone(),
            connect_timeout: Duration::from_secs(fc.connect_timeout_secs),
            base_delay: Duration::from_millis(fc.base_delay_ms),
            max_delay: Duration::from_millis(fc.max_delay_ms),
            max_attempts: fc.max_attempts,
            keepalive: Duration::from_secs(fc.keepalive_secs.max(1)),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_file(&ClientFileConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_file_config_defaults() {
        let fc = FileConfig::default();
        assert_eq!(fc.server.host, "0.0.0.0");
        assert_eq!(fc.server.port, 8080);
        assert_eq!(fc.session.ttl_secs, 1800); // 30 minutes
        assert_eq!(fc.session.purge_interval_secs, 300);
        assert_eq!(fc.session.handshake_timeout_secs, 10);
        assert_eq!(fc.heartbeat.interval_secs, 30);
        assert_eq!(fc.client.max_attempts, 10);
        assert_eq!(fc.client.server_url, "ws://127.0.0.1:8080/ws");
    }

    // ── from_file ───────────────────────────────────────────────────────

    #[test]
    fn test_relay_config_from_file() {
        let rc = RelayConfig::default();
        assert_eq!(rc.session_ttl, Duration::from_secs(1800));
        assert_eq!(rc.purge_interval, Duration::from_secs(300));
        assert_eq!(rc.handshake_timeout, Duration::from_secs(10));
        assert_eq!(rc.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(rc.bind_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn test_relay_config_zero_intervals_are_clamped() {
        let mut fc = FileConfig::default();
        fc.session.purge_interval_secs = 0;
        fc.heartbeat.interval_secs = 0;
        let rc = RelayConfig::from_file(&fc);
        assert_eq!(rc.purge_interval, Duration::from_secs(1));
        assert_eq!(rc.heartbeat_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_client_config_from_file() {
        let cc = ClientConfig::default();
        assert_eq!(cc.connect_timeout, Duration::from_secs(10));
        assert_eq!(cc.base_delay, Duration::from_millis(1000));
        assert_eq!(cc.max_delay, Duration::from_millis(30_000));
        assert_eq!(cc.keepalive, Duration::from_secs(30));
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(&tmp.path().join(DEFAULT_CONFIG_FILE))
            .extract()
            .unwrap();
        assert_eq!(fc.session.ttl_secs, 1800);
        assert_eq!(fc.client.base_delay_ms, 1000);
    }

    #[test]
    fn test_load_config_toml_overrides_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(
            &path,
            "[server]\nport = 9100\n\n[session]\nttl_secs = 60\n\n[client]\nmax_attempts = 3\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(&path).extract().unwrap();
        assert_eq!(fc.server.port, 9100);
        assert_eq!(fc.server.host, "0.0.0.0"); // untouched field keeps its default
        assert_eq!(fc.session.ttl_secs, 60);
        assert_eq!(fc.session.handshake_timeout_secs, 10);
        assert_eq!(fc.client.max_attempts, 3);
    }

    #[test]
    fn test_load_config_rejects_bad_types() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "[server]\nport = \"not a port\"\n").unwrap();
        assert!(load_config(&path).extract::<FileConfig>().is_err());
    }
}
