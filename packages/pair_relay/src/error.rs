use tokio_tungstenite::tungstenite;

/// Recoverable protocol failures. The `Display` text is what the peer sees
/// in `error{error}`; none of these close the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid message format")]
    InvalidFormat,

    #[error("Handshake already completed")]
    AlreadyHandshaken,

    #[error("Invalid role. Must be \"asker\" or \"helper\"")]
    InvalidRole(String),

    #[error("Asker with that UID not found")]
    AskerNotFound,

    #[error("No helper paired")]
    NoHelperPaired,

    #[error("No asker paired")]
    NoAskerPaired,

    #[error("Your partner paired with someone else")]
    PairingReplaced,
}

/// Failures surfaced by [`crate::client::RelayClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected to relay server")]
    NotConnected,

    #[error("No relay server URL provided")]
    NoServerUrl,

    #[error("No previous connection information")]
    NoSavedConnection,

    #[error("Connection timeout")]
    Timeout,

    #[error("Connection closed before the handshake completed")]
    Closed,

    #[error("Connection attempt superseded by a newer one")]
    Superseded,

    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("failed to encode message: {0}")]
    Serialize(#[from] serde_json::Error),
}
