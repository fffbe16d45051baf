//! Wire Protocol
//!
//! One socket carries two encodings:
//! - UTF-8 text frames holding JSON objects tagged by `type`
//! - binary audio frames: `[audio type byte][raw payload...]`, no length
//!   prefix (the transport frames them)

use axum::body::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ProtocolError;
use crate::session_store::Role;

/// Source of an audio stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioType {
    System,
    Mic,
}

impl AudioType {
    /// Leading byte of a binary audio frame.
    pub fn discriminator(self) -> u8 {
        match self {
            AudioType::System => 0,
            AudioType::Mic => 1,
        }
    }

    pub fn from_discriminator(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(AudioType::System),
            1 => Some(AudioType::Mic),
            _ => None,
        }
    }
}

impl fmt::Display for AudioType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioType::System => f.write_str("system"),
            AudioType::Mic => f.write_str("mic"),
        }
    }
}

/// Messages sent FROM a peer TO the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    // === Handshake ===
    /// Ask for a fresh UID.
    NewConnection,
    /// Resume a previous session by UID.
    Reconnect {
        uid: String,
        #[serde(default)]
        role: Option<String>,
        #[serde(default, rename = "pairWithUID")]
        pair_with_uid: Option<String>,
    },

    // === Pairing ===
    /// `role` stays a string so unknown roles can be answered with an error.
    SetRole {
        role: String,
        #[serde(default, rename = "pairWithUID")]
        pair_with_uid: Option<String>,
    },

    // === Relay ===
    SendQuestion { question: String },
    SendAnswer { answer: String },
    StartAudio {
        #[serde(rename = "audioType")]
        audio_type: AudioType,
    },
    StopAudio {
        #[serde(rename = "audioType")]
        audio_type: AudioType,
    },
    /// Legacy base64 audio path; binary frames supersede it.
    AudioStream {
        #[serde(rename = "audioType")]
        audio_type: AudioType,
        data: String,
    },

    /// Application keepalive; refreshes the session's last-seen time.
    Ping,

    /// Any well-formed JSON with a `type` this relay does not know.
    #[serde(other, skip_serializing)]
    Unknown,
}

impl ClientMessage {
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            ClientMessage::NewConnection | ClientMessage::Reconnect { .. }
        )
    }
}

/// Messages sent FROM the relay TO a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// First frame on every socket; the peer answers with a handshake.
    ConnectionReady {
        #[serde(rename = "clientId")]
        client_id: String,
    },
    Connected {
        #[serde(rename = "clientId")]
        client_id: String,
        uid: String,
    },
    Reconnected {
        uid: String,
        role: Option<Role>,
        #[serde(rename = "pairedWith")]
        paired_with: Option<String>,
    },
    RoleSet {
        role: Role,
        uid: String,
    },
    Paired {
        #[serde(rename = "pairedWithUID")]
        paired_with_uid: String,
        role: Role,
    },
    QuestionReceived {
        question: String,
        from: String,
    },
    AnswerReceived {
        answer: String,
        from: String,
    },
    AudioStarted {
        #[serde(rename = "audioType")]
        audio_type: AudioType,
        from: String,
    },
    AudioStopped {
        #[serde(rename = "audioType")]
        audio_type: AudioType,
        from: String,
    },
    AudioReceived {
        #[serde(rename = "audioType")]
        audio_type: AudioType,
        data: String,
        from: String,
    },
    PartnerDisconnected {
        #[serde(rename = "canReconnect")]
        can_reconnect: bool,
        /// Seconds left in the partner's resumption window.
        #[serde(rename = "reconnectWindow")]
        reconnect_window: u64,
    },
    PartnerReconnected {
        #[serde(rename = "partnerUID")]
        partner_uid: String,
    },
    Pong,
    Error {
        error: String,
    },
}

impl ServerMessage {
    pub fn error(err: impl fmt::Display) -> Self {
        ServerMessage::Error {
            error: err.to_string(),
        }
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(ClientMessage),
    /// Valid JSON whose `type` is not recognized; carries the type for logs.
    Unrecognized(String),
    /// Binary audio, kept whole so it can be forwarded byte-for-byte.
    Audio { audio_type: AudioType, frame: Bytes },
}

/// Decode a text frame.
pub fn parse_text(text: &str) -> Result<Inbound, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|_| ProtocolError::InvalidFormat)?;
    let msg_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();
    match serde_json::from_value::<ClientMessage>(value) {
        Ok(ClientMessage::Unknown) => Ok(Inbound::Unrecognized(msg_type)),
        Ok(msg) => Ok(Inbound::Message(msg)),
        Err(_) => Err(ProtocolError::InvalidFormat),
    }
}

/// Decode a binary frame. Audio frames win; otherwise the bytes get one more
/// chance as UTF-8 JSON.
pub fn parse_binary(frame: Bytes) -> Result<Inbound, ProtocolError> {
    let Some(&first) = frame.first() else {
        return Err(ProtocolError::InvalidFormat);
    };
    if let Some(audio_type) = AudioType::from_discriminator(first) {
        return Ok(Inbound::Audio { audio_type, frame });
    }
    match std::str::from_utf8(&frame) {
        Ok(text) => parse_text(text),
        Err(_) => Err(ProtocolError::InvalidFormat),
    }
}

/// Build a binary audio frame.
pub fn encode_audio_frame(audio_type: AudioType, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.push(audio_type.discriminator());
    frame.extend_from_slice(payload);
    frame
}

/// Split a binary audio frame into its type and payload.
pub fn decode_audio_frame(frame: &[u8]) -> Result<(AudioType, &[u8]), ProtocolError> {
    let (&first, payload) = frame.split_first().ok_or(ProtocolError::InvalidFormat)?;
    let audio_type = AudioType::from_discriminator(first).ok_or(ProtocolError::InvalidFormat)?;
    Ok((audio_type, payload))
}
