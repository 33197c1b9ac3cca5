use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Coarse classification of a failure, tagged where it was detected.
///
/// The resilience engine only aggregates by kind and time; it never looks at
/// the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Output/capture device failure (suspended, closed, rejected a buffer)
    AudioContext,
    /// Transport-level failure (connect refused, DNS, TLS, HTTP)
    Network,
    /// Channel protocol failure on an open socket
    #[serde(rename = "websocket")]
    WebSocket,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AudioContext => "audioContext",
            ErrorKind::Network => "network",
            ErrorKind::WebSocket => "websocket",
        }
    }

    /// Whether this kind counts toward the channel recovery track
    pub fn is_channel(&self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::WebSocket)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the streaming core
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error("audio device did not open within {0:?}")]
    DeviceTimeout(Duration),

    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("resampler error: {0}")]
    Resample(String),

    #[error("malformed audio payload: {0}")]
    Decode(String),

    #[error("{kind} channel error: {message}")]
    Channel { kind: ErrorKind, message: String },

    #[error("channel closed abnormally (code {code})")]
    AbnormalClose { code: u16 },

    #[error("session create failed: {0}")]
    SessionCreate(String),

    #[error("reconnect abandoned after {attempts} attempts")]
    RecoveryExhausted { attempts: u32 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    pub fn network(message: impl Into<String>) -> Self {
        VoiceError::Channel {
            kind: ErrorKind::Network,
            message: message.into(),
        }
    }

    pub fn websocket(message: impl Into<String>) -> Self {
        VoiceError::Channel {
            kind: ErrorKind::WebSocket,
            message: message.into(),
        }
    }

    /// Classification used when the error is escalated to the resilience engine
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            VoiceError::Channel { kind, .. } => Some(*kind),
            VoiceError::AbnormalClose { .. } => Some(ErrorKind::WebSocket),
            VoiceError::DeviceUnavailable(_) | VoiceError::DeviceTimeout(_) => {
                Some(ErrorKind::AudioContext)
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, VoiceError>;
