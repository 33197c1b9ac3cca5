use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resilience::RecoveryState;
use crate::transport::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Active,
    Closing,
    Closed,
}

/// Live view of a voice session, published on a watch channel for the UI
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub character: String,
    pub lifecycle: LifecycleState,
    pub connection: ConnectionState,
    /// Last `status` reported by the service
    pub server_status: Option<String>,
    /// Last `connectionStatus` reported by the service
    pub server_connection_status: Option<String>,
    pub recovery: RecoveryState,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    pub frames_sent: u64,
    pub chunks_played: u64,
    pub chunks_evicted: u64,
}

impl SessionStatus {
    pub fn new(session_id: &str, character: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            character: character.to_string(),
            lifecycle: LifecycleState::Created,
            connection: ConnectionState::Idle,
            server_status: None,
            server_connection_status: None,
            recovery: RecoveryState::Idle,
            reconnect_attempts: 0,
            last_error: None,
            frames_sent: 0,
            chunks_played: 0,
            chunks_evicted: 0,
        }
    }
}

/// Statistics about a voice session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: String,

    /// Whether the session is still running
    pub is_active: bool,

    /// When the session started
    pub started_at: DateTime<Utc>,

    /// Total duration in seconds
    pub duration_secs: f64,

    /// Frames captured from the microphone
    pub frames_captured: u64,

    /// Frames handed to the channel
    pub frames_sent: u64,

    pub chunks_played: u64,
    pub chunks_evicted: u64,
    pub chunks_skipped: u64,

    /// Error that ended the session, if any
    pub terminal_error: Option<String>,
}
