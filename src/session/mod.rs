//! Voice session management
//!
//! This module provides the `VoiceSession` abstraction that manages:
//! - Server-side session create/destroy through `SessionApi`
//! - Microphone capture, gating and encoding toward the channel
//! - Playback of synthesized speech through the jitter buffer
//! - Channel failures and device failures through the resilience engine
//! - Status snapshots and final statistics

mod lifecycle;
mod session;
mod stats;

pub use lifecycle::{channel_url, HttpSessionApi, SessionApi, SessionInfo, KNOWN_CHARACTERS};
pub use session::{SessionDeps, VoiceSession};
pub use stats::{LifecycleState, SessionStats, SessionStatus};
