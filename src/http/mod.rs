//! HTTP API server for local control
//!
//! This module provides a REST API for driving a voice session:
//! - POST /voice/start - Start a session with a character
//! - POST /voice/stop - Stop the active session
//! - GET /voice/status - Status snapshot of the active session
//! - GET /characters - Available characters
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;

pub use routes::create_router;
pub use state::{AppState, DefaultLauncher, SessionLauncher, SessionSlot};
