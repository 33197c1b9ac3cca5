//! Failure classification and recovery policy
//!
//! Errors are tagged with an [`ErrorKind`](crate::error::ErrorKind) where they
//! are detected and fed into [`ResilienceEngine`], which decides when to
//! restart the output device and when (and how soon) to reopen the channel.

mod engine;
mod history;

pub use engine::{RecoveryAction, RecoveryState, ResilienceEngine};
pub use history::{ErrorHistory, ErrorRecord};
