use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use super::history::ErrorHistory;
use crate::config::ResilienceConfig;
use crate::error::ErrorKind;
use crate::transport::NORMAL_CLOSURE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    Idle,
    InProgress,
}

/// What the session should do in response to a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Resume the output device, recreating it if needed
    RecoverAudioDevice,
    /// Reopen the channel after `delay`
    Reconnect { attempt: u32, delay: Duration },
    /// Attempts exhausted; the session must stop
    GiveUp { attempts: u32 },
}

/// Single policy object for every recovery decision.
///
/// Two independent tracks: audio-device recovery and channel recovery. Each
/// is serialized (no new recovery while one is in progress) and only counts
/// errors recorded since its own last trigger.
#[derive(Debug)]
pub struct ResilienceEngine {
    config: ResilienceConfig,
    history: ErrorHistory,
    audio: RecoveryState,
    channel: RecoveryState,
    attempts: u32,
    audio_mark: Option<u64>,
    channel_mark: Option<u64>,
    exhausted: bool,
}

impl ResilienceEngine {
    pub fn new(config: ResilienceConfig) -> Self {
        let history = ErrorHistory::new(config.history_size, config.window());
        Self {
            config,
            history,
            audio: RecoveryState::Idle,
            channel: RecoveryState::Idle,
            attempts: 0,
            audio_mark: None,
            channel_mark: None,
            exhausted: false,
        }
    }

    /// Record a classified error; returns an action if it completes a pattern
    pub fn record_error(
        &mut self,
        kind: ErrorKind,
        message: impl Into<String>,
        now: Instant,
    ) -> Option<RecoveryAction> {
        let message = message.into();
        warn!("{} error: {}", kind, message);
        self.history.record(kind, message, now);

        match kind {
            ErrorKind::AudioContext => {
                if self.audio == RecoveryState::InProgress {
                    return None;
                }
                let count = self.history.count_recent(now, self.audio_mark, |k| {
                    k == ErrorKind::AudioContext
                });
                if count >= self.config.audio_error_threshold {
                    info!("{} audio errors in window, recovering output device", count);
                    self.audio = RecoveryState::InProgress;
                    self.audio_mark = self.history.last_seq();
                    return Some(RecoveryAction::RecoverAudioDevice);
                }
                None
            }
            ErrorKind::Network | ErrorKind::WebSocket => {
                if self.channel == RecoveryState::InProgress || self.exhausted {
                    return None;
                }
                let count = self
                    .history
                    .count_recent(now, self.channel_mark, |k| k.is_channel());
                if count >= self.config.channel_error_threshold {
                    info!("{} channel errors in window, reconnecting", count);
                    return Some(self.begin_channel_recovery());
                }
                None
            }
        }
    }

    /// The channel closed with `code`; `running` says whether the session
    /// still intends to run
    pub fn on_close(&mut self, code: u16, running: bool, now: Instant) -> Option<RecoveryAction> {
        if !running || code == NORMAL_CLOSURE {
            return None;
        }
        self.history
            .record(ErrorKind::WebSocket, format!("abnormal close {}", code), now);

        if self.channel == RecoveryState::InProgress || self.exhausted {
            return None;
        }
        info!("Channel closed abnormally (code {}), reconnecting", code);
        Some(self.begin_channel_recovery())
    }

    /// A reconnect attempt failed: schedule the next one or give up
    pub fn reconnect_failed(&mut self, now: Instant) -> RecoveryAction {
        self.history
            .record(ErrorKind::Network, "reconnect attempt failed", now);
        self.channel = RecoveryState::InProgress;
        self.next_attempt()
    }

    pub fn reconnect_succeeded(&mut self) {
        info!("Reconnected after {} attempt(s)", self.attempts);
        self.attempts = 0;
        self.channel = RecoveryState::Idle;
        self.channel_mark = self.history.last_seq();
    }

    pub fn audio_recovery_finished(&mut self, ok: bool) {
        if ok {
            info!("Output device recovered");
        } else {
            warn!("Output device recovery failed");
        }
        self.audio = RecoveryState::Idle;
        self.audio_mark = self.history.last_seq();
    }

    /// `base * factor^attempt`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = self.config.backoff_factor.powi(attempt as i32);
        self.config.reconnect_base().mul_f64(factor)
    }

    fn begin_channel_recovery(&mut self) -> RecoveryAction {
        self.channel = RecoveryState::InProgress;
        self.channel_mark = self.history.last_seq();
        self.next_attempt()
    }

    fn next_attempt(&mut self) -> RecoveryAction {
        if self.attempts >= self.config.max_reconnect_attempts {
            warn!("Giving up after {} reconnect attempts", self.attempts);
            self.exhausted = true;
            self.channel = RecoveryState::Idle;
            return RecoveryAction::GiveUp {
                attempts: self.attempts,
            };
        }
        let delay = self.backoff_delay(self.attempts);
        self.attempts += 1;
        info!(
            "Reconnect attempt {} of {} in {:?}",
            self.attempts, self.config.max_reconnect_attempts, delay
        );
        RecoveryAction::Reconnect {
            attempt: self.attempts,
            delay,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn channel_state(&self) -> RecoveryState {
        self.channel
    }

    pub fn audio_state(&self) -> RecoveryState {
        self.audio
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn history(&self) -> &ErrorHistory {
        &self.history
    }
}
