// Integration tests for the resilience engine
//
// These tests walk the engine through the failure sequences a session sees:
// abnormal closes, bursts of channel errors, failed reconnects and audio
// device trouble.

use std::time::Duration;

use tokio::time::Instant;
use voice_duplex::config::ResilienceConfig;
use voice_duplex::resilience::RecoveryState;
use voice_duplex::{ErrorKind, RecoveryAction, ResilienceEngine};

fn engine() -> ResilienceEngine {
    ResilienceEngine::new(ResilienceConfig::default())
}

#[test]
fn test_abnormal_close_schedules_reconnect_then_backs_off() {
    let mut engine = engine();
    let now = Instant::now();

    let first = engine.on_close(1006, true, now);
    assert_eq!(
        first,
        Some(RecoveryAction::Reconnect {
            attempt: 1,
            delay: Duration::from_millis(1000),
        })
    );

    let second = engine.reconnect_failed(now + Duration::from_secs(1));
    assert_eq!(
        second,
        RecoveryAction::Reconnect {
            attempt: 2,
            delay: Duration::from_millis(1500),
        }
    );
}

#[test]
fn test_close_ignored_when_not_running_or_normal() {
    let mut engine = engine();
    let now = Instant::now();

    assert_eq!(engine.on_close(1006, false, now), None);
    assert_eq!(engine.on_close(1000, true, now), None);
    assert_eq!(engine.channel_state(), RecoveryState::Idle);
}

#[test]
fn test_error_burst_starts_one_recovery() {
    let mut engine = engine();
    let start = Instant::now();

    let actions: Vec<_> = (0..3)
        .map(|i| {
            engine.record_error(
                ErrorKind::Network,
                "connection reset",
                start + Duration::from_secs(i * 4),
            )
        })
        .collect();

    assert_eq!(actions[0], None);
    assert_eq!(actions[1], None);
    assert!(matches!(
        actions[2],
        Some(RecoveryAction::Reconnect { attempt: 1, .. })
    ));

    // more errors during the recovery do not start another one
    let later = engine.record_error(ErrorKind::Network, "still down", start + Duration::from_secs(9));
    assert_eq!(later, None);
    assert_eq!(engine.attempts(), 1);
}

#[test]
fn test_backoff_is_monotonic_until_give_up() {
    let mut engine = engine();
    let now = Instant::now();

    let mut delays = Vec::new();
    let mut action = engine.on_close(1006, true, now);
    loop {
        match action {
            Some(RecoveryAction::Reconnect { delay, .. }) => {
                delays.push(delay);
                action = Some(engine.reconnect_failed(now));
            }
            Some(RecoveryAction::GiveUp { attempts }) => {
                assert_eq!(attempts, 5);
                break;
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    assert_eq!(delays.len(), 5);
    assert!(delays.windows(2).all(|w| w[0] < w[1]));
    assert!(engine.is_exhausted());

    // nothing more is scheduled once exhausted
    assert_eq!(engine.on_close(1006, true, now), None);
}

#[test]
fn test_successful_reconnect_resets_attempts() {
    let mut engine = engine();
    let now = Instant::now();

    engine.on_close(1006, true, now);
    engine.reconnect_failed(now);
    assert_eq!(engine.attempts(), 2);

    engine.reconnect_succeeded();
    assert_eq!(engine.attempts(), 0);
    assert_eq!(engine.channel_state(), RecoveryState::Idle);

    assert_eq!(
        engine.on_close(1006, true, now + Duration::from_secs(5)),
        Some(RecoveryAction::Reconnect {
            attempt: 1,
            delay: Duration::from_millis(1000),
        })
    );
}

#[test]
fn test_audio_errors_trigger_device_recovery_once() {
    let mut engine = engine();
    let now = Instant::now();

    assert_eq!(
        engine.record_error(ErrorKind::AudioContext, "play failed", now),
        None
    );
    assert_eq!(
        engine.record_error(ErrorKind::AudioContext, "play failed", now),
        Some(RecoveryAction::RecoverAudioDevice)
    );
    assert_eq!(engine.audio_state(), RecoveryState::InProgress);
    assert_eq!(
        engine.record_error(ErrorKind::AudioContext, "play failed", now),
        None
    );

    engine.audio_recovery_finished(true);
    assert_eq!(engine.audio_state(), RecoveryState::Idle);

    // errors from before the recovery no longer count
    assert_eq!(
        engine.record_error(ErrorKind::AudioContext, "play failed", now),
        None
    );
}

#[test]
fn test_errors_outside_window_do_not_count() {
    let mut engine = ResilienceEngine::new(ResilienceConfig {
        window_secs: 10,
        ..ResilienceConfig::default()
    });
    let start = Instant::now();

    engine.record_error(ErrorKind::WebSocket, "bad frame", start);
    engine.record_error(ErrorKind::WebSocket, "bad frame", start);
    let action = engine.record_error(
        ErrorKind::WebSocket,
        "bad frame",
        start + Duration::from_secs(30),
    );
    assert_eq!(action, None);
}
