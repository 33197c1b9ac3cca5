use crate::config::CaptureConfig;

use super::codec::rms;

/// Result of gating one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateDecision {
    /// RMS energy of the frame
    pub level: f32,
    /// Whether the frame counted as voice
    pub voiced: bool,
    /// Whether the frame should go out on the channel
    pub transmit: bool,
}

/// Energy-threshold voice activity gate.
///
/// Sends everything while speech is ongoing and for `silence_limit` frames
/// after it stops, then only every `keepalive_every`-th silent frame so the
/// remote side still sees a live microphone.
#[derive(Debug, Clone)]
pub struct VoiceGate {
    threshold: f32,
    silence_limit: u32,
    keepalive_every: u32,
    silent_frames: u32,
}

impl VoiceGate {
    pub fn new(threshold: f32, silence_limit: u32, keepalive_every: u32) -> Self {
        Self {
            threshold,
            silence_limit,
            keepalive_every: keepalive_every.max(1),
            silent_frames: 0,
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::new(
            config.vad_threshold,
            config.silence_limit,
            config.keepalive_every,
        )
    }

    pub fn process(&mut self, frame: &[f32]) -> GateDecision {
        let level = rms(frame);
        let voiced = level > self.threshold;

        if voiced {
            self.silent_frames = 0;
        } else {
            self.silent_frames += 1;
            // past the hangover window only the keepalive phase matters
            let wrap_at = self.silence_limit.saturating_add(self.keepalive_every);
            if self.silent_frames >= wrap_at {
                self.silent_frames -= self.keepalive_every;
            }
        }

        let transmit = self.silent_frames < self.silence_limit
            || self.silent_frames % self.keepalive_every == 0;

        GateDecision {
            level,
            voiced,
            transmit,
        }
    }

    /// Consecutive silent frames seen so far; wraps within the keepalive
    /// cycle once past the hangover window
    pub fn silent_frames(&self) -> u32 {
        self.silent_frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voiced() -> Vec<f32> {
        vec![0.3; 256]
    }

    fn silent() -> Vec<f32> {
        vec![0.0; 256]
    }

    #[test]
    fn test_voiced_frames_always_transmit() {
        let mut gate = VoiceGate::new(0.01, 20, 10);
        for _ in 0..100 {
            let d = gate.process(&voiced());
            assert!(d.voiced);
            assert!(d.transmit);
        }
        assert_eq!(gate.silent_frames(), 0);
    }

    #[test]
    fn test_silence_hangover_then_keepalive() {
        let mut gate = VoiceGate::new(0.01, 20, 10);
        gate.process(&voiced());

        let sent: Vec<bool> = (0..60).map(|_| gate.process(&silent()).transmit).collect();

        // counters 1..=19 are inside the hangover window
        assert!(sent[..19].iter().all(|&s| s));
        // counter 20, 30, 40, 50, 60 are keepalives
        for (i, &s) in sent.iter().enumerate().skip(19) {
            let counter = i as u32 + 1;
            assert_eq!(s, counter % 10 == 0, "counter {}", counter);
        }
    }

    #[test]
    fn test_long_silence_converges_to_one_in_ten() {
        let mut gate = VoiceGate::new(0.01, 20, 10);
        // skip past the hangover window
        for _ in 0..19 {
            gate.process(&silent());
        }
        let n = 10_000;
        let sent = (0..n).filter(|_| gate.process(&silent()).transmit).count();
        assert_eq!(sent, n / 10);
    }

    #[test]
    fn test_voice_resets_silence_counter() {
        let mut gate = VoiceGate::new(0.01, 5, 10);
        for _ in 0..7 {
            gate.process(&silent());
        }
        assert!(!gate.process(&silent()).transmit); // counter 8
        assert!(gate.process(&voiced()).transmit);
        assert_eq!(gate.silent_frames(), 0);
        assert!(gate.process(&silent()).transmit);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let mut gate = VoiceGate::new(0.5, 0, 10);
        let d = gate.process(&[0.5; 16]);
        assert!(!d.voiced);
        assert!((d.level - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_keepalive_survives_endless_silence() {
        let mut gate = VoiceGate::new(0.01, 20, 10);
        for _ in 0..19 {
            gate.process(&silent());
        }

        let n = 100_000;
        let sent = (0..n).filter(|_| gate.process(&silent()).transmit).count();

        assert_eq!(sent, n / 10);
        assert!(gate.silent_frames() < 30);
    }
}
