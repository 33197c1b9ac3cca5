use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment prefix, e.g. `VOICE_DUPLEX__SESSION__BASE_URL`
pub const ENV_PREFIX: &str = "VOICE_DUPLEX";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub session: SessionApiConfig,
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
    pub dsp: DspConfig,
    pub transport: TransportConfig,
    pub resilience: ResilienceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "voice-duplex".to_string(),
            http: HttpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8088,
        }
    }
}

/// Where the session-lifecycle service lives and who to talk to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionApiConfig {
    /// Base URL of the session service; its scheme decides ws vs wss
    pub base_url: String,
    /// Character / voice profile selector
    pub character: String,
}

impl Default for SessionApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5000".to_string(),
            character: "Miles".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Capture sample rate in Hz
    pub sample_rate: u32,
    /// Samples per outbound frame
    pub frame_size: usize,
    /// Preferred input device; falls back to the default device
    pub device_id: Option<String>,
    pub open_timeout_ms: u64,
    /// RMS energy above which a frame counts as voice
    pub vad_threshold: f32,
    /// Silent frames still sent after speech stops
    pub silence_limit: u32,
    /// During long silence, send one frame every this many
    pub keepalive_every: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_size: 1024,
            device_id: None,
            open_timeout_ms: 10_000,
            vad_threshold: 0.01,
            silence_limit: 20,
            keepalive_every: 10,
        }
    }
}

impl CaptureConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Jitter buffer bound in chunks; oldest chunks are evicted past it
    pub max_queue: usize,
    /// Minimum time between two chunk playback starts
    pub min_gap_ms: u64,
    /// Delay before retrying a drain after the device was not running
    pub device_retry_ms: u64,
    /// Pause after a chunk that failed to decode or play
    pub decode_cooldown_ms: u64,
    /// Rate assumed when an inbound chunk does not declare one
    pub output_sample_rate: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            max_queue: 32,
            min_gap_ms: 10,
            device_retry_ms: 100,
            decode_cooldown_ms: 50,
            output_sample_rate: 24000,
        }
    }
}

impl PlaybackConfig {
    pub fn min_gap(&self) -> Duration {
        Duration::from_millis(self.min_gap_ms)
    }

    pub fn device_retry(&self) -> Duration {
        Duration::from_millis(self.device_retry_ms)
    }

    pub fn decode_cooldown(&self) -> Duration {
        Duration::from_millis(self.decode_cooldown_ms)
    }
}

/// Enhancement chain applied to chunks flagged `preserveQuality`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DspConfig {
    pub enabled: bool,
    pub highpass_hz: f32,
    pub presence: PeakingBand,
    pub clarity: Option<PeakingBand>,
    pub lowpass_hz: f32,
    pub compressor: CompressorConfig,
    /// Linear output gain
    pub gain: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PeakingBand {
    pub frequency_hz: f32,
    pub gain_db: f32,
    pub q: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressorConfig {
    pub threshold_db: f32,
    pub knee_db: f32,
    pub ratio: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            threshold_db: -24.0,
            knee_db: 12.0,
            ratio: 4.0,
            attack_ms: 3.0,
            release_ms: 250.0,
        }
    }
}

impl Default for DspConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            highpass_hz: 80.0,
            presence: PeakingBand {
                frequency_hz: 2500.0,
                gain_db: 3.0,
                q: 1.0,
            },
            clarity: Some(PeakingBand {
                frequency_hz: 5000.0,
                gain_db: 2.0,
                q: 1.0,
            }),
            lowpass_hz: 10_000.0,
            compressor: CompressorConfig::default(),
            gain: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub keepalive_interval_ms: u64,
    /// Outbound messages buffered for the socket writer before sends are dropped
    pub outbound_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: 15_000,
            outbound_buffer: 16,
        }
    }
}

impl TransportConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Sliding window for error pattern detection
    pub window_secs: u64,
    /// Error history bound
    pub history_size: usize,
    pub audio_error_threshold: usize,
    pub channel_error_threshold: usize,
    pub reconnect_base_ms: u64,
    pub backoff_factor: f64,
    pub max_reconnect_attempts: u32,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            history_size: 10,
            audio_error_threshold: 2,
            channel_error_threshold: 3,
            reconnect_base_ms: 1000,
            backoff_factor: 1.5,
            max_reconnect_attempts: 5,
        }
    }
}

impl ResilienceConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }
}

impl Config {
    /// Load defaults, then `path` (if present), then environment overrides
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path))?;

        let cfg: Config = settings
            .try_deserialize()
            .context("Failed to parse configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capture.frame_size == 0 {
            anyhow::bail!("capture.frame_size must be greater than 0");
        }
        if self.capture.sample_rate == 0 || self.playback.output_sample_rate == 0 {
            anyhow::bail!("sample rates must be greater than 0");
        }
        if self.capture.keepalive_every == 0 {
            anyhow::bail!("capture.keepalive_every must be greater than 0");
        }
        if self.playback.max_queue == 0 {
            anyhow::bail!("playback.max_queue must be greater than 0");
        }
        if self.resilience.backoff_factor < 1.0 {
            anyhow::bail!("resilience.backoff_factor must be at least 1.0");
        }
        Ok(())
    }
}
