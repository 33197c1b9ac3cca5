use std::sync::Arc;

use tokio::sync::Mutex;

use crate::audio::{AudioBackendFactory, AudioSink, AudioSource};
use crate::config::Config;
use crate::error::Result;
use crate::session::{HttpSessionApi, SessionApi, SessionDeps, VoiceSession};

/// Builds voice sessions for the control API
#[async_trait::async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(&self, config: &Config, character: &str) -> Result<VoiceSession>;

    async fn characters(&self) -> Result<Vec<String>>;
}

/// Launches sessions against the configured service with the given audio
/// endpoints
pub struct DefaultLauncher {
    api: Arc<HttpSessionApi>,
    source: AudioSource,
    sink: AudioSink,
}

impl DefaultLauncher {
    pub fn new(config: &Config, source: AudioSource, sink: AudioSink) -> Result<Self> {
        Ok(Self {
            api: Arc::new(HttpSessionApi::new(&config.session.base_url)?),
            source,
            sink,
        })
    }
}

#[async_trait::async_trait]
impl SessionLauncher for DefaultLauncher {
    async fn launch(&self, config: &Config, character: &str) -> Result<VoiceSession> {
        let deps = SessionDeps {
            api: self.api.clone(),
            capture: AudioBackendFactory::capture(&self.source)?,
            output: AudioBackendFactory::output(&self.sink, config.playback.output_sample_rate)?,
        };
        VoiceSession::start(config, character, deps).await
    }

    async fn characters(&self) -> Result<Vec<String>> {
        self.api.characters().await
    }
}

/// The one voice session this process may run
pub enum SessionSlot {
    Idle,
    /// A launch is in flight
    Starting { character: String },
    Running(VoiceSession),
}

impl SessionSlot {
    /// Take the running session, leaving the slot idle
    pub fn take_running(&mut self) -> Option<VoiceSession> {
        match std::mem::replace(self, SessionSlot::Idle) {
            SessionSlot::Running(session) => Some(session),
            other => {
                *self = other;
                None
            }
        }
    }
}

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub launcher: Arc<dyn SessionLauncher>,
    pub active: Arc<Mutex<SessionSlot>>,
}

impl AppState {
    pub fn new(config: Config, launcher: Arc<dyn SessionLauncher>) -> Self {
        Self {
            config: Arc::new(config),
            launcher,
            active: Arc::new(Mutex::new(SessionSlot::Idle)),
        }
    }
}
