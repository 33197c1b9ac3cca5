pub mod audio;
pub mod config;
pub mod error;
pub mod http;
pub mod resilience;
pub mod session;
pub mod transport;

pub use audio::{
    AudioBackendFactory, AudioFile, AudioFrame, AudioSink, AudioSource, CaptureDevice,
    CapturePipeline, CaptureProvider, DeviceState, LevelSnapshot, OutputDevice, PlaybackHandle,
    VoiceGate,
};
pub use config::Config;
pub use error::{ErrorKind, VoiceError};
pub use http::{create_router, AppState};
pub use resilience::{RecoveryAction, ResilienceEngine};
pub use session::{
    HttpSessionApi, SessionApi, SessionDeps, SessionInfo, SessionStats, SessionStatus,
    VoiceSession,
};
pub use transport::{ClientMessage, ConnectionState, ServerMessage, Transport};
