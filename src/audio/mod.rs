pub mod backend;
pub mod capture;
pub mod codec;
pub mod dsp;
pub mod file;
pub mod gate;
pub mod playback;
pub mod resample;

#[cfg(feature = "device")]
pub mod device;

pub use backend::{
    AudioBackendFactory, AudioFrame, AudioSink, AudioSource, CaptureDevice, CaptureFormat,
    CaptureProvider, DeviceState, OutputDevice,
};
pub use capture::{open_capture, CaptureEvent, CapturePipeline, FrameSink, LevelSnapshot};
pub use file::{AudioFile, WavCapture, WavCaptureProvider, WavOutput};
pub use gate::{GateDecision, VoiceGate};
pub use playback::{PlaybackEvent, PlaybackHandle, PlaybackScheduler};
pub use resample::StreamResampler;
