use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::error::Result;

/// A block of captured audio (mono, f32 normalized to -1.0..1.0)
///
/// Devices deliver blocks of whatever size their callback produces; the
/// capture pipeline re-frames them to a fixed sample count.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Milliseconds since capture started
    pub timestamp_ms: u64,
}

/// Format a capture device is asked to deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub sample_rate: u32,
    /// Preferred block size in samples (devices may deliver other sizes)
    pub block_size: usize,
}

/// Microphone-like input.
///
/// Implementations:
/// - `WavCapture`: paces a WAV file at real time, then delivers silence
/// - `CpalCapture` (feature `device`): system input device
#[async_trait::async_trait]
pub trait CaptureDevice: Send {
    /// Start capturing; blocks arrive on the returned receiver
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>>;

    async fn stop(&mut self) -> Result<()>;

    fn is_capturing(&self) -> bool;

    fn name(&self) -> &str;
}

/// Opens capture devices by id
#[async_trait::async_trait]
pub trait CaptureProvider: Send + Sync {
    /// Open `device_id`, or any available device when `None`
    async fn open(
        &self,
        device_id: Option<&str>,
        format: CaptureFormat,
    ) -> Result<Box<dyn CaptureDevice>>;
}

/// Output device state as seen by the playback scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Running,
    Suspended,
    Closed,
}

/// Speaker-like output that plays one buffer at a time.
#[async_trait::async_trait]
pub trait OutputDevice: Send {
    fn state(&self) -> DeviceState;

    fn sample_rate(&self) -> u32;

    /// Resume a suspended device in place
    async fn resume(&mut self) -> Result<()>;

    /// Tear the device down and build a new one at `sample_rate`
    async fn recreate(&mut self, sample_rate: u32) -> Result<()>;

    /// Start playing `samples`; the receiver resolves when playback finishes
    fn play(&mut self, samples: Vec<f32>) -> Result<oneshot::Receiver<()>>;

    async fn close(&mut self) -> Result<()>;

    fn name(&self) -> &str;
}

/// Where captured audio comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioSource {
    /// System input device (requires the `device` feature)
    Device,
    /// WAV file played at real time
    File(PathBuf),
}

/// Where played audio goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioSink {
    /// System output device, optionally by name (requires the `device` feature)
    Device(Option<String>),
    /// WAV file recording of everything played
    File(PathBuf),
}

/// Audio backend factory
pub struct AudioBackendFactory;

impl AudioBackendFactory {
    pub fn capture(source: &AudioSource) -> Result<Arc<dyn CaptureProvider>> {
        match source {
            AudioSource::File(path) => Ok(Arc::new(super::file::WavCaptureProvider::new(
                path.clone(),
            ))),

            AudioSource::Device => {
                #[cfg(feature = "device")]
                {
                    Ok(Arc::new(super::device::CpalCaptureProvider))
                }

                #[cfg(not(feature = "device"))]
                {
                    Err(crate::error::VoiceError::DeviceUnavailable(
                        "built without the `device` feature; use a WAV input".to_string(),
                    ))
                }
            }
        }
    }

    pub fn output(sink: &AudioSink, sample_rate: u32) -> Result<Box<dyn OutputDevice>> {
        match sink {
            AudioSink::File(path) => Ok(Box::new(super::file::WavOutput::create(
                path.clone(),
                sample_rate,
            )?)),

            AudioSink::Device(name) => {
                #[cfg(feature = "device")]
                {
                    let device = super::device::CpalOutput::open(name.clone(), sample_rate)?;
                    Ok(Box::new(device))
                }

                #[cfg(not(feature = "device"))]
                {
                    let _ = name;
                    Err(crate::error::VoiceError::DeviceUnavailable(
                        "built without the `device` feature; use a WAV output".to_string(),
                    ))
                }
            }
        }
    }
}
