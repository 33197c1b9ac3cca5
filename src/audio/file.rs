use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hound::{SampleFormat, WavReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::backend::{
    AudioFrame, CaptureDevice, CaptureFormat, CaptureProvider, DeviceState, OutputDevice,
};
use super::codec::{downmix_to_mono, sample_to_i16};
use super::resample::StreamResampler;
use crate::error::{Result, VoiceError};

/// A WAV file decoded to normalized f32 samples (interleaved)
pub struct AudioFile {
    pub path: String,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl AudioFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening audio file: {}", path.display());

        let reader = WavReader::open(path).map_err(|e| {
            VoiceError::DeviceUnavailable(format!("failed to open {}: {}", path.display(), e))
        })?;

        let spec = reader.spec();
        let samples: Vec<f32> = match spec.sample_format {
            SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<std::result::Result<Vec<_>, _>>(),
            SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<std::result::Result<Vec<_>, _>>()
            }
        }
        .map_err(|e| VoiceError::Decode(format!("failed to read samples: {}", e)))?;

        let duration_seconds =
            samples.len() as f64 / (spec.sample_rate as f64 * spec.channels.max(1) as f64);

        info!(
            "Audio file loaded: {:.1}s, {}Hz, {} channels, {} samples",
            duration_seconds,
            spec.sample_rate,
            spec.channels,
            samples.len()
        );

        Ok(Self {
            path: path.display().to_string(),
            duration_seconds,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            samples,
        })
    }

    /// Mono samples at `sample_rate`
    pub fn to_mono(&self, sample_rate: u32) -> Result<Vec<f32>> {
        let mono = downmix_to_mono(&self.samples, self.channels);
        if self.sample_rate != sample_rate {
            debug!(
                "Resampling {} from {}Hz to {}Hz",
                self.path, self.sample_rate, sample_rate
            );
        }
        StreamResampler::convert(&mono, self.sample_rate, sample_rate)
    }
}

/// Opens a WAV file as a capture device
pub struct WavCaptureProvider {
    path: PathBuf,
}

impl WavCaptureProvider {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait::async_trait]
impl CaptureProvider for WavCaptureProvider {
    async fn open(
        &self,
        device_id: Option<&str>,
        format: CaptureFormat,
    ) -> Result<Box<dyn CaptureDevice>> {
        if let Some(id) = device_id {
            debug!("WAV capture ignores device id {}", id);
        }
        let path = self.path.clone();
        let file = tokio::task::spawn_blocking(move || AudioFile::open(path))
            .await
            .map_err(|e| VoiceError::DeviceUnavailable(format!("open task failed: {}", e)))??;

        Ok(Box::new(WavCapture::new(&file, format)?))
    }
}

/// Plays a WAV file into the capture pipeline at real-time pace.
///
/// After the file is exhausted it keeps delivering silent blocks, like a
/// live microphone in a quiet room.
pub struct WavCapture {
    name: String,
    samples: Arc<Vec<f32>>,
    format: CaptureFormat,
    capturing: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl WavCapture {
    pub fn new(file: &AudioFile, format: CaptureFormat) -> Result<Self> {
        Ok(Self {
            name: format!("WAV {}", file.path),
            samples: Arc::new(file.to_mono(format.sample_rate)?),
            format,
            capturing: Arc::new(AtomicBool::new(false)),
            task: None,
        })
    }

    pub fn from_samples(name: &str, samples: Vec<f32>, format: CaptureFormat) -> Self {
        Self {
            name: name.to_string(),
            samples: Arc::new(samples),
            format,
            capturing: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }
}

#[async_trait::async_trait]
impl CaptureDevice for WavCapture {
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>> {
        if self.capturing.load(Ordering::SeqCst) {
            return Err(VoiceError::DeviceUnavailable("already capturing".to_string()));
        }

        let block = self.format.block_size.max(1);
        let sample_rate = self.format.sample_rate.max(1);
        let period = Duration::from_secs_f64(block as f64 / sample_rate as f64);

        let (tx, rx) = mpsc::channel(64);
        let samples = Arc::clone(&self.samples);
        let capturing = Arc::clone(&self.capturing);
        capturing.store(true, Ordering::SeqCst);

        info!("Starting {} ({} samples per block)", self.name, block);

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut pos = 0usize;
            let mut blocks = 0u64;

            loop {
                ticker.tick().await;
                if !capturing.load(Ordering::SeqCst) {
                    break;
                }

                let mut block_samples = if pos < samples.len() {
                    let end = (pos + block).min(samples.len());
                    let chunk = samples[pos..end].to_vec();
                    pos = end;
                    chunk
                } else {
                    Vec::with_capacity(block)
                };
                block_samples.resize(block, 0.0);

                let frame = AudioFrame {
                    samples: block_samples,
                    sample_rate,
                    timestamp_ms: blocks * block as u64 * 1000 / sample_rate as u64,
                };
                if tx.send(frame).await.is_err() {
                    break;
                }
                blocks += 1;
            }

            debug!("WAV capture task stopped after {} blocks", blocks);
        }));

        Ok(rx)
    }

    async fn stop(&mut self) -> Result<()> {
        if !self.capturing.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        info!("{} stopped", self.name);
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Records everything played into a WAV file.
///
/// Completion fires after the buffer's real duration so pacing behaves like
/// a sound card. Recreating at a new rate starts a new numbered file.
pub struct WavOutput {
    base_path: PathBuf,
    path: PathBuf,
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    sample_rate: u32,
    state: DeviceState,
    segment: u32,
}

impl WavOutput {
    pub fn create(path: PathBuf, sample_rate: u32) -> Result<Self> {
        let writer = open_writer(&path, sample_rate)?;
        info!("WAV output {} ({}Hz)", path.display(), sample_rate);

        Ok(Self {
            base_path: path.clone(),
            path,
            writer: Some(writer),
            sample_rate,
            state: DeviceState::Running,
            segment: 0,
        })
    }

    /// Current file being written
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Simulate the host suspending the device
    pub fn suspend(&mut self) {
        if self.state == DeviceState::Running {
            self.state = DeviceState::Suspended;
        }
    }

    fn finalize(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer
                .finalize()
                .map_err(|e| VoiceError::DeviceUnavailable(format!("finalize failed: {}", e)))?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl OutputDevice for WavOutput {
    fn state(&self) -> DeviceState {
        self.state
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn resume(&mut self) -> Result<()> {
        match self.state {
            DeviceState::Closed => Err(VoiceError::DeviceUnavailable(
                "output closed; recreate required".to_string(),
            )),
            _ => {
                self.state = DeviceState::Running;
                Ok(())
            }
        }
    }

    async fn recreate(&mut self, sample_rate: u32) -> Result<()> {
        if let Err(e) = self.finalize() {
            warn!("Failed to finalize {}: {}", self.path.display(), e);
        }

        self.segment += 1;
        let stem = self
            .base_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        let path = self
            .base_path
            .with_file_name(format!("{}-{}.wav", stem, self.segment));

        self.writer = Some(open_writer(&path, sample_rate)?);
        info!("WAV output recreated: {} ({}Hz)", path.display(), sample_rate);
        self.path = path;
        self.sample_rate = sample_rate;
        self.state = DeviceState::Running;
        Ok(())
    }

    fn play(&mut self, samples: Vec<f32>) -> Result<oneshot::Receiver<()>> {
        if self.state != DeviceState::Running {
            return Err(VoiceError::DeviceUnavailable(format!(
                "output is {:?}",
                self.state
            )));
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| VoiceError::DeviceUnavailable("no open writer".to_string()))?;

        for &sample in &samples {
            writer
                .write_sample(sample_to_i16(sample))
                .map_err(|e| VoiceError::DeviceUnavailable(format!("write failed: {}", e)))?;
        }

        let duration = Duration::from_secs_f64(samples.len() as f64 / self.sample_rate as f64);
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = tx.send(());
        });
        Ok(rx)
    }

    async fn close(&mut self) -> Result<()> {
        self.state = DeviceState::Closed;
        self.finalize()
    }

    fn name(&self) -> &str {
        "WAV output"
    }
}

impl Drop for WavOutput {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.finalize() {
                warn!("Failed to finalize WAV writer on drop: {}", e);
            }
        }
    }
}

fn open_writer(path: &Path, sample_rate: u32) -> Result<hound::WavWriter<BufWriter<File>>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    hound::WavWriter::create(path, spec).map_err(|e| {
        VoiceError::DeviceUnavailable(format!("failed to create {}: {}", path.display(), e))
    })
}
