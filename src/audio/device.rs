// System audio devices via cpal
//
// cpal streams are !Send, so each stream lives on its own thread and is
// driven through a small command channel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::backend::{
    AudioFrame, CaptureDevice, CaptureFormat, CaptureProvider, DeviceState, OutputDevice,
};
use super::resample::StreamResampler;
use crate::error::{Result, VoiceError};

const SUPPORTED_FORMATS: [SampleFormat; 3] = [SampleFormat::F32, SampleFormat::I16, SampleFormat::U16];

/// Capture channel depth in device blocks
const CAPTURE_QUEUE: usize = 64;

fn unavailable(message: impl Into<String>) -> VoiceError {
    VoiceError::DeviceUnavailable(message.into())
}

fn device_name(device: &Device) -> String {
    device
        .description()
        .map(|desc| desc.name().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn find_input_device(name: Option<&str>) -> Option<Device> {
    let host = cpal::default_host();
    match name {
        None | Some("") => host.default_input_device(),
        Some(name) => host
            .input_devices()
            .ok()?
            .find(|d| d.description().is_ok_and(|desc| desc.name() == name)),
    }
}

fn find_output_device(name: Option<&str>) -> Option<Device> {
    let host = cpal::default_host();
    match name {
        None | Some("") => host.default_output_device(),
        Some(name) => host
            .output_devices()
            .ok()?
            .find(|d| d.description().is_ok_and(|desc| desc.name() == name)),
    }
}

/// Stream parameters negotiated with a device
#[derive(Debug, Clone, Copy)]
struct Negotiated {
    channels: u16,
    sample_rate: u32,
    format: SampleFormat,
}

impl Negotiated {
    fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            channels: self.channels,
            sample_rate: self.sample_rate,
            buffer_size: cpal::BufferSize::Default,
        }
    }
}

/// Prefer mono, then stereo, at exactly `rate`; otherwise take the
/// device default and resample.
fn negotiate(
    ranges: Vec<cpal::SupportedStreamConfigRange>,
    default: Option<cpal::SupportedStreamConfig>,
    rate: u32,
) -> Option<Negotiated> {
    for channels in [1u16, 2] {
        let found = ranges.iter().find(|c| {
            c.channels() == channels
                && c.min_sample_rate() <= rate
                && c.max_sample_rate() >= rate
                && SUPPORTED_FORMATS.contains(&c.sample_format())
        });
        if let Some(cfg) = found {
            return Some(Negotiated {
                channels,
                sample_rate: rate,
                format: cfg.sample_format(),
            });
        }
    }

    default
        .filter(|d| SUPPORTED_FORMATS.contains(&d.sample_format()))
        .map(|d| Negotiated {
            channels: d.channels(),
            sample_rate: d.sample_rate(),
            format: d.sample_format(),
        })
}

// ============================================================================
// Capture
// ============================================================================

/// Opens system input devices by name
pub struct CpalCaptureProvider;

#[async_trait::async_trait]
impl CaptureProvider for CpalCaptureProvider {
    async fn open(
        &self,
        device_id: Option<&str>,
        format: CaptureFormat,
    ) -> Result<Box<dyn CaptureDevice>> {
        let wanted = device_id.map(str::to_string);
        let (name, negotiated) = tokio::task::spawn_blocking(move || {
            let device = find_input_device(wanted.as_deref()).ok_or_else(|| match &wanted {
                Some(id) => unavailable(format!("input device '{}' not found", id)),
                None => unavailable("no default input device"),
            })?;
            let ranges = device
                .supported_input_configs()
                .map_err(|e| unavailable(format!("failed to query input configs: {}", e)))?
                .collect();
            let negotiated = negotiate(ranges, device.default_input_config().ok(), format.sample_rate)
                .ok_or_else(|| unavailable("input device has no supported audio format"))?;
            Ok::<_, VoiceError>((device_name(&device), negotiated))
        })
        .await
        .map_err(|e| unavailable(format!("device lookup failed: {}", e)))??;

        info!(
            "Opened input device '{}' ({}Hz, {} channels, {:?})",
            name, negotiated.sample_rate, negotiated.channels, negotiated.format
        );

        Ok(Box::new(CpalCapture {
            name,
            format,
            negotiated,
            worker: None,
        }))
    }
}

enum CaptureCommand {
    Stop,
    /// The device went away; tear the stream down so the consumer sees EOF
    Lost(String),
}

struct CaptureWorker {
    stop_tx: std_mpsc::Sender<CaptureCommand>,
    thread: JoinHandle<()>,
}

/// System microphone
pub struct CpalCapture {
    name: String,
    format: CaptureFormat,
    negotiated: Negotiated,
    worker: Option<CaptureWorker>,
}

fn build_input_stream<T>(
    device: &Device,
    negotiated: Negotiated,
    mut resampler: StreamResampler,
    tx: mpsc::Sender<AudioFrame>,
    commands: std_mpsc::Sender<CaptureCommand>,
) -> std::result::Result<Stream, cpal::BuildStreamError>
where
    T: Sample + SizedSample,
    f32: FromSample<T>,
{
    let channels = negotiated.channels as usize;
    let target_rate = resampler.to_rate();
    let mut delivered: u64 = 0;

    device.build_input_stream(
        &negotiated.stream_config(),
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let mono: Vec<f32> = data
                .chunks(channels)
                .map(|frame| {
                    frame.iter().map(|s| f32::from_sample(*s)).sum::<f32>() / frame.len() as f32
                })
                .collect();
            let samples = match resampler.process(&mono) {
                Ok(samples) if !samples.is_empty() => samples,
                Ok(_) => return,
                Err(e) => {
                    warn!("Dropping capture block: {}", e);
                    return;
                }
            };

            let timestamp_ms = delivered * 1000 / target_rate as u64;
            delivered += samples.len() as u64;

            // Full queue means the consumer is behind; drop the block
            let _ = tx.try_send(AudioFrame {
                samples,
                sample_rate: target_rate,
                timestamp_ms,
            });
        },
        move |err| match err {
            cpal::StreamError::DeviceNotAvailable => {
                let _ = commands.send(CaptureCommand::Lost(err.to_string()));
            }
            other => warn!("Audio capture error: {}", other),
        },
        None,
    )
}

fn run_capture(
    name: String,
    negotiated: Negotiated,
    target_rate: u32,
    tx: mpsc::Sender<AudioFrame>,
    ready: std_mpsc::Sender<Result<()>>,
    commands: (std_mpsc::Sender<CaptureCommand>, std_mpsc::Receiver<CaptureCommand>),
) {
    let (command_tx, command_rx) = commands;
    let stream = find_input_device(Some(&name))
        .ok_or_else(|| unavailable(format!("input device '{}' disappeared", name)))
        .and_then(|device| {
            let resampler = StreamResampler::new(negotiated.sample_rate, target_rate)?;
            let lost = command_tx.clone();
            let built = match negotiated.format {
                SampleFormat::F32 => {
                    build_input_stream::<f32>(&device, negotiated, resampler, tx, lost)
                }
                SampleFormat::I16 => {
                    build_input_stream::<i16>(&device, negotiated, resampler, tx, lost)
                }
                SampleFormat::U16 => {
                    build_input_stream::<u16>(&device, negotiated, resampler, tx, lost)
                }
                other => return Err(unavailable(format!("unsupported sample format {:?}", other))),
            };
            built.map_err(|e| unavailable(format!("failed to build input stream: {}", e)))
        })
        .and_then(|stream| {
            stream
                .play()
                .map_err(|e| unavailable(format!("failed to start input stream: {}", e)))?;
            Ok(stream)
        });

    let stream = match stream {
        Ok(stream) => {
            let _ = ready.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    drop(command_tx);

    // Park until stopped, the device is lost, or the owner is dropped
    if let Ok(CaptureCommand::Lost(reason)) = command_rx.recv() {
        warn!("Input device '{}' lost: {}", name, reason);
    }
    drop(stream);
    debug!("Input stream for '{}' closed", name);
}

#[async_trait::async_trait]
impl CaptureDevice for CpalCapture {
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>> {
        if self.worker.is_some() {
            return Err(unavailable("already capturing"));
        }

        let (tx, rx) = mpsc::channel(CAPTURE_QUEUE);
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel();

        let name = self.name.clone();
        let negotiated = self.negotiated;
        let target_rate = self.format.sample_rate;
        let commands = (stop_tx.clone(), stop_rx);
        let thread = std::thread::Builder::new()
            .name("cpal-capture".to_string())
            .spawn(move || run_capture(name, negotiated, target_rate, tx, ready_tx, commands))?;

        let ready = tokio::task::spawn_blocking(move || ready_rx.recv())
            .await
            .map_err(|e| unavailable(format!("capture thread failed: {}", e)))?
            .map_err(|_| unavailable("capture thread exited during startup"))?;
        ready?;

        self.worker = Some(CaptureWorker { stop_tx, thread });
        info!("Capture started on '{}'", self.name);
        Ok(rx)
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(CaptureCommand::Stop);
            tokio::task::spawn_blocking(move || worker.thread.join())
                .await
                .map_err(|e| unavailable(format!("capture thread failed: {}", e)))?
                .map_err(|_| unavailable("capture thread panicked"))?;
            info!("Capture stopped on '{}'", self.name);
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.worker.is_some()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(CaptureCommand::Stop);
        }
    }
}

// ============================================================================
// Output
// ============================================================================

const STATE_RUNNING: u8 = 0;
const STATE_SUSPENDED: u8 = 1;
const STATE_CLOSED: u8 = 2;

struct Pending {
    samples: Vec<f32>,
    position: usize,
    done: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct OutputQueue {
    pending: VecDeque<Pending>,
}

impl OutputQueue {
    fn next_sample(&mut self) -> f32 {
        loop {
            let Some(front) = self.pending.front_mut() else {
                return 0.0;
            };
            if let Some(sample) = front.samples.get(front.position) {
                front.position += 1;
                return *sample;
            }
            if let Some(done) = front.done.take() {
                let _ = done.send(());
            }
            self.pending.pop_front();
        }
    }

    /// Fire completions for buffers that were fully consumed
    fn settle(&mut self) {
        while let Some(front) = self.pending.front_mut() {
            if front.position < front.samples.len() {
                break;
            }
            if let Some(done) = front.done.take() {
                let _ = done.send(());
            }
            self.pending.pop_front();
        }
    }
}

enum OutputCommand {
    Pause,
    Play,
    Shutdown,
}

struct OutputWorker {
    commands: std_mpsc::Sender<OutputCommand>,
    thread: JoinHandle<()>,
}

/// System speaker
pub struct CpalOutput {
    requested_name: Option<String>,
    name: String,
    sample_rate: u32,
    /// Playback rate -> device rate; keeps a short tail between chunks
    resampler: StreamResampler,
    queue: Arc<Mutex<OutputQueue>>,
    state: Arc<AtomicU8>,
    worker: Option<OutputWorker>,
}

fn build_output_stream<T>(
    device: &Device,
    negotiated: Negotiated,
    queue: Arc<Mutex<OutputQueue>>,
    state: Arc<AtomicU8>,
) -> std::result::Result<Stream, cpal::BuildStreamError>
where
    T: Sample + SizedSample + FromSample<f32>,
{
    let channels = negotiated.channels as usize;
    let errored = Arc::new(AtomicBool::new(false));

    device.build_output_stream(
        &negotiated.stream_config(),
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let Ok(mut queue) = queue.lock() else {
                for sample in data.iter_mut() {
                    *sample = T::from_sample(0.0f32);
                }
                return;
            };
            for frame in data.chunks_mut(channels) {
                let value = T::from_sample(queue.next_sample().clamp(-1.0, 1.0));
                for sample in frame.iter_mut() {
                    *sample = value;
                }
            }
            queue.settle();
        },
        move |err| {
            if !errored.swap(true, Ordering::SeqCst) {
                warn!("Audio output error: {}", err);
            }
            // Playback recovers by resuming or recreating the device
            let _ = state.compare_exchange(
                STATE_RUNNING,
                STATE_SUSPENDED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        },
        None,
    )
}

fn run_output(
    name: String,
    negotiated: Negotiated,
    queue: Arc<Mutex<OutputQueue>>,
    state: Arc<AtomicU8>,
    ready: std_mpsc::Sender<Result<()>>,
    commands: std_mpsc::Receiver<OutputCommand>,
) {
    let Some(device) = find_output_device(Some(&name)) else {
        let _ = ready.send(Err(unavailable(format!(
            "output device '{}' disappeared",
            name
        ))));
        return;
    };

    let built = match negotiated.format {
        SampleFormat::F32 => build_output_stream::<f32>(&device, negotiated, queue, state.clone()),
        SampleFormat::I16 => build_output_stream::<i16>(&device, negotiated, queue, state.clone()),
        SampleFormat::U16 => build_output_stream::<u16>(&device, negotiated, queue, state.clone()),
        other => {
            let _ = ready.send(Err(unavailable(format!(
                "unsupported sample format {:?}",
                other
            ))));
            return;
        }
    };

    let stream = match built
        .map_err(|e| unavailable(format!("failed to build output stream: {}", e)))
        .and_then(|stream| {
            stream
                .play()
                .map_err(|e| unavailable(format!("failed to start output stream: {}", e)))?;
            Ok(stream)
        }) {
        Ok(stream) => {
            let _ = ready.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    while let Ok(command) = commands.recv() {
        match command {
            OutputCommand::Pause => {
                if let Err(e) = stream.pause() {
                    warn!("Failed to pause output stream: {}", e);
                }
            }
            OutputCommand::Play => match stream.play() {
                Ok(()) => state.store(STATE_RUNNING, Ordering::SeqCst),
                Err(e) => warn!("Failed to resume output stream: {}", e),
            },
            OutputCommand::Shutdown => break,
        }
    }
    drop(stream);
}

impl CpalOutput {
    /// Open the named output device (or the default) at `sample_rate`
    pub fn open(name: Option<String>, sample_rate: u32) -> Result<Self> {
        let mut output = Self {
            requested_name: name,
            name: String::new(),
            sample_rate,
            resampler: StreamResampler::new(sample_rate, sample_rate)?,
            queue: Arc::new(Mutex::new(OutputQueue::default())),
            state: Arc::new(AtomicU8::new(STATE_CLOSED)),
            worker: None,
        };
        output.spawn_stream()?;
        Ok(output)
    }

    fn spawn_stream(&mut self) -> Result<()> {
        let device = find_output_device(self.requested_name.as_deref()).ok_or_else(|| {
            match &self.requested_name {
                Some(name) => unavailable(format!("output device '{}' not found", name)),
                None => unavailable("no default output device"),
            }
        })?;
        let ranges = device
            .supported_output_configs()
            .map_err(|e| unavailable(format!("failed to query output configs: {}", e)))?
            .collect();
        let negotiated = negotiate(ranges, device.default_output_config().ok(), self.sample_rate)
            .ok_or_else(|| unavailable("output device has no supported audio format"))?;

        self.name = device_name(&device);
        self.resampler = StreamResampler::new(self.sample_rate, negotiated.sample_rate)?;

        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (cmd_tx, cmd_rx) = std_mpsc::channel();
        let queue = self.queue.clone();
        let state = self.state.clone();
        let name = self.name.clone();
        let thread = std::thread::Builder::new()
            .name("cpal-output".to_string())
            .spawn(move || run_output(name, negotiated, queue, state, ready_tx, cmd_rx))?;

        ready_rx
            .recv()
            .map_err(|_| unavailable("output thread exited during startup"))??;

        self.state.store(STATE_RUNNING, Ordering::SeqCst);
        self.worker = Some(OutputWorker {
            commands: cmd_tx,
            thread,
        });
        info!(
            "Opened output device '{}' ({}Hz, {} channels)",
            self.name, negotiated.sample_rate, negotiated.channels
        );
        Ok(())
    }

    fn shutdown_stream(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.commands.send(OutputCommand::Shutdown);
            if worker.thread.join().is_err() {
                warn!("Output thread for '{}' panicked", self.name);
            }
        }
        // Pending completions resolve as dropped senders
        if let Ok(mut queue) = self.queue.lock() {
            queue.pending.clear();
        }
    }

    /// Pause output; playback sees the device as suspended
    pub fn suspend(&mut self) {
        if let Some(worker) = &self.worker {
            let _ = worker.commands.send(OutputCommand::Pause);
            self.state.store(STATE_SUSPENDED, Ordering::SeqCst);
        }
    }
}

#[async_trait::async_trait]
impl OutputDevice for CpalOutput {
    fn state(&self) -> DeviceState {
        match self.state.load(Ordering::SeqCst) {
            STATE_RUNNING => DeviceState::Running,
            STATE_SUSPENDED => DeviceState::Suspended,
            _ => DeviceState::Closed,
        }
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn resume(&mut self) -> Result<()> {
        let worker = match (&self.worker, self.state()) {
            (_, DeviceState::Running) => return Ok(()),
            (Some(worker), DeviceState::Suspended) => worker,
            _ => return Err(unavailable(format!("output device '{}' is closed", self.name))),
        };
        worker
            .commands
            .send(OutputCommand::Play)
            .map_err(|_| unavailable("output thread is gone"))?;

        // The stream thread flips the state once play() succeeds
        let started = Instant::now();
        while self.state() != DeviceState::Running {
            if started.elapsed() > std::time::Duration::from_millis(500) {
                return Err(unavailable(format!(
                    "output device '{}' did not resume",
                    self.name
                )));
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        Ok(())
    }

    async fn recreate(&mut self, sample_rate: u32) -> Result<()> {
        info!(
            "Recreating output device ({}Hz -> {}Hz)",
            self.sample_rate, sample_rate
        );
        self.shutdown_stream();
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
        self.sample_rate = sample_rate;
        self.spawn_stream()
    }

    fn play(&mut self, samples: Vec<f32>) -> Result<oneshot::Receiver<()>> {
        if self.state() != DeviceState::Running {
            return Err(unavailable(format!(
                "output device '{}' is not running",
                self.name
            )));
        }

        let samples = self.resampler.process(&samples)?;
        let (done_tx, done_rx) = oneshot::channel();
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| unavailable("output queue poisoned"))?;
        queue.pending.push_back(Pending {
            samples,
            position: 0,
            done: Some(done_tx),
        });
        Ok(done_rx)
    }

    async fn close(&mut self) -> Result<()> {
        self.shutdown_stream();
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.commands.send(OutputCommand::Shutdown);
        }
    }
}
