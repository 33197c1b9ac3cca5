use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::{CaptureDevice, CaptureFormat, CaptureProvider};
use super::gate::VoiceGate;
use crate::config::CaptureConfig;
use crate::error::{Result, VoiceError};
use crate::transport::messages::ClientMessage;

/// Where finished frames go (the transport, or a test double)
pub trait FrameSink: Send + Sync {
    /// Hand over one message; false means it was dropped
    fn submit(&self, message: ClientMessage) -> bool;
}

/// Latest frame and its level, for a visualizer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LevelSnapshot {
    pub level: f32,
    pub samples: Vec<f32>,
}

/// Open the capture device: preferred id first, then any device, all within
/// the configured timeout.
pub async fn open_capture(
    provider: &dyn CaptureProvider,
    config: &CaptureConfig,
) -> Result<Box<dyn CaptureDevice>> {
    let format = CaptureFormat {
        sample_rate: config.sample_rate,
        block_size: config.frame_size,
    };

    let acquire = async {
        if let Some(id) = config.device_id.as_deref() {
            match provider.open(Some(id), format).await {
                Ok(device) => return Ok(device),
                Err(e) => warn!(
                    "Preferred input '{}' failed to open ({}), falling back to default",
                    id, e
                ),
            }
        }
        provider.open(None, format).await
    };

    let device = tokio::time::timeout(config.open_timeout(), acquire)
        .await
        .map_err(|_| VoiceError::DeviceTimeout(config.open_timeout()))??;

    info!("Capture device ready: {}", device.name());
    Ok(device)
}

/// Collects device blocks into fixed-size frames
#[derive(Debug)]
pub struct Framer {
    frame_size: usize,
    pending: Vec<f32>,
}

impl Framer {
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size: frame_size.max(1),
            pending: Vec::with_capacity(frame_size * 2),
        }
    }

    pub fn push(&mut self, samples: &[f32]) {
        self.pending.extend_from_slice(samples);
    }

    pub fn next_frame(&mut self) -> Option<Vec<f32>> {
        if self.pending.len() < self.frame_size {
            return None;
        }
        let rest = self.pending.split_off(self.frame_size);
        Some(std::mem::replace(&mut self.pending, rest))
    }
}

#[derive(Debug, Default)]
pub struct CaptureCounters {
    pub frames: AtomicU64,
    pub sent: AtomicU64,
    pub dropped: AtomicU64,
}

impl CaptureCounters {
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Reported by the pipeline when capture fails underneath it
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// The device stopped delivering blocks without being asked to
    DeviceLost(String),
}

/// Microphone -> gate -> codec -> sink
pub struct CapturePipeline {
    config: CaptureConfig,
    sink: Arc<dyn FrameSink>,
    events: mpsc::UnboundedSender<CaptureEvent>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    counters: Arc<CaptureCounters>,
    level_tx: Arc<watch::Sender<LevelSnapshot>>,
    levels: watch::Receiver<LevelSnapshot>,
}

impl CapturePipeline {
    pub async fn start(
        device: Box<dyn CaptureDevice>,
        config: &CaptureConfig,
        sink: Arc<dyn FrameSink>,
        events: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Result<Self> {
        let (level_tx, levels) = watch::channel(LevelSnapshot::default());
        let mut pipeline = Self {
            config: config.clone(),
            sink,
            events,
            stop: None,
            task: None,
            counters: Arc::new(CaptureCounters::default()),
            level_tx: Arc::new(level_tx),
            levels,
        };
        pipeline.attach(device).await?;
        Ok(pipeline)
    }

    /// Swap in a new device; counters and the level feed carry over
    pub async fn restart(&mut self, device: Box<dyn CaptureDevice>) -> Result<()> {
        self.stop().await;
        self.attach(device).await
    }

    async fn attach(&mut self, mut device: Box<dyn CaptureDevice>) -> Result<()> {
        let mut blocks = device.start().await?;
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let mut gate = VoiceGate::from_config(&self.config);
        let mut framer = Framer::new(self.config.frame_size);
        let counters = Arc::clone(&self.counters);
        let level_tx = Arc::clone(&self.level_tx);
        let sink = Arc::clone(&self.sink);
        let events = self.events.clone();

        info!(
            "Capture started on {} ({} samples/frame)",
            device.name(),
            self.config.frame_size
        );

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    block = blocks.recv() => {
                        let Some(block) = block else {
                            warn!("Capture device {} stopped delivering audio", device.name());
                            let _ = events.send(CaptureEvent::DeviceLost(format!(
                                "capture device {} stopped delivering audio",
                                device.name()
                            )));
                            break;
                        };
                        framer.push(&block.samples);
                        while let Some(frame) = framer.next_frame() {
                            let decision = gate.process(&frame);
                            counters.frames.fetch_add(1, Ordering::Relaxed);

                            if decision.transmit {
                                if sink.submit(ClientMessage::audio(&frame)) {
                                    counters.sent.fetch_add(1, Ordering::Relaxed);
                                } else {
                                    counters.dropped.fetch_add(1, Ordering::Relaxed);
                                }
                            }

                            // latest value wins; never waits on a reader
                            level_tx.send_replace(LevelSnapshot {
                                level: decision.level,
                                samples: frame,
                            });
                        }
                    }
                }
            }

            if let Err(e) = device.stop().await {
                warn!("Failed to stop capture device: {}", e);
            }
            debug!("Capture task finished");
        });

        self.stop = Some(stop_tx);
        self.task = Some(task);
        Ok(())
    }

    pub fn counters(&self) -> Arc<CaptureCounters> {
        Arc::clone(&self.counters)
    }

    pub fn levels(&self) -> watch::Receiver<LevelSnapshot> {
        self.levels.clone()
    }

    /// Stop the pipeline and release the device
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Capture task ended abnormally: {}", e);
            }
            info!(
                "Capture stopped: {} frames, {} sent, {} dropped",
                self.counters.frames(),
                self.counters.sent(),
                self.counters.dropped()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::audio::file::WavCapture;

    /// Records every id it is asked for; only opens the ids in `working`
    struct PickyProvider {
        working: Vec<Option<&'static str>>,
        requested: Mutex<Vec<Option<String>>>,
    }

    #[async_trait::async_trait]
    impl CaptureProvider for PickyProvider {
        async fn open(
            &self,
            device_id: Option<&str>,
            format: CaptureFormat,
        ) -> Result<Box<dyn CaptureDevice>> {
            self.requested
                .lock()
                .unwrap()
                .push(device_id.map(str::to_string));
            if self.working.iter().any(|w| *w == device_id) {
                let name = device_id.unwrap_or("default");
                Ok(Box::new(WavCapture::from_samples(name, Vec::new(), format)))
            } else {
                Err(VoiceError::DeviceUnavailable(format!("{:?} busy", device_id)))
            }
        }
    }

    /// Never finishes opening
    struct HungProvider;

    #[async_trait::async_trait]
    impl CaptureProvider for HungProvider {
        async fn open(
            &self,
            _device_id: Option<&str>,
            _format: CaptureFormat,
        ) -> Result<Box<dyn CaptureDevice>> {
            std::future::pending().await
        }
    }

    fn config_with_device(device_id: Option<&str>) -> CaptureConfig {
        CaptureConfig {
            device_id: device_id.map(str::to_string),
            ..CaptureConfig::default()
        }
    }

    #[tokio::test]
    async fn test_preferred_device_falls_back_to_default() {
        let provider = PickyProvider {
            working: vec![None],
            requested: Mutex::new(Vec::new()),
        };

        let device = open_capture(&provider, &config_with_device(Some("usb-mic")))
            .await
            .unwrap();

        assert_eq!(device.name(), "default");
        assert_eq!(
            *provider.requested.lock().unwrap(),
            vec![Some("usb-mic".to_string()), None]
        );
    }

    #[tokio::test]
    async fn test_preferred_device_used_when_available() {
        let provider = PickyProvider {
            working: vec![Some("usb-mic"), None],
            requested: Mutex::new(Vec::new()),
        };

        let device = open_capture(&provider, &config_with_device(Some("usb-mic")))
            .await
            .unwrap();

        assert_eq!(device.name(), "usb-mic");
        assert_eq!(provider.requested.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_device_open_times_out() {
        let config = config_with_device(None);
        let started = tokio::time::Instant::now();

        let result = open_capture(&HungProvider, &config).await;

        assert!(matches!(result, Err(VoiceError::DeviceTimeout(_))));
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[test]
    fn test_framer_reassembles_blocks() {
        let mut framer = Framer::new(4);
        framer.push(&[1.0, 2.0, 3.0]);
        assert!(framer.next_frame().is_none());
        framer.push(&[4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        assert_eq!(framer.next_frame(), Some(vec![1.0, 2.0, 3.0, 4.0]));
        assert_eq!(framer.next_frame(), Some(vec![5.0, 6.0, 7.0, 8.0]));
        assert!(framer.next_frame().is_none());
    }
}
