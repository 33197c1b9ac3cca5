// Integration tests for the playback task
//
// A fake output device records every buffer it is asked to play and
// completes it after the buffer's real duration, so pacing, ordering and
// recovery can be checked under paused time.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use voice_duplex::audio::codec::{decode_chunk, encode_frame};
use voice_duplex::audio::{DeviceState, OutputDevice, PlaybackEvent, PlaybackHandle};
use voice_duplex::config::{DspConfig, PlaybackConfig};
use voice_duplex::error::Result;
use voice_duplex::transport::InboundAudio;

#[derive(Debug, Clone)]
struct Played {
    at: Instant,
    sample_rate: u32,
    samples: Vec<f32>,
}

#[derive(Debug, Default)]
struct DeviceLog {
    played: Vec<Played>,
    recreated: Vec<u32>,
    resumes: usize,
}

struct FakeOutput {
    state: DeviceState,
    sample_rate: u32,
    recreate_delay: Duration,
    log: Arc<Mutex<DeviceLog>>,
}

impl FakeOutput {
    fn new(sample_rate: u32) -> (Self, Arc<Mutex<DeviceLog>>) {
        let log = Arc::new(Mutex::new(DeviceLog::default()));
        let device = Self {
            state: DeviceState::Running,
            sample_rate,
            recreate_delay: Duration::ZERO,
            log: Arc::clone(&log),
        };
        (device, log)
    }
}

#[async_trait::async_trait]
impl OutputDevice for FakeOutput {
    fn state(&self) -> DeviceState {
        self.state
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn resume(&mut self) -> Result<()> {
        self.log.lock().unwrap().resumes += 1;
        self.state = DeviceState::Running;
        Ok(())
    }

    async fn recreate(&mut self, sample_rate: u32) -> Result<()> {
        tokio::time::sleep(self.recreate_delay).await;
        self.log.lock().unwrap().recreated.push(sample_rate);
        self.sample_rate = sample_rate;
        self.state = DeviceState::Running;
        Ok(())
    }

    fn play(&mut self, samples: Vec<f32>) -> Result<oneshot::Receiver<()>> {
        let duration = Duration::from_secs_f64(samples.len() as f64 / self.sample_rate as f64);
        self.log.lock().unwrap().played.push(Played {
            at: Instant::now(),
            sample_rate: self.sample_rate,
            samples,
        });

        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = tx.send(());
        });
        Ok(rx)
    }

    async fn close(&mut self) -> Result<()> {
        self.state = DeviceState::Closed;
        Ok(())
    }

    fn name(&self) -> &str {
        "fake output"
    }
}

fn chunk(value: f32, len: usize, sample_rate: Option<u32>, preserve_quality: bool) -> InboundAudio {
    InboundAudio {
        data: encode_frame(&vec![value; len]),
        sample_rate,
        preserve_quality,
    }
}

fn spawn(
    device: FakeOutput,
    config: &PlaybackConfig,
) -> (PlaybackHandle, mpsc::UnboundedReceiver<PlaybackEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = PlaybackHandle::spawn(Box::new(device), config, DspConfig::default(), tx);
    (handle, rx)
}

fn first_values(log: &Arc<Mutex<DeviceLog>>) -> Vec<f32> {
    log.lock()
        .unwrap()
        .played
        .iter()
        .map(|p| (p.samples[0] * 10.0).round() / 10.0)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_chunks_play_in_order_with_min_gap() {
    let config = PlaybackConfig::default();
    let (device, log) = FakeOutput::new(24000);
    let (handle, _events) = spawn(device, &config);

    // 5ms chunks, shorter than the 10ms minimum gap
    for value in [0.1, 0.2, 0.3, 0.4] {
        handle.enqueue(chunk(value, 120, Some(24000), false));
    }

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(first_values(&log), vec![0.1, 0.2, 0.3, 0.4]);

    let starts: Vec<Instant> = log.lock().unwrap().played.iter().map(|p| p.at).collect();
    for pair in starts.windows(2) {
        assert!(pair[1] - pair[0] >= config.min_gap());
    }

    assert_eq!(handle.counters().played(), 4);
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_min_gap_counts_from_after_slow_recreate() {
    let config = PlaybackConfig::default();
    let (mut device, log) = FakeOutput::new(24000);
    device.recreate_delay = Duration::from_millis(50);
    let (handle, _events) = spawn(device, &config);

    // 5ms each; the second forces a slow device rebuild
    handle.enqueue(chunk(0.1, 120, Some(24000), false));
    handle.enqueue(chunk(0.2, 240, Some(48000), false));
    handle.enqueue(chunk(0.3, 240, Some(48000), false));

    tokio::time::sleep(Duration::from_secs(1)).await;

    let starts: Vec<Instant> = log.lock().unwrap().played.iter().map(|p| p.at).collect();
    assert_eq!(starts.len(), 3);
    assert!(starts[1] - starts[0] >= Duration::from_millis(50));
    assert!(starts[2] - starts[1] >= config.min_gap());
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_one_chunk_at_a_time() {
    let (device, log) = FakeOutput::new(24000);
    let (handle, _events) = spawn(device, &PlaybackConfig::default());

    // 100ms chunks: each must finish before the next starts
    handle.enqueue(chunk(0.1, 2400, Some(24000), false));
    handle.enqueue(chunk(0.2, 2400, Some(24000), false));

    tokio::time::sleep(Duration::from_secs(1)).await;

    let played = log.lock().unwrap().played.clone();
    assert_eq!(played.len(), 2);
    assert!(played[1].at - played[0].at >= Duration::from_millis(100));
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_overflow_evicts_oldest_queued() {
    let config = PlaybackConfig {
        max_queue: 4,
        ..PlaybackConfig::default()
    };
    let (device, log) = FakeOutput::new(24000);
    let (handle, _events) = spawn(device, &config);

    for i in 0..10 {
        handle.enqueue(chunk(i as f32 / 10.0, 240, Some(24000), false));
    }

    tokio::time::sleep(Duration::from_secs(1)).await;

    // chunk 0 was already playing; of 1..=9 only the newest four survive
    assert_eq!(first_values(&log), vec![0.0, 0.6, 0.7, 0.8, 0.9]);
    assert_eq!(handle.counters().evicted(), 5);
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_preserve_quality_false_bypasses_enhancement() -> anyhow::Result<()> {
    let (device, log) = FakeOutput::new(24000);
    let (handle, _events) = spawn(device, &PlaybackConfig::default());

    let input: Vec<f32> = (0..480).map(|i| (i as f32 * 0.3).sin() * 0.5).collect();
    let data = encode_frame(&input);
    let expected = decode_chunk(&data)?;

    handle.enqueue(InboundAudio {
        data: data.clone(),
        sample_rate: Some(24000),
        preserve_quality: false,
    });
    handle.enqueue(InboundAudio {
        data,
        sample_rate: Some(24000),
        preserve_quality: true,
    });

    tokio::time::sleep(Duration::from_secs(1)).await;

    let played = log.lock().unwrap().played.clone();
    assert_eq!(played.len(), 2);
    assert_eq!(played[0].samples, expected);
    assert_ne!(played[1].samples, expected);
    assert_eq!(played[1].samples.len(), expected.len());

    handle.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_chunk_is_skipped() {
    let (device, log) = FakeOutput::new(24000);
    let (handle, _events) = spawn(device, &PlaybackConfig::default());

    handle.enqueue(InboundAudio {
        data: "***".to_string(),
        sample_rate: Some(24000),
        preserve_quality: false,
    });
    handle.enqueue(chunk(0.5, 240, Some(24000), false));

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(first_values(&log), vec![0.5]);
    assert_eq!(handle.counters().skipped(), 1);
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_rate_change_recreates_device() {
    let (device, log) = FakeOutput::new(24000);
    let (handle, _events) = spawn(device, &PlaybackConfig::default());

    handle.enqueue(chunk(0.1, 240, None, false));
    handle.enqueue(chunk(0.2, 480, Some(48000), false));

    tokio::time::sleep(Duration::from_secs(1)).await;

    let log = log.lock().unwrap();
    assert_eq!(log.recreated, vec![48000]);
    let rates: Vec<u32> = log.played.iter().map(|p| p.sample_rate).collect();
    assert_eq!(rates, vec![24000, 48000]);
    drop(log);
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_suspended_device_is_resumed_before_playing() {
    let (mut device, log) = FakeOutput::new(24000);
    device.state = DeviceState::Suspended;
    let (handle, _events) = spawn(device, &PlaybackConfig::default());

    handle.enqueue(chunk(0.3, 240, Some(24000), false));
    tokio::time::sleep(Duration::from_secs(1)).await;

    let log = log.lock().unwrap();
    assert_eq!(log.resumes, 1);
    assert_eq!(log.played.len(), 1);
    drop(log);
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_recover_device_reports_result() {
    let (device, _log) = FakeOutput::new(24000);
    let (handle, mut events) = spawn(device, &PlaybackConfig::default());

    handle.recover_device();
    let event = events.recv().await;
    assert_eq!(event, Some(PlaybackEvent::DeviceRecovered(true)));
    handle.shutdown().await;
}
