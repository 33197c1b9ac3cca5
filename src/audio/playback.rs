//! Playback scheduler (jitter buffer)
//!
//! Inbound chunks are decoded on arrival and queued in arrival order. The
//! queue is bounded: on overflow the oldest chunks are evicted so latency
//! stays low. One chunk plays at a time, and consecutive playback starts are
//! at least `min_gap` apart.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::backend::{DeviceState, OutputDevice};
use super::codec;
use super::dsp;
use crate::config::{DspConfig, PlaybackConfig};
use crate::transport::messages::InboundAudio;

/// A decoded inbound chunk waiting for the output device
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub preserve_quality: bool,
    /// Arrival order, starting at 0
    pub sequence: u64,
}

impl AudioChunk {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Draining,
}

/// What the drain loop should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainPoll {
    /// The head chunk may start now
    Ready,
    /// The head chunk may start at this instant
    WaitUntil(Instant),
    /// A chunk is still playing
    Busy,
    /// Nothing queued
    Empty,
}

/// Queue and pacing state, free of any I/O
#[derive(Debug)]
pub struct PlaybackScheduler {
    queue: VecDeque<AudioChunk>,
    max_queue: usize,
    min_gap: Duration,
    state: SchedulerState,
    playing: bool,
    last_start: Option<Instant>,
    not_before: Option<Instant>,
    next_sequence: u64,
}

impl PlaybackScheduler {
    pub fn new(max_queue: usize, min_gap: Duration) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_queue),
            max_queue: max_queue.max(1),
            min_gap,
            state: SchedulerState::Idle,
            playing: false,
            last_start: None,
            not_before: None,
            next_sequence: 0,
        }
    }

    pub fn from_config(config: &PlaybackConfig) -> Self {
        Self::new(config.max_queue, config.min_gap())
    }

    /// Queue a chunk, returning how many old chunks were evicted
    pub fn push(&mut self, samples: Vec<f32>, sample_rate: u32, preserve_quality: bool) -> usize {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.queue.push_back(AudioChunk {
            samples,
            sample_rate,
            preserve_quality,
            sequence,
        });

        let mut evicted = 0;
        while self.queue.len() > self.max_queue {
            if let Some(old) = self.queue.pop_front() {
                debug!("Evicting chunk {} (queue full)", old.sequence);
                evicted += 1;
            }
        }

        self.state = SchedulerState::Draining;
        evicted
    }

    pub fn poll(&mut self, now: Instant) -> DrainPoll {
        if self.playing {
            return DrainPoll::Busy;
        }
        if self.queue.is_empty() {
            self.state = SchedulerState::Idle;
            return DrainPoll::Empty;
        }

        let gap_ready = self.last_start.map(|t| t + self.min_gap);
        let ready_at = match (gap_ready, self.not_before) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        match ready_at {
            Some(at) if now < at => DrainPoll::WaitUntil(at),
            _ => DrainPoll::Ready,
        }
    }

    /// Pop the head chunk and mark it playing
    pub fn start_next(&mut self, now: Instant) -> Option<AudioChunk> {
        let chunk = self.queue.pop_front()?;
        self.playing = true;
        self.last_start = Some(now);
        Some(chunk)
    }

    /// The playing chunk finished (or was abandoned)
    pub fn finish(&mut self) {
        self.playing = false;
    }

    /// Hold the queue until `until`
    pub fn defer(&mut self, until: Instant) {
        self.not_before = Some(self.not_before.map_or(until, |t| t.max(until)));
    }

    /// Drop every queued chunk; a chunk already playing is unaffected
    pub fn clear(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        if !self.playing {
            self.state = SchedulerState::Idle;
        }
        dropped
    }

    pub fn peek(&self) -> Option<&AudioChunk> {
        self.queue.front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }
}

// =============================================================================
// Playback task
// =============================================================================

#[derive(Debug)]
pub enum PlaybackCommand {
    Enqueue(InboundAudio),
    Clear,
    /// Resume the output in place, recreating it if that is not enough
    RecoverDevice,
    Shutdown,
}

/// Reported to the session for resilience decisions
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    DeviceError(String),
    DeviceRecovered(bool),
}

/// Shared playback counters
#[derive(Debug, Default)]
pub struct PlaybackCounters {
    pub played: AtomicU64,
    pub evicted: AtomicU64,
    pub skipped: AtomicU64,
    pub queued: AtomicUsize,
}

impl PlaybackCounters {
    pub fn played(&self) -> u64 {
        self.played.load(Ordering::Relaxed)
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }
}

/// Handle to a running playback task
pub struct PlaybackHandle {
    commands: mpsc::UnboundedSender<PlaybackCommand>,
    counters: Arc<PlaybackCounters>,
    task: JoinHandle<()>,
}

impl PlaybackHandle {
    pub fn spawn(
        device: Box<dyn OutputDevice>,
        playback: &PlaybackConfig,
        dsp: DspConfig,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(PlaybackCounters::default());

        info!(
            "Starting playback on {} ({}Hz, queue {})",
            device.name(),
            device.sample_rate(),
            playback.max_queue
        );

        let task = PlaybackTask {
            scheduler: PlaybackScheduler::from_config(playback),
            device,
            dsp,
            default_rate: playback.output_sample_rate,
            device_retry: playback.device_retry(),
            cooldown: playback.decode_cooldown(),
            commands: rx,
            events,
            counters: Arc::clone(&counters),
        };

        Self {
            commands: tx,
            counters,
            task: tokio::spawn(task.run()),
        }
    }

    pub fn enqueue(&self, audio: InboundAudio) {
        self.send(PlaybackCommand::Enqueue(audio));
    }

    pub fn clear(&self) {
        self.send(PlaybackCommand::Clear);
    }

    pub fn recover_device(&self) {
        self.send(PlaybackCommand::RecoverDevice);
    }

    pub fn counters(&self) -> Arc<PlaybackCounters> {
        Arc::clone(&self.counters)
    }

    /// Clear the queue, close the output device and wait for the task
    pub async fn shutdown(self) {
        self.send(PlaybackCommand::Clear);
        self.send(PlaybackCommand::Shutdown);
        if let Err(e) = self.task.await {
            warn!("Playback task ended abnormally: {}", e);
        }
    }

    fn send(&self, command: PlaybackCommand) {
        if self.commands.send(command).is_err() {
            debug!("Playback task already stopped");
        }
    }
}

struct PlaybackTask {
    scheduler: PlaybackScheduler,
    device: Box<dyn OutputDevice>,
    dsp: DspConfig,
    default_rate: u32,
    device_retry: Duration,
    cooldown: Duration,
    commands: mpsc::UnboundedReceiver<PlaybackCommand>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    counters: Arc<PlaybackCounters>,
}

impl PlaybackTask {
    async fn run(mut self) {
        let mut playing: Option<oneshot::Receiver<()>> = None;

        loop {
            let wake = self.drain(&mut playing).await;
            self.counters
                .queued
                .store(self.scheduler.len(), Ordering::Relaxed);

            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(PlaybackCommand::Shutdown) => break,
                    Some(PlaybackCommand::Enqueue(audio)) => self.enqueue(audio),
                    Some(PlaybackCommand::Clear) => {
                        let dropped = self.scheduler.clear();
                        if dropped > 0 {
                            debug!("Cleared {} queued chunks", dropped);
                        }
                    }
                    Some(PlaybackCommand::RecoverDevice) => {
                        let ok = self.recover_device().await;
                        let _ = self.events.send(PlaybackEvent::DeviceRecovered(ok));
                    }
                },
                _ = wait_playing(&mut playing) => {
                    playing = None;
                    self.scheduler.finish();
                }
                _ = sleep_until_opt(wake) => {}
            }
        }

        self.scheduler.clear();
        if let Err(e) = self.device.close().await {
            warn!("Failed to close output device: {}", e);
        }
        info!("Playback stopped");
    }

    fn enqueue(&mut self, audio: InboundAudio) {
        let sample_rate = audio
            .sample_rate
            .filter(|&r| r > 0)
            .unwrap_or(self.default_rate);

        match codec::decode_chunk(&audio.data) {
            Ok(samples) if samples.is_empty() => {
                debug!("Ignoring empty audio chunk");
            }
            Ok(samples) => {
                let evicted = self
                    .scheduler
                    .push(samples, sample_rate, audio.preserve_quality);
                if evicted > 0 {
                    self.counters
                        .evicted
                        .fetch_add(evicted as u64, Ordering::Relaxed);
                }
            }
            Err(e) => {
                warn!("Skipping audio chunk: {}", e);
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                self.scheduler.defer(Instant::now() + self.cooldown);
            }
        }
    }

    /// Start as many chunks as pacing allows; returns when to wake next
    async fn drain(&mut self, playing: &mut Option<oneshot::Receiver<()>>) -> Option<Instant> {
        loop {
            let now = Instant::now();
            match self.scheduler.poll(now) {
                DrainPoll::Busy | DrainPoll::Empty => return None,
                DrainPoll::WaitUntil(at) => return Some(at),
                DrainPoll::Ready => {}
            }

            if self.device.state() != DeviceState::Running && !self.recover_device().await {
                let retry = Instant::now() + self.device_retry;
                self.scheduler.defer(retry);
                return Some(retry);
            }

            let rate = self.scheduler.peek().map(|c| c.sample_rate);
            let recreated = match rate {
                Some(rate) if rate != self.device.sample_rate() => {
                    debug!(
                        "Recreating output at {}Hz (was {}Hz)",
                        rate,
                        self.device.sample_rate()
                    );
                    self.device.recreate(rate).await
                }
                _ => Ok(()),
            };

            // device work above may take a while; pace from the real start
            let Some(chunk) = self.scheduler.start_next(Instant::now()) else {
                return None;
            };
            if let Err(e) = recreated {
                self.abandon(chunk.sequence, &e.to_string());
                continue;
            }

            let samples = dsp::enhance(
                &self.dsp,
                chunk.samples,
                chunk.sample_rate,
                chunk.preserve_quality,
            );

            match self.device.play(samples) {
                Ok(done) => {
                    self.counters.played.fetch_add(1, Ordering::Relaxed);
                    *playing = Some(done);
                    return None;
                }
                Err(e) => {
                    self.abandon(chunk.sequence, &e.to_string());
                }
            }
        }
    }

    /// A chunk could not be played: skip it, cool down, tell the session
    fn abandon(&mut self, sequence: u64, reason: &str) {
        warn!("Chunk {} not played: {}", sequence, reason);
        self.scheduler.finish();
        self.scheduler.defer(Instant::now() + self.cooldown);
        self.counters.skipped.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .events
            .send(PlaybackEvent::DeviceError(reason.to_string()));
    }

    /// Resume in place; if the device still is not running, recreate it at
    /// the same rate and resume once more.
    async fn recover_device(&mut self) -> bool {
        if let Err(e) = self.device.resume().await {
            debug!("Resume failed: {}", e);
        }
        if self.device.state() == DeviceState::Running {
            return true;
        }

        let rate = self.device.sample_rate();
        info!("Recreating output device at {}Hz", rate);
        let result = match self.device.recreate(rate).await {
            Ok(()) => self.device.resume().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) if self.device.state() == DeviceState::Running => true,
            Ok(()) => {
                let reason = format!("output device is {:?} after recreate", self.device.state());
                warn!("{}", reason);
                let _ = self.events.send(PlaybackEvent::DeviceError(reason));
                false
            }
            Err(e) => {
                warn!("Output device recovery failed: {}", e);
                let _ = self.events.send(PlaybackEvent::DeviceError(e.to_string()));
                false
            }
        }
    }
}

async fn wait_playing(playing: &mut Option<oneshot::Receiver<()>>) {
    match playing {
        // a dropped sender also means the buffer is gone
        Some(done) => {
            let _ = done.await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
