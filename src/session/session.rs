use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::lifecycle::{SessionApi, SessionInfo};
use super::stats::{LifecycleState, SessionStats, SessionStatus};
use crate::audio::backend::{CaptureDevice, CaptureProvider, OutputDevice};
use crate::audio::capture::{
    open_capture, CaptureCounters, CaptureEvent, CapturePipeline, LevelSnapshot,
};
use crate::audio::playback::{PlaybackCounters, PlaybackEvent, PlaybackHandle};
use crate::config::{CaptureConfig, Config};
use crate::error::{ErrorKind, Result, VoiceError};
use crate::resilience::{RecoveryAction, ResilienceEngine};
use crate::transport::{
    ChannelEvent, ChannelEventKind, ClientMessage, ControlCommand, ServerMessage, Transport,
};

const STATUS_REFRESH: Duration = Duration::from_secs(1);

/// Collaborators a session is built from
pub struct SessionDeps {
    pub api: Arc<dyn SessionApi>,
    pub capture: Arc<dyn CaptureProvider>,
    pub output: Box<dyn OutputDevice>,
}

#[derive(Debug)]
enum SessionCommand {
    Stop,
    RequestStatus,
}

/// One live conversation: owns the capture device, the output device, the
/// channel and the recovery policy, and tears all of them down together.
pub struct VoiceSession {
    info: SessionInfo,
    started_at: DateTime<Utc>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
    levels: watch::Receiver<LevelSnapshot>,
    capture_counters: Arc<CaptureCounters>,
    playback_counters: Arc<PlaybackCounters>,
    runner: Option<JoinHandle<Option<String>>>,
    terminal_error: Option<String>,
}

impl VoiceSession {
    /// Create the server-side session, open devices and the channel, then
    /// start streaming. Any failure undoes the steps already taken.
    pub async fn start(config: &Config, character: &str, deps: SessionDeps) -> Result<Self> {
        let SessionDeps {
            api,
            capture,
            output,
        } = deps;

        let info = api.create(character).await?;
        let session_id = info.session_id.clone();
        info!("Starting voice session {} ({})", session_id, info.character);

        let device = match open_capture(capture.as_ref(), &config.capture).await {
            Ok(device) => device,
            Err(e) => {
                error!("Capture unavailable: {}", e);
                destroy_quietly(api.as_ref(), &session_id).await;
                return Err(e);
            }
        };

        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let playback =
            PlaybackHandle::spawn(output, &config.playback, config.dsp.clone(), playback_tx);

        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let transport = Transport::new(config.transport.clone(), channel_tx);
        let url = api.channel_url(&session_id);

        if let Err(e) = transport.open(&url).await {
            error!("Channel failed to open: {}", e);
            drop(device);
            playback.shutdown().await;
            destroy_quietly(api.as_ref(), &session_id).await;
            return Err(e);
        }

        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let sink = Arc::new(transport.clone());
        let pipeline =
            match CapturePipeline::start(device, &config.capture, sink, capture_tx).await {
                Ok(pipeline) => pipeline,
                Err(e) => {
                    error!("Capture failed to start: {}", e);
                    transport.close().await;
                    playback.shutdown().await;
                    destroy_quietly(api.as_ref(), &session_id).await;
                    return Err(e);
                }
            };

        let mut initial = SessionStatus::new(&session_id, &info.character);
        initial.lifecycle = LifecycleState::Active;
        initial.connection = transport.state();
        let (status_tx, status_rx) = watch::channel(initial);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let levels = pipeline.levels();
        let capture_counters = pipeline.counters();
        let playback_counters = playback.counters();

        let runner = SessionRunner {
            info: info.clone(),
            api,
            url,
            transport,
            capture: pipeline,
            capture_provider: capture,
            capture_config: config.capture.clone(),
            capture_events: capture_rx,
            reopening_capture: None,
            playback: Some(playback),
            engine: ResilienceEngine::new(config.resilience.clone()),
            commands: command_rx,
            channel_events: channel_rx,
            playback_events: playback_rx,
            status: status_tx,
            capture_counters: Arc::clone(&capture_counters),
            playback_counters: Arc::clone(&playback_counters),
            reconnect_at: None,
            reconnecting: None,
            running: true,
            terminal_error: None,
        };

        Ok(Self {
            info,
            started_at: Utc::now(),
            commands: command_tx,
            status: status_rx,
            levels,
            capture_counters,
            playback_counters,
            runner: Some(tokio::spawn(runner.run())),
            terminal_error: None,
        })
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn session_id(&self) -> &str {
        &self.info.session_id
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn levels(&self) -> watch::Receiver<LevelSnapshot> {
        self.levels.clone()
    }

    pub fn is_active(&self) -> bool {
        self.status.borrow().lifecycle == LifecycleState::Active
    }

    /// Ask the service for a fresh `status` message
    pub fn request_status(&self) {
        let _ = self.commands.send(SessionCommand::RequestStatus);
    }

    /// Resolves once the session has fully shut down, whether stopped or
    /// ended by a terminal failure
    pub async fn closed(&self) {
        let mut status = self.status.clone();
        let _ = status
            .wait_for(|s| s.lifecycle == LifecycleState::Closed)
            .await;
    }

    /// Stop streaming and release everything; returns final statistics
    pub async fn stop(&mut self) -> SessionStats {
        let _ = self.commands.send(SessionCommand::Stop);
        if let Some(runner) = self.runner.take() {
            self.terminal_error = join_runner(runner.await);
        }
        self.stats()
    }

    pub fn stats(&self) -> SessionStats {
        let duration = Utc::now().signed_duration_since(self.started_at);
        SessionStats {
            session_id: self.info.session_id.clone(),
            is_active: self.is_active(),
            started_at: self.started_at,
            duration_secs: duration.num_milliseconds() as f64 / 1000.0,
            frames_captured: self.capture_counters.frames(),
            frames_sent: self.capture_counters.sent(),
            chunks_played: self.playback_counters.played(),
            chunks_evicted: self.playback_counters.evicted(),
            chunks_skipped: self.playback_counters.skipped(),
            terminal_error: self.terminal_error.clone(),
        }
    }
}

fn join_runner(result: std::result::Result<Option<String>, JoinError>) -> Option<String> {
    match result {
        Ok(terminal) => terminal,
        Err(e) => {
            error!("Session runner panicked: {}", e);
            Some(format!("session runner failed: {}", e))
        }
    }
}

async fn destroy_quietly(api: &dyn SessionApi, session_id: &str) {
    if let Err(e) = api.destroy(session_id).await {
        warn!("Failed to destroy session {}: {}", session_id, e);
    }
}

/// Whether the event loop keeps going
enum Flow {
    Continue,
    Stop,
}

struct SessionRunner {
    info: SessionInfo,
    api: Arc<dyn SessionApi>,
    url: String,
    transport: Transport,
    capture: CapturePipeline,
    capture_provider: Arc<dyn CaptureProvider>,
    capture_config: CaptureConfig,
    capture_events: mpsc::UnboundedReceiver<CaptureEvent>,
    reopening_capture: Option<JoinHandle<Result<Box<dyn CaptureDevice>>>>,
    playback: Option<PlaybackHandle>,
    engine: ResilienceEngine,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    playback_events: mpsc::UnboundedReceiver<PlaybackEvent>,
    status: watch::Sender<SessionStatus>,
    capture_counters: Arc<CaptureCounters>,
    playback_counters: Arc<PlaybackCounters>,
    reconnect_at: Option<Instant>,
    reconnecting: Option<JoinHandle<Result<u64>>>,
    running: bool,
    terminal_error: Option<String>,
}

impl SessionRunner {
    async fn run(mut self) -> Option<String> {
        let mut refresh = tokio::time::interval(STATUS_REFRESH);

        loop {
            let flow = tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(SessionCommand::Stop) => Flow::Stop,
                    Some(SessionCommand::RequestStatus) => {
                        self.transport.send(ClientMessage::Command {
                            command: ControlCommand::Status,
                        });
                        Flow::Continue
                    }
                },
                Some(event) = self.channel_events.recv() => self.on_channel_event(event),
                Some(event) = self.playback_events.recv() => self.on_playback_event(event),
                Some(event) = self.capture_events.recv() => self.on_capture_event(event),
                result = join_task(&mut self.reopening_capture) => {
                    self.reopening_capture = None;
                    self.on_capture_reopened(result).await
                }
                _ = sleep_until_opt(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.start_reconnect();
                    Flow::Continue
                }
                result = join_task(&mut self.reconnecting) => {
                    self.reconnecting = None;
                    self.on_reconnect_result(result)
                }
                _ = refresh.tick() => Flow::Continue,
            };

            self.publish();
            if let Flow::Stop = flow {
                break;
            }
        }

        self.teardown().await;
        self.terminal_error
    }

    fn on_channel_event(&mut self, event: ChannelEvent) -> Flow {
        if event.generation != self.transport.generation() {
            debug!("Ignoring event from replaced channel {}", event.generation);
            return Flow::Continue;
        }

        match event.kind {
            ChannelEventKind::Message(message) => self.on_message(message),
            ChannelEventKind::Closed { code } => {
                if code == crate::transport::NORMAL_CLOSURE {
                    info!("Service closed the channel normally; ending session");
                    return Flow::Stop;
                }
                let action = self.engine.on_close(code, self.running, Instant::now());
                self.set_error(VoiceError::AbnormalClose { code }.to_string());
                self.apply(action)
            }
            ChannelEventKind::Error { kind, message } => {
                self.set_error(message.clone());
                let action = self.engine.record_error(kind, message, Instant::now());
                self.apply(action)
            }
        }
    }

    fn on_message(&mut self, message: ServerMessage) -> Flow {
        match message {
            ServerMessage::Audio(audio) => {
                if let Some(playback) = &self.playback {
                    playback.enqueue(audio);
                }
                Flow::Continue
            }
            ServerMessage::Status {
                status,
                connection_status,
            } => {
                info!(
                    "Service status: {} ({})",
                    status,
                    connection_status.as_deref().unwrap_or("-")
                );
                self.status.send_modify(|s| {
                    s.server_status = Some(status);
                    s.server_connection_status = connection_status;
                });
                Flow::Continue
            }
            ServerMessage::Error { message } => {
                warn!("Service reported: {}", message);
                self.set_error(message);
                Flow::Continue
            }
            ServerMessage::Pong => Flow::Continue,
            ServerMessage::ReconnectResult { success: true } => {
                info!("Service reconnected upstream");
                Flow::Continue
            }
            ServerMessage::ReconnectResult { success: false } => {
                self.escalate(VoiceError::websocket("service reconnect failed"))
            }
            ServerMessage::Unknown => {
                debug!("Ignoring unknown message type");
                Flow::Continue
            }
        }
    }

    fn on_playback_event(&mut self, event: PlaybackEvent) -> Flow {
        match event {
            PlaybackEvent::DeviceError(message) => {
                self.set_error(message.clone());
                let action =
                    self.engine
                        .record_error(ErrorKind::AudioContext, message, Instant::now());
                self.apply(action)
            }
            PlaybackEvent::DeviceRecovered(ok) => {
                self.engine.audio_recovery_finished(ok);
                Flow::Continue
            }
        }
    }

    fn on_capture_event(&mut self, event: CaptureEvent) -> Flow {
        match event {
            CaptureEvent::DeviceLost(message) => {
                let flow = self.escalate(VoiceError::DeviceUnavailable(message));
                if self.reopening_capture.is_none() {
                    let provider = Arc::clone(&self.capture_provider);
                    let config = self.capture_config.clone();
                    self.reopening_capture = Some(tokio::spawn(async move {
                        open_capture(provider.as_ref(), &config).await
                    }));
                }
                flow
            }
        }
    }

    async fn on_capture_reopened(
        &mut self,
        result: std::result::Result<Result<Box<dyn CaptureDevice>>, JoinError>,
    ) -> Flow {
        let restarted = match result {
            Ok(Ok(device)) => self.capture.restart(device).await,
            Ok(Err(e)) => Err(e),
            Err(e) => Err(VoiceError::DeviceUnavailable(format!(
                "capture reopen task failed: {}",
                e
            ))),
        };

        match restarted {
            Ok(()) => {
                info!("Capture resumed for session {}", self.info.session_id);
                Flow::Continue
            }
            Err(e) => {
                let terminal = format!("capture device lost: {}", e);
                error!("Session {}: {}", self.info.session_id, terminal);
                self.set_error(terminal.clone());
                self.terminal_error = Some(terminal);
                Flow::Stop
            }
        }
    }

    /// Record `error` in the status and feed it to the resilience engine
    fn escalate(&mut self, error: VoiceError) -> Flow {
        self.set_error(error.to_string());
        match error.kind() {
            Some(kind) => {
                let action = self.engine.record_error(kind, error.to_string(), Instant::now());
                self.apply(action)
            }
            None => Flow::Continue,
        }
    }

    fn apply(&mut self, action: Option<RecoveryAction>) -> Flow {
        match action {
            None => Flow::Continue,
            Some(RecoveryAction::RecoverAudioDevice) => {
                if let Some(playback) = &self.playback {
                    playback.recover_device();
                }
                Flow::Continue
            }
            Some(RecoveryAction::Reconnect { attempt, delay }) => {
                debug!("Reconnect attempt {} scheduled in {:?}", attempt, delay);
                self.reconnect_at = Some(Instant::now() + delay);
                Flow::Continue
            }
            Some(RecoveryAction::GiveUp { attempts }) => {
                let terminal = VoiceError::RecoveryExhausted { attempts }.to_string();
                error!("Session {}: {}", self.info.session_id, terminal);
                self.set_error(terminal.clone());
                self.terminal_error = Some(terminal);
                Flow::Stop
            }
        }
    }

    fn start_reconnect(&mut self) {
        if self.reconnecting.is_some() {
            return;
        }
        let transport = self.transport.clone();
        let url = self.url.clone();
        self.reconnecting = Some(tokio::spawn(async move { transport.open(&url).await }));
    }

    fn on_reconnect_result(&mut self, result: std::result::Result<Result<u64>, JoinError>) -> Flow {
        match result {
            Ok(Ok(generation)) => {
                info!("Channel {} reopened", generation);
                self.engine.reconnect_succeeded();
                self.transport.send(ClientMessage::Command {
                    command: ControlCommand::Reconnect,
                });
                Flow::Continue
            }
            Ok(Err(e)) => {
                warn!("Reconnect failed: {}", e);
                self.set_error(e.to_string());
                let action = self.engine.reconnect_failed(Instant::now());
                self.apply(Some(action))
            }
            Err(e) => {
                warn!("Reconnect task failed: {}", e);
                let action = self.engine.reconnect_failed(Instant::now());
                self.apply(Some(action))
            }
        }
    }

    fn set_error(&mut self, message: String) {
        self.status.send_modify(|s| s.last_error = Some(message));
    }

    fn publish(&self) {
        let connection = self.transport.state();
        let recovery = self.engine.channel_state();
        let attempts = self.engine.attempts();
        let frames_sent = self.capture_counters.sent();
        let chunks_played = self.playback_counters.played();
        let chunks_evicted = self.playback_counters.evicted();

        self.status.send_modify(|s| {
            s.connection = connection;
            s.recovery = recovery;
            s.reconnect_attempts = attempts;
            s.frames_sent = frames_sent;
            s.chunks_played = chunks_played;
            s.chunks_evicted = chunks_evicted;
        });
    }

    /// Best-effort shutdown; every step runs even if an earlier one failed
    async fn teardown(&mut self) {
        info!("Stopping voice session {}", self.info.session_id);
        self.running = false;
        self.status
            .send_modify(|s| s.lifecycle = LifecycleState::Closing);

        self.reconnect_at = None;
        if let Some(task) = self.reconnecting.take() {
            task.abort();
        }
        if let Some(task) = self.reopening_capture.take() {
            task.abort();
        }

        self.capture.stop().await;
        self.transport.close().await;
        if let Some(playback) = self.playback.take() {
            playback.shutdown().await;
        }
        destroy_quietly(self.api.as_ref(), &self.info.session_id).await;

        self.publish();
        self.status
            .send_modify(|s| s.lifecycle = LifecycleState::Closed);
        info!("Voice session {} stopped", self.info.session_id);
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn join_task<T>(task: &mut Option<JoinHandle<T>>) -> std::result::Result<T, JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}
