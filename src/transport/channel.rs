use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use super::messages::{ClientMessage, ServerMessage};
use crate::config::TransportConfig;
use crate::error::{ErrorKind, Result, VoiceError};

/// Close code for an intentional, clean shutdown
pub const NORMAL_CLOSURE: u16 = 1000;

/// Reported when the connection dropped without a close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Close frame received without a status code
pub const NO_STATUS_RECEIVED: u16 = 1005;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,
    Connecting = 1,
    Open = 2,
    Closing = 3,
    Closed = 4,
    Failed = 5,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Open,
            3 => ConnectionState::Closing,
            4 => ConnectionState::Closed,
            5 => ConnectionState::Failed,
            _ => ConnectionState::Idle,
        }
    }
}

/// Something that happened on one channel.
///
/// `generation` identifies the channel; events from a channel that has since
/// been replaced are stale and should be ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub generation: u64,
    pub kind: ChannelEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEventKind {
    Message(ServerMessage),
    /// The channel is gone; `code` is the close code (1006 if none arrived)
    Closed { code: u16 },
    Error { kind: ErrorKind, message: String },
}

#[derive(Debug)]
enum Outbound {
    Message(ClientMessage),
    Close,
}

#[derive(Debug, Clone)]
struct SharedState(Arc<AtomicU8>);

impl SharedState {
    fn new(state: ConnectionState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Move `from` -> `to` only if still in `from`
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// One websocket connection to the voice service.
///
/// A writer task serializes outbound messages and sends the keepalive
/// `ping`; a reader task parses inbound frames and reports them as
/// [`ChannelEvent`]s. Dropping the channel aborts both.
pub struct Channel {
    generation: u64,
    state: SharedState,
    outbound: mpsc::Sender<Outbound>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl Channel {
    pub async fn connect(
        url: &str,
        generation: u64,
        config: &TransportConfig,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Result<Self> {
        let state = SharedState::new(ConnectionState::Connecting);
        info!("Connecting to {} (channel {})", url, generation);

        let stream = match timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url)).await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                state.set(ConnectionState::Failed);
                return Err(VoiceError::Channel {
                    kind: classify(&e),
                    message: format!("connect to {} failed: {}", url, e),
                });
            }
            Err(_) => {
                state.set(ConnectionState::Failed);
                return Err(VoiceError::network(format!(
                    "connect to {} timed out after {:?}",
                    url, CONNECT_TIMEOUT
                )));
            }
        };

        let (mut sink, mut source) = stream.split();
        let (tx, mut rx) = mpsc::channel::<Outbound>(config.outbound_buffer.max(1));
        state.set(ConnectionState::Open);
        info!("Channel {} open", generation);

        let period = config.keepalive_interval();
        let writer_state = state.clone();
        let writer_events = events.clone();
        let writer = tokio::spawn(async move {
            let mut keepalive = interval_at(Instant::now() + period, period);
            keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let outgoing = tokio::select! {
                    item = rx.recv() => match item {
                        Some(Outbound::Message(message)) => message,
                        Some(Outbound::Close) | None => {
                            writer_state.set(ConnectionState::Closing);
                            let frame = CloseFrame {
                                code: CloseCode::Normal,
                                reason: "session stopped".into(),
                            };
                            if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                                debug!("Close frame not sent: {}", e);
                            }
                            break;
                        }
                    },
                    _ = keepalive.tick() => ClientMessage::Ping,
                };

                let text = match serde_json::to_string(&outgoing) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to serialize {} message: {}", outgoing.kind(), e);
                        continue;
                    }
                };

                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!("Channel {} send failed: {}", generation, e);
                    let _ = writer_events.send(ChannelEvent {
                        generation,
                        kind: ChannelEventKind::Error {
                            kind: classify(&e),
                            message: e.to_string(),
                        },
                    });
                    break;
                }
            }
            debug!("Channel {} writer stopped", generation);
        });

        let reader_state = state.clone();
        let reader = tokio::spawn(async move {
            let mut close_code = None;

            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => match ServerMessage::parse(&text) {
                        Ok(message) => {
                            if let ServerMessage::Pong = message {
                                debug!("pong on channel {}", generation);
                            }
                            let _ = events.send(ChannelEvent {
                                generation,
                                kind: ChannelEventKind::Message(message),
                            });
                        }
                        Err(e) => warn!("Ignoring malformed frame: {}", e),
                    },
                    Ok(Message::Close(frame)) => {
                        close_code = Some(
                            frame
                                .map(|f| u16::from(f.code))
                                .unwrap_or(NO_STATUS_RECEIVED),
                        );
                        break;
                    }
                    Ok(Message::Binary(data)) => {
                        debug!("Ignoring {} byte binary frame", data.len());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Channel {} receive failed: {}", generation, e);
                        let _ = events.send(ChannelEvent {
                            generation,
                            kind: ChannelEventKind::Error {
                                kind: classify(&e),
                                message: e.to_string(),
                            },
                        });
                        break;
                    }
                }
            }

            let code = close_code.unwrap_or(ABNORMAL_CLOSURE);
            let intentional = reader_state.get() == ConnectionState::Closing;
            if intentional || code == NORMAL_CLOSURE {
                reader_state.set(ConnectionState::Closed);
            } else {
                reader_state.set(ConnectionState::Failed);
            }
            info!("Channel {} closed (code {})", generation, code);
            let _ = events.send(ChannelEvent {
                generation,
                kind: ChannelEventKind::Closed { code },
            });
        });

        Ok(Self {
            generation,
            state,
            outbound: tx,
            writer,
            reader,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Queue a message. Returns false (message dropped) unless the channel
    /// is open and the writer has room.
    pub fn send(&self, message: ClientMessage) -> bool {
        if self.state.get() != ConnectionState::Open {
            return false;
        }
        match self.outbound.try_send(Outbound::Message(message)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(Outbound::Message(m))) => {
                debug!("Outbound buffer full, dropping {} message", m.kind());
                false
            }
            Err(_) => false,
        }
    }

    /// Send a normal close after any queued messages and wait for both tasks
    pub async fn close(mut self) {
        if self
            .state
            .transition(ConnectionState::Open, ConnectionState::Closing)
        {
            if self.outbound.send(Outbound::Close).await.is_err() {
                debug!("Channel {} writer already gone", self.generation);
            }
        } else {
            // already closed by the peer or failed; nothing left to flush
            self.writer.abort();
        }

        if timeout(CLOSE_TIMEOUT, &mut self.writer).await.is_err() {
            self.writer.abort();
        }
        if timeout(CLOSE_TIMEOUT, &mut self.reader).await.is_err() {
            self.reader.abort();
        }
        if self.state.get() != ConnectionState::Failed {
            self.state.set(ConnectionState::Closed);
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
    }
}

/// I/O failures are network errors; everything else is a protocol error
fn classify(error: &WsError) -> ErrorKind {
    match error {
        WsError::Io(_) => ErrorKind::Network,
        _ => ErrorKind::WebSocket,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        for state in [
            ConnectionState::Idle,
            ConnectionState::Connecting,
            ConnectionState::Open,
            ConnectionState::Closing,
            ConnectionState::Closed,
            ConnectionState::Failed,
        ] {
            assert_eq!(ConnectionState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_transition_only_from_expected_state() {
        let state = SharedState::new(ConnectionState::Failed);
        assert!(!state.transition(ConnectionState::Open, ConnectionState::Closing));
        assert_eq!(state.get(), ConnectionState::Failed);
    }

    #[test]
    fn test_io_errors_are_network() {
        let io = WsError::Io(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"));
        assert_eq!(classify(&io), ErrorKind::Network);
        assert_eq!(classify(&WsError::ConnectionClosed), ErrorKind::WebSocket);
    }
}
