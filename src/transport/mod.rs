//! Transport/session channel
//!
//! JSON envelopes over a websocket, one live channel per session. Reconnects
//! replace the channel; every event carries the generation of the channel it
//! came from so late events from a replaced channel can be told apart.

pub mod channel;
pub mod messages;

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::debug;

use crate::audio::capture::FrameSink;
use crate::config::TransportConfig;
use crate::error::Result;

pub use channel::{
    Channel, ChannelEvent, ChannelEventKind, ConnectionState, ABNORMAL_CLOSURE, NORMAL_CLOSURE,
};
pub use messages::{ClientMessage, ControlCommand, InboundAudio, ServerMessage};

#[derive(Default)]
struct TransportInner {
    channel: Option<Channel>,
    generation: u64,
}

/// Owns the session's single live channel
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Mutex<TransportInner>>,
    config: TransportConfig,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl Transport {
    pub fn new(config: TransportConfig, events: mpsc::UnboundedSender<ChannelEvent>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TransportInner::default())),
            config,
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TransportInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Open a channel to `url`, replacing the current one. Returns the new
    /// channel's generation.
    pub async fn open(&self, url: &str) -> Result<u64> {
        let (generation, previous) = {
            let mut inner = self.lock();
            inner.generation += 1;
            (inner.generation, inner.channel.take())
        };

        if let Some(old) = previous {
            debug!("Replacing channel {}", old.generation());
            drop(old);
        }

        let channel = Channel::connect(url, generation, &self.config, self.events.clone()).await?;

        let mut inner = self.lock();
        if inner.generation == generation {
            inner.channel = Some(channel);
        } else {
            // a newer open started meanwhile; this channel is already stale
            debug!("Discarding stale channel {}", generation);
        }
        Ok(generation)
    }

    /// Send if the channel is open; otherwise the message is dropped
    pub fn send(&self, message: ClientMessage) -> bool {
        self.lock()
            .channel
            .as_ref()
            .map(|channel| channel.send(message))
            .unwrap_or(false)
    }

    pub fn state(&self) -> ConnectionState {
        self.lock()
            .channel
            .as_ref()
            .map(|channel| channel.state())
            .unwrap_or(ConnectionState::Idle)
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Close the current channel with a normal closure
    pub async fn close(&self) {
        let channel = self.lock().channel.take();
        if let Some(channel) = channel {
            channel.close().await;
        }
    }
}

impl FrameSink for Transport {
    fn submit(&self, message: ClientMessage) -> bool {
        self.send(message)
    }
}
