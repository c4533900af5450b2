//! The auto-reconnecting side channel.
//!
//! An [`EventChannel`] follows one channel id at a time (a conversation or an upload
//! batch). A supervisor task connects, forwards decoded messages and reconnects after
//! unexpected closures with a delay of `base * attempt`, giving up after the
//! configured number of consecutive failed connections.
//!
//! Every event is tagged with the generation of the subscription that produced it.
//! Re-subscribing bumps the generation, so events still in flight for the previous
//! channel are discarded by [`EventChannel::recv`].

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatera_core::types::deserialize_timestamp;
use chatera_core::{ChannelId, StatusEvent, StatusKind, UploadProgress};
use futures::stream::BoxStream;
use futures::{future, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

/// Text frames of one connection; the stream ends when the connection closes.
pub type FrameStream = BoxStream<'static, Result<String>>;

/// Opens side-channel connections.
///
/// This trait abstracts the transport, allowing for scripted implementations in tests.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Connect to `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    async fn connect(&self, url: &str) -> Result<FrameStream>;
}

/// WebSocket connector built on tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl ChannelConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<FrameStream> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| ClientError::Channel(e.to_string()))?;

        let frames = ws_stream
            .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    // Ignore control frames and binary messages
                    Ok(_) => None,
                    Err(e) => Some(Err(ClientError::Channel(e.to_string()))),
                })
            });
        Ok(frames.boxed())
    }
}

/// Connection state of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    /// Not connected and not trying to.
    #[default]
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Connected and receiving.
    Connected,
    /// Waiting to retry after an unexpected closure.
    Reconnecting,
}

/// Messages sent by the service on a channel.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Progress of the answer being composed.
    Status {
        /// Human-readable progress text.
        #[serde(default)]
        message: String,
        /// Emission time.
        #[serde(default, deserialize_with = "deserialize_timestamp")]
        timestamp: Option<String>,
    },
    /// Out-of-band failure notice.
    Error {
        /// Human-readable error text.
        #[serde(default)]
        message: String,
        /// Emission time.
        #[serde(default, deserialize_with = "deserialize_timestamp")]
        timestamp: Option<String>,
    },
    /// Corrected conversation title.
    TitleUpdate {
        /// The new title.
        new_title: String,
    },
    /// Document ingestion progress.
    UploadProgress(UploadProgress),
    /// Anything else.
    #[serde(other)]
    Unknown,
}

/// Events delivered to the channel's consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A status or error notice.
    Status(StatusEvent),
    /// A corrected title for the subscribed conversation.
    TitleUpdate(String),
    /// Ingestion progress for a document.
    UploadProgress(UploadProgress),
    /// The connection state changed.
    StateChanged(ChannelState),
}

impl ChannelEvent {
    /// Decode a text frame. Malformed and unknown messages yield `None`.
    #[must_use]
    pub fn decode(text: &str) -> Option<Self> {
        let message = match serde_json::from_str::<InboundMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "skipping malformed channel message");
                return None;
            }
        };

        match message {
            InboundMessage::Status { message, timestamp } => Some(Self::Status(StatusEvent {
                kind: StatusKind::Status,
                message,
                timestamp,
            })),
            InboundMessage::Error { message, timestamp } => Some(Self::Status(StatusEvent {
                kind: StatusKind::Error,
                message,
                timestamp,
            })),
            InboundMessage::TitleUpdate { new_title } => Some(Self::TitleUpdate(new_title)),
            InboundMessage::UploadProgress(progress) => Some(Self::UploadProgress(progress)),
            InboundMessage::Unknown => {
                debug!("ignoring unknown channel message");
                None
            }
        }
    }
}

#[derive(Debug)]
struct Envelope {
    generation: u64,
    event: ChannelEvent,
}

struct Subscription {
    channel: ChannelId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// A reconnecting channel following one channel id at a time.
pub struct EventChannel {
    connector: Arc<dyn ChannelConnector>,
    config: ClientConfig,
    generation: Arc<AtomicU64>,
    attempts: Arc<AtomicU32>,
    state: watch::Sender<ChannelState>,
    events_tx: mpsc::Sender<Envelope>,
    events_rx: mpsc::Receiver<Envelope>,
    active: Option<Subscription>,
}

impl EventChannel {
    /// Create an idle channel.
    #[must_use]
    pub fn new(connector: Arc<dyn ChannelConnector>, config: &ClientConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(128);
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Self {
            connector,
            config: config.clone(),
            generation: Arc::new(AtomicU64::new(0)),
            attempts: Arc::new(AtomicU32::new(0)),
            state,
            events_tx,
            events_rx,
            active: None,
        }
    }

    /// Follow `channel`, tearing down any previous subscription first.
    ///
    /// Subscribing to the channel already followed keeps the live connection, unless
    /// its supervisor has given up.
    pub fn subscribe(&mut self, channel: ChannelId) {
        if self
            .active
            .as_ref()
            .is_some_and(|s| s.channel == channel && !s.task.is_finished())
        {
            return;
        }
        self.unsubscribe();

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.attempts.store(0, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let url = self.config.channel_url(&channel);
        info!(channel = %channel, "subscribing to event channel");

        let supervisor = Supervisor {
            connector: Arc::clone(&self.connector),
            url,
            channel: channel.clone(),
            generation,
            current_generation: Arc::clone(&self.generation),
            attempts: Arc::clone(&self.attempts),
            max_attempts: self.config.max_reconnect_attempts,
            base_delay: self.config.reconnect_delay(),
            state: self.state.clone(),
            events: self.events_tx.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(supervisor.run());

        self.active = Some(Subscription {
            channel,
            cancel,
            task,
        });
    }

    /// Close the current subscription, if any. Pending events for it are discarded.
    pub fn unsubscribe(&mut self) {
        let Some(subscription) = self.active.take() else {
            return;
        };
        debug!(channel = %subscription.channel, "closing event channel");
        subscription.cancel.cancel();
        subscription.task.abort();
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(ChannelState::Disconnected);
    }

    /// The channel currently followed.
    #[must_use]
    pub fn channel(&self) -> Option<&ChannelId> {
        self.active.as_ref().map(|s| &s.channel)
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Watch connection state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    /// Reconnect attempts made for the current subscription since the last
    /// connection that delivered a message.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Wait for the next event of the current subscription.
    ///
    /// Returns `None` only if the channel has been dropped.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        loop {
            let envelope = self.events_rx.recv().await?;
            if envelope.generation == self.generation.load(Ordering::SeqCst) {
                return Some(envelope.event);
            }
            debug!(generation = envelope.generation, "dropping stale channel event");
        }
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("channel", &self.channel())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct Supervisor {
    connector: Arc<dyn ChannelConnector>,
    url: String,
    channel: ChannelId,
    generation: u64,
    current_generation: Arc<AtomicU64>,
    attempts: Arc<AtomicU32>,
    max_attempts: u32,
    base_delay: Duration,
    state: watch::Sender<ChannelState>,
    events: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(self) {
        let mut attempt: u32 = 0;
        self.set_state(ChannelState::Connecting).await;

        loop {
            let connected = tokio::select! {
                () = self.cancel.cancelled() => return,
                result = self.connector.connect(&self.url) => result,
            };

            match connected {
                Ok(frames) => {
                    self.set_state(ChannelState::Connected).await;
                    match self.pump(frames).await {
                        None => return,
                        Some(true) => attempt = 0,
                        Some(false) => {}
                    }
                }
                Err(e) => warn!(channel = %self.channel, error = %e, "event channel connect failed"),
            }

            if self.cancel.is_cancelled() {
                return;
            }
            if attempt >= self.max_attempts {
                info!(channel = %self.channel, attempts = attempt, "event channel giving up");
                self.set_state(ChannelState::Disconnected).await;
                return;
            }

            attempt += 1;
            self.attempts.store(attempt, Ordering::SeqCst);
            self.set_state(ChannelState::Reconnecting).await;
            info!(channel = %self.channel, attempt, "reconnecting event channel");

            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(self.base_delay * attempt) => {}
            }
        }
    }

    /// Forward frames until the connection closes.
    ///
    /// Returns `None` when cancelled, otherwise whether any frame was received.
    async fn pump(&self, mut frames: FrameStream) -> Option<bool> {
        let mut delivered = false;
        loop {
            let frame = tokio::select! {
                () = self.cancel.cancelled() => return None,
                frame = frames.next() => frame,
            };
            match frame {
                Some(Ok(text)) => {
                    delivered = true;
                    if let Some(event) = ChannelEvent::decode(&text) {
                        if !self.emit(event).await {
                            return None;
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(channel = %self.channel, error = %e, "event channel read failed");
                    return Some(delivered);
                }
                None => {
                    debug!(channel = %self.channel, "event channel closed");
                    return Some(delivered);
                }
            }
        }
    }

    async fn set_state(&self, state: ChannelState) {
        if self.current_generation.load(Ordering::SeqCst) != self.generation {
            return;
        }
        self.state.send_replace(state);
        self.emit(ChannelEvent::StateChanged(state)).await;
    }

    async fn emit(&self, event: ChannelEvent) -> bool {
        self.events
            .send(Envelope {
                generation: self.generation,
                event,
            })
            .await
            .is_ok()
    }
}
