//! Incremental decoding of a query response body.
//!
//! The body is a sequence of newline-terminated lines. Lines starting with `data:`
//! carry a JSON frame `{"event": "token" | "end" | "error", "data": "..."}`; every
//! other line is ignored. Chunks may split lines (and multi-byte characters)
//! anywhere, so bytes are buffered until a line terminator arrives.

use chatera_core::ConversationStore;
use serde::Deserialize;
use tracing::{debug, warn};

/// A decoded stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A piece of answer text.
    Token(String),
    /// The answer is complete.
    End,
    /// The service failed to produce the answer.
    Error(String),
}

/// Lifecycle of a single query stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    /// Not started.
    #[default]
    Idle,
    /// Request sent, response not yet open.
    Requesting,
    /// Body is being received.
    Streaming,
    /// The answer finished.
    Completed,
    /// The answer failed or was abandoned.
    Failed,
}

impl StreamState {
    /// Whether the state can no longer change.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Receiver of decoded stream events.
pub trait StreamHandler {
    /// A token arrived.
    fn on_token(&mut self, delta: &str);
    /// The stream completed.
    fn on_complete(&mut self);
    /// The stream failed with a message.
    fn on_error(&mut self, message: &str);
}

impl StreamHandler for ConversationStore {
    fn on_token(&mut self, delta: &str) {
        self.apply_token(delta);
    }

    fn on_complete(&mut self) {
        self.finalize();
    }

    fn on_error(&mut self, message: &str) {
        self.fail(message);
    }
}

#[derive(Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

impl Frame {
    fn data_text(self) -> String {
        match self.data {
            Some(serde_json::Value::String(s)) => s,
            Some(serde_json::Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }
}

/// Parse one complete line into an event.
///
/// Returns `None` for non-data lines, empty payloads, malformed JSON and unknown
/// event kinds.
#[must_use]
pub fn parse_line(line: &str) -> Option<StreamEvent> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload.is_empty() {
        return None;
    }

    let frame: Frame = match serde_json::from_str(payload) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, payload, "skipping malformed stream frame");
            return None;
        }
    };

    match frame.event.as_str() {
        "token" => Some(StreamEvent::Token(frame.data_text())),
        "end" => Some(StreamEvent::End),
        "error" => Some(StreamEvent::Error(frame.data_text())),
        other => {
            debug!(event = other, "ignoring unknown stream event");
            None
        }
    }
}

/// Decoder and state machine for one query stream.
#[derive(Debug, Default)]
pub struct StreamIngestor {
    buffer: Vec<u8>,
    state: StreamState,
}

impl StreamIngestor {
    /// A new ingestor in the `Idle` state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Mark the request as sent.
    pub fn begin(&mut self) {
        if self.state == StreamState::Idle {
            self.state = StreamState::Requesting;
        }
    }

    /// Mark the response body as open.
    pub fn opened(&mut self) {
        if matches!(self.state, StreamState::Idle | StreamState::Requesting) {
            self.state = StreamState::Streaming;
        }
    }

    /// Decode a chunk, returning the events of every line it completes.
    ///
    /// Nothing is decoded once the stream is terminal; the first `end` or `error`
    /// event makes it terminal and discards whatever follows.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.state.is_terminal() {
            return events;
        }
        self.opened();
        self.buffer.extend_from_slice(chunk);

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let decoded = String::from_utf8_lossy(&raw[..pos]);
            let line = decoded.strip_suffix('\r').unwrap_or(&decoded);

            let Some(event) = parse_line(line) else {
                continue;
            };
            match event {
                StreamEvent::End => self.state = StreamState::Completed,
                StreamEvent::Error(_) => self.state = StreamState::Failed,
                StreamEvent::Token(_) => {}
            }
            events.push(event);
            if self.state.is_terminal() {
                self.buffer.clear();
                break;
            }
        }
        events
    }

    /// Decode a chunk and dispatch its events to `handler`.
    pub fn ingest(&mut self, chunk: &[u8], handler: &mut impl StreamHandler) -> StreamState {
        for event in self.feed(chunk) {
            dispatch(&event, handler);
        }
        self.state
    }

    /// The body ended.
    ///
    /// A stream that closes without an `end` frame counts as completed. A trailing
    /// line without a terminator is discarded.
    pub fn finish(&mut self, handler: &mut impl StreamHandler) -> StreamState {
        if self.state.is_terminal() {
            return self.state;
        }
        if !self.buffer.is_empty() {
            debug!(bytes = self.buffer.len(), "discarding unterminated trailing line");
            self.buffer.clear();
        }
        self.state = StreamState::Completed;
        handler.on_complete();
        self.state
    }

    /// The transport failed before or during the body.
    pub fn fail(&mut self, message: &str, handler: &mut impl StreamHandler) -> StreamState {
        if self.state.is_terminal() {
            return self.state;
        }
        self.buffer.clear();
        self.state = StreamState::Failed;
        handler.on_error(message);
        self.state
    }

    /// Stop consuming without reporting to the handler.
    pub fn abandon(&mut self) {
        if !self.state.is_terminal() {
            self.buffer.clear();
            self.state = StreamState::Failed;
        }
    }
}

fn dispatch(event: &StreamEvent, handler: &mut impl StreamHandler) {
    match event {
        StreamEvent::Token(delta) => handler.on_token(delta),
        StreamEvent::End => handler.on_complete(),
        StreamEvent::Error(message) => handler.on_error(message),
    }
}
