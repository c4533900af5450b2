//! Conversation data model.
//!
//! These types mirror what the chat service persists and what the streaming engine
//! mutates while an answer is being produced.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::ids::{CodeBlockId, ConversationId, MessageId};

// =============================================================================
// Conversation
// =============================================================================

/// A persisted conversation ("session" on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Server-assigned identifier.
    pub id: ConversationId,
    /// Display title.
    pub title: String,
    /// Creation or last-update timestamp as sent by the service.
    #[serde(default)]
    pub timestamp: String,
    /// Whether the conversation is pinned to the top of the list.
    #[serde(default)]
    pub is_pinned: bool,
}

impl Conversation {
    /// Parse the timestamp, accepting RFC 3339 and naive ISO-8601 (assumed UTC).
    #[must_use]
    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(&self.timestamp) {
            return Some(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&self.timestamp, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }
}

// =============================================================================
// Code Blocks
// =============================================================================

/// A fenced code region recognised inside an assistant message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeBlock {
    /// Stable identifier derived from the owning message and ordinal.
    pub id: CodeBlockId,
    /// Conversation the owning message belongs to, once known.
    pub conversation_id: Option<ConversationId>,
    /// Owning message.
    pub message_id: MessageId,
    /// Language tag from the opening fence (may be empty).
    pub language: String,
    /// Code between the fences.
    pub content: String,
    /// False while the closing fence has not arrived yet.
    pub is_complete: bool,
}

impl CodeBlock {
    /// File extension conventionally used for the block's language.
    #[must_use]
    pub fn file_extension(&self) -> &'static str {
        match self.language.to_ascii_lowercase().as_str() {
            "html" => "html",
            "javascript" => "js",
            "typescript" => "ts",
            "python" => "py",
            "dockerfile" => "Dockerfile",
            "css" => "css",
            "json" => "json",
            "markdown" => "md",
            _ => "txt",
        }
    }

    /// File name offered when the block is exported.
    #[must_use]
    pub fn suggested_file_name(&self) -> String {
        format!("code-block.{}", self.file_extension())
    }

    /// Whether a viewer can render the block instead of showing source.
    #[must_use]
    pub fn is_renderable(&self) -> bool {
        self.language.eq_ignore_ascii_case("html")
    }
}

// =============================================================================
// Messages
// =============================================================================

/// A message typed by the user. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserMessage {
    /// Message identifier.
    pub id: MessageId,
    /// Message text.
    pub text: String,
}

/// A message produced by the assistant, mutable while its stream is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantMessage {
    /// Message identifier.
    pub id: MessageId,
    /// Accumulated answer text.
    pub text: String,
    /// Progress strings received while the answer was composed.
    pub thinking_events: Vec<String>,
    /// Whether the thinking trace is expanded.
    pub thinking_visible: bool,
    /// Code blocks derived from `text`.
    pub code_blocks: Vec<CodeBlock>,
    /// Whether code blocks are offered in a side surface instead of inline.
    pub canvas_mode: bool,
    /// Set when `text` holds an error description instead of an answer.
    pub is_error: bool,
}

impl AssistantMessage {
    /// An empty placeholder awaiting its first token.
    #[must_use]
    pub fn placeholder(canvas_mode: bool) -> Self {
        Self {
            id: MessageId::generate(),
            text: String::new(),
            thinking_events: Vec::new(),
            thinking_visible: false,
            code_blocks: Vec::new(),
            canvas_mode,
            is_error: false,
        }
    }
}

/// One entry of a conversation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Message typed by the user.
    User(UserMessage),
    /// Message produced by the assistant.
    Assistant(AssistantMessage),
}

impl Message {
    /// The message identifier.
    #[must_use]
    pub fn id(&self) -> &MessageId {
        match self {
            Self::User(m) => &m.id,
            Self::Assistant(m) => &m.id,
        }
    }

    /// The message text.
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::User(m) => &m.text,
            Self::Assistant(m) => &m.text,
        }
    }

    /// The message role.
    #[must_use]
    pub const fn role(&self) -> Role {
        match self {
            Self::User(_) => Role::User,
            Self::Assistant(_) => Role::Assistant,
        }
    }

    /// Borrow the assistant payload, if this is an assistant message.
    #[must_use]
    pub fn as_assistant(&self) -> Option<&AssistantMessage> {
        match self {
            Self::Assistant(m) => Some(m),
            Self::User(_) => None,
        }
    }

    /// Check if this is an assistant message.
    #[must_use]
    pub const fn is_assistant(&self) -> bool {
        matches!(self, Self::Assistant(_))
    }
}

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// The human side of the conversation.
    #[serde(rename = "user")]
    User,
    /// The language model.
    #[serde(rename = "ai", alias = "assistant")]
    Assistant,
}

/// A message as returned by the history endpoint.
///
/// Older records carry only `type` and `text`; everything else is optional and
/// synthesized when the log is rebuilt.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMessage {
    /// Author of the message.
    #[serde(rename = "type")]
    pub role: Role,
    /// Persisted identifier, if any.
    #[serde(default)]
    pub id: Option<String>,
    /// Message text.
    #[serde(default)]
    pub text: String,
    /// Persisted thinking trace, if any.
    #[serde(default)]
    pub thinking_events: Option<Vec<String>>,
    /// Persisted trace visibility.
    #[serde(default)]
    pub is_thinking_visible: bool,
    /// Persisted canvas-mode flag.
    #[serde(default)]
    pub canvas_mode: bool,
}

// =============================================================================
// Side-channel Status Events
// =============================================================================

/// Kind of a side-channel signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusKind {
    /// Progress update while an answer is being composed.
    Status,
    /// Error reported by the service out of band.
    Error,
    /// Corrected title for the conversation.
    TitleUpdate,
}

/// A status, error or title notice received on the side channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    /// Signal kind.
    pub kind: StatusKind,
    /// Human-readable payload (the new title for `TitleUpdate`).
    pub message: String,
    /// Emission timestamp as sent by the service, normalised to a string.
    pub timestamp: Option<String>,
}

impl StatusEvent {
    /// A `status` event.
    #[must_use]
    pub fn status(message: impl Into<String>, timestamp: Option<String>) -> Self {
        Self {
            kind: StatusKind::Status,
            message: message.into(),
            timestamp,
        }
    }

    /// Key used to discard repeated deliveries of the same event.
    #[must_use]
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            timestamp: self.timestamp.clone(),
            message: self.message.clone(),
        }
    }
}

/// The `(timestamp, message)` pair identifying a status event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    /// Emission timestamp.
    pub timestamp: Option<String>,
    /// Message text.
    pub message: String,
}

/// Deserialize a timestamp sent either as a JSON string or a JSON number.
///
/// # Errors
///
/// Fails for any JSON type other than string, number or null.
pub fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Integer(i64),
        Float(f64),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Text(s) => s,
        Raw::Integer(n) => n.to_string(),
        Raw::Float(f) => f.to_string(),
    }))
}
