//! The append-mostly message log of one conversation.
//!
//! Every mutation replaces the affected message with a new `Arc` and swaps the log
//! vector via [`Arc::make_mut`], so a snapshot handed to a renderer never changes
//! underneath it and pointer comparison is enough to detect updates.
//!
//! Token and status mutations only ever target the tail of the log, and only while
//! the tail is the assistant message opened by the current stream. Anything else is
//! dropped, which keeps a superseded stream from writing into a freshly loaded
//! conversation.

use std::sync::Arc;

use tracing::debug;

use crate::codeblock::extract_code_blocks;
use crate::error::{CoreError, Result};
use crate::ids::{ConversationId, MessageId};
use crate::types::{
    AssistantMessage, DedupKey, HistoryMessage, Message, Role, StatusEvent, StatusKind,
    UserMessage,
};

/// An immutable snapshot of the log.
pub type MessageLog = Arc<Vec<Arc<Message>>>;

/// Message log plus the bookkeeping needed to apply stream and channel events.
#[derive(Debug, Clone, Default)]
pub struct ConversationStore {
    conversation_id: Option<ConversationId>,
    log: MessageLog,
    /// Assistant message currently accepting tokens.
    open: Option<MessageId>,
    /// Key of the last status event applied to the open message.
    last_status: Option<DedupKey>,
}

impl ConversationStore {
    /// An empty store not yet bound to a server-side conversation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty store for an existing conversation.
    #[must_use]
    pub fn for_conversation(id: ConversationId) -> Self {
        Self {
            conversation_id: Some(id),
            ..Self::default()
        }
    }

    /// The conversation this log belongs to, if it has been created yet.
    #[must_use]
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.conversation_id.as_ref()
    }

    /// Bind the log to a conversation id minted after the first message was typed.
    ///
    /// Code blocks already extracted from the tail are re-stamped with the id.
    pub fn bind_conversation(&mut self, id: ConversationId) {
        self.conversation_id = Some(id);
        let Some(tail) = self.tail_assistant().cloned() else {
            return;
        };
        let mut updated = tail;
        for block in &mut updated.code_blocks {
            block.conversation_id.clone_from(&self.conversation_id);
        }
        self.replace_tail(updated);
    }

    /// A cheap snapshot of the current log.
    #[must_use]
    pub fn snapshot(&self) -> MessageLog {
        Arc::clone(&self.log)
    }

    /// All messages in order.
    #[must_use]
    pub fn messages(&self) -> &[Arc<Message>] {
        &self.log
    }

    /// The last message of the log.
    #[must_use]
    pub fn tail(&self) -> Option<&Message> {
        self.log.last().map(AsRef::as_ref)
    }

    /// Whether an assistant message is currently open for token application.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.open.is_some()
    }

    /// The id of the assistant message currently open for tokens.
    #[must_use]
    pub fn open_message(&self) -> Option<&MessageId> {
        self.open.as_ref()
    }

    /// Append a user message, closing any assistant message still open.
    pub fn append_user(&mut self, text: impl Into<String>) -> MessageId {
        self.finalize();
        let id = MessageId::generate();
        self.push(Message::User(UserMessage {
            id: id.clone(),
            text: text.into(),
        }));
        id
    }

    /// Append an empty assistant message and open it for tokens.
    pub fn append_assistant_placeholder(&mut self, canvas_mode: bool) -> MessageId {
        self.finalize();
        let placeholder = AssistantMessage::placeholder(canvas_mode);
        let id = placeholder.id.clone();
        self.push(Message::Assistant(placeholder));
        self.open = Some(id.clone());
        self.last_status = None;
        id
    }

    /// Append a token delta to the open tail message and re-extract its code blocks.
    ///
    /// Returns `false` (and changes nothing) when no assistant message is open at the
    /// tail.
    pub fn apply_token(&mut self, delta: &str) -> bool {
        let Some(tail) = self.open_tail().cloned() else {
            debug!(len = delta.len(), "dropping token with no open assistant message");
            return false;
        };

        let mut updated = tail;
        updated.text.push_str(delta);
        updated.code_blocks =
            extract_code_blocks(&updated.text, self.conversation_id.as_ref(), &updated.id);
        self.replace_tail(updated);
        true
    }

    /// Append a status or error event to the open tail's thinking trace.
    ///
    /// Title updates are not part of the trace and are ignored. An event whose dedup
    /// key equals the last applied one is dropped.
    pub fn apply_status_event(&mut self, event: &StatusEvent) -> bool {
        if event.kind == StatusKind::TitleUpdate {
            return false;
        }
        let key = event.dedup_key();
        if self.last_status.as_ref() == Some(&key) {
            debug!(message = %event.message, "dropping duplicate status event");
            return false;
        }
        let Some(tail) = self.open_tail().cloned() else {
            debug!(message = %event.message, "dropping status event with no open assistant message");
            return false;
        };

        let mut updated = tail;
        updated.thinking_events.push(event.message.clone());
        self.replace_tail(updated);
        self.last_status = Some(key);
        true
    }

    /// Close the open tail message and mark all of its code blocks complete.
    ///
    /// Returns `false` if nothing was open.
    pub fn finalize(&mut self) -> bool {
        let Some(open) = self.open.take() else {
            return false;
        };
        self.last_status = None;

        let Some(tail) = self.tail_assistant().filter(|m| m.id == open).cloned() else {
            return false;
        };
        if tail.code_blocks.iter().all(|b| b.is_complete) {
            return true;
        }
        let mut updated = tail;
        for block in &mut updated.code_blocks {
            block.is_complete = true;
        }
        self.replace_tail(updated);
        true
    }

    /// Replace the open tail message's text with an inline error and close it.
    pub fn fail(&mut self, error: &str) -> bool {
        let Some(tail) = self.open_tail().cloned() else {
            debug!(error, "dropping failure with no open assistant message");
            self.open = None;
            return false;
        };

        let mut updated = tail;
        updated.text = format!("Error: {error}");
        updated.code_blocks.clear();
        updated.is_error = true;
        self.replace_tail(updated);
        self.open = None;
        self.last_status = None;
        true
    }

    /// Replace the whole log with a conversation's persisted history.
    ///
    /// Missing ids are synthesized, missing thinking traces become empty and code
    /// blocks are re-extracted and marked complete. Any open stream is detached.
    pub fn replace_history(
        &mut self,
        conversation_id: Option<ConversationId>,
        history: Vec<HistoryMessage>,
    ) {
        let messages = history
            .into_iter()
            .map(|entry| {
                let id = entry
                    .id
                    .and_then(|raw| MessageId::new(raw).ok())
                    .unwrap_or_else(MessageId::generate);
                let message = match entry.role {
                    Role::User => Message::User(UserMessage {
                        id,
                        text: entry.text,
                    }),
                    Role::Assistant => {
                        let mut code_blocks =
                            extract_code_blocks(&entry.text, conversation_id.as_ref(), &id);
                        for block in &mut code_blocks {
                            block.is_complete = true;
                        }
                        Message::Assistant(AssistantMessage {
                            id,
                            text: entry.text,
                            thinking_events: entry.thinking_events.unwrap_or_default(),
                            thinking_visible: entry.is_thinking_visible,
                            code_blocks,
                            canvas_mode: entry.canvas_mode,
                            is_error: false,
                        })
                    }
                };
                Arc::new(message)
            })
            .collect();

        self.conversation_id = conversation_id;
        self.log = Arc::new(messages);
        self.open = None;
        self.last_status = None;
    }

    /// Flip the thinking-trace visibility of an assistant message.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MessageNotFound`] if no message has the id and
    /// [`CoreError::NotAssistant`] if it belongs to a user message.
    pub fn toggle_thinking(&mut self, id: &MessageId) -> Result<bool> {
        let index = self
            .log
            .iter()
            .position(|m| m.id() == id)
            .ok_or_else(|| CoreError::MessageNotFound(id.clone()))?;
        let mut updated = self.log[index]
            .as_assistant()
            .cloned()
            .ok_or_else(|| CoreError::NotAssistant(id.clone()))?;

        updated.thinking_visible = !updated.thinking_visible;
        let visible = updated.thinking_visible;
        Arc::make_mut(&mut self.log)[index] = Arc::new(Message::Assistant(updated));
        Ok(visible)
    }

    /// Empty the log and forget the conversation binding.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn push(&mut self, message: Message) {
        Arc::make_mut(&mut self.log).push(Arc::new(message));
    }

    fn tail_assistant(&self) -> Option<&AssistantMessage> {
        self.tail().and_then(Message::as_assistant)
    }

    fn open_tail(&self) -> Option<&AssistantMessage> {
        let open = self.open.as_ref()?;
        self.tail_assistant().filter(|m| &m.id == open)
    }

    fn replace_tail(&mut self, message: AssistantMessage) {
        if let Some(last) = Arc::make_mut(&mut self.log).last_mut() {
            *last = Arc::new(Message::Assistant(message));
        }
    }
}
