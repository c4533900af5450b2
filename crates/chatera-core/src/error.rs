//! Common error types for chatera.

use crate::ids::{ConversationId, MessageId};
use thiserror::Error;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the in-memory conversation state.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No conversation with the specified ID is known locally.
    #[error("conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    /// No message with the specified ID exists in the log.
    #[error("message not found: {0}")]
    MessageNotFound(MessageId),

    /// The message exists but is not an assistant message.
    #[error("message is not an assistant message: {0}")]
    NotAssistant(MessageId),

    /// An invalid identifier was provided.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] crate::ids::IdError),
}
