//! Error types for the conversation engine.

use chatera_core::CoreError;
use thiserror::Error;

/// A result type using `ClientError`.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors raised while talking to the chat service.
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// The service's `detail` message.
        message: String,
    },

    /// Failed to parse a response.
    #[error("Failed to parse response: {0}")]
    Parse(String),

    /// The query stream reported an error or broke mid-answer.
    #[error("Stream error: {0}")]
    Stream(String),

    /// The side channel could not connect or failed while open.
    #[error("Channel error: {0}")]
    Channel(String),

    /// The operation was cancelled by a conversation switch or the caller.
    #[error("Cancelled")]
    Cancelled,

    /// Local conversation state rejected the operation.
    #[error(transparent)]
    Core(#[from] CoreError),
}
