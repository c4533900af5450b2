//! Core types and state for the chatera conversation engine.
//!
//! This crate holds everything that does not touch the network:
//!
//! - **Identifiers**: typed ids for conversations, messages, code blocks and channels
//! - **Model**: conversations, messages, code blocks and side-channel status events
//! - **Code-block extraction**: fenced-region scanning over partial markdown
//! - **Conversation store**: the copy-on-write message log fed by token streams
//! - **Conversation list** and **upload tracking** for the surrounding client
//!
//! # Example
//!
//! ```
//! use chatera_core::{ConversationId, ConversationStore};
//!
//! let mut store = ConversationStore::for_conversation(ConversationId::new("c-1").unwrap());
//! store.append_user("Show me a loop");
//! store.append_assistant_placeholder(false);
//! store.apply_token("```py\nfor i in range(3):\n");
//!
//! let tail = store.tail().and_then(|m| m.as_assistant()).unwrap();
//! assert_eq!(tail.code_blocks.len(), 1);
//! assert!(!tail.code_blocks[0].is_complete);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod codeblock;
pub mod conversations;
pub mod error;
pub mod ids;
pub mod store;
pub mod types;
pub mod upload;

pub use codeblock::{extract_code_blocks, fence_count};
pub use conversations::ConversationList;
pub use error::{CoreError, Result};
pub use ids::{ChannelId, CodeBlockId, ConversationId, IdError, MessageId};
pub use store::{ConversationStore, MessageLog};
pub use types::{
    AssistantMessage, CodeBlock, Conversation, DedupKey, HistoryMessage, Message, Role,
    StatusEvent, StatusKind, UserMessage,
};
pub use upload::{InProgressFile, UploadProgress, UploadStatus, UploadTracker};
