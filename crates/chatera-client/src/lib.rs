//! Streaming conversation engine for the chatera chat service.
//!
//! The engine turns one user message into a rendered answer. It creates the
//! conversation on first send, opens the streamed query and folds its tokens into
//! the message log, while a WebSocket channel delivers progress notices and title
//! corrections for the same conversation.
//!
//! # Architecture
//!
//! ```text
//!   send_message ──► SessionCoordinator ──► ChatApi::create_conversation
//!        │
//!        ▼
//!   ChatApi::open_query ──► StreamIngestor ──┐
//!                                            ├──► ConversationStore ──► watch<MessageLog>
//!   EventChannel (ws://…/ws/{channel}) ──────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use chatera_client::{ChatEngine, ClientConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut engine = ChatEngine::connect(ClientConfig::from_env())?;
//! engine.refresh_conversations().await?;
//!
//! let state = engine.send_message("Explain recursion").await?;
//! println!("answer finished: {state:?}");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod api;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod session;
pub mod stream;

pub use api::{ByteStream, ChatApi, ConversationUpdate, Document, HttpChatApi, QueryRequest};
pub use channel::{
    ChannelConnector, ChannelEvent, ChannelState, EventChannel, FrameStream, InboundMessage,
    WsConnector,
};
pub use config::ClientConfig;
pub use engine::{ChatEngine, EngineEvent};
pub use error::{ClientError, Result};
pub use session::{derive_title, Selection, SelectionEffect, SessionCoordinator};
pub use stream::{parse_line, StreamEvent, StreamHandler, StreamIngestor, StreamState};
