//! Chat Engine Library
//!
//! Client-side engine for a business/customer live chat. It keeps the list
//! of conversations fresh, holds exactly one live channel to the selected
//! conversation, and maintains an ordered, de-duplicated message history
//! with optimistic sends.
//!
//! # Overview
//!
//! The library provides:
//! - `ChatEngine` / `ChatHandle` - The running engine and its caller API
//! - `SessionDirectory` - Polled session summaries and read-state
//! - `ChannelManager` - The single live channel with bounded reconnects
//! - `MessageLog` - Per-session ordered history
//! - `HttpChatApi` / `WsConnector` - Production REST and WebSocket backends
//!
//! # Example
//!
//! ```ignore
//! use chat_engine::{ChatEngine, EngineConfig, HttpChatApi, WsConnector};
//! use shared::ApiClientConfig;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ApiClientConfig::new("https://chat.example.com").with_token("...");
//!     let api = Arc::new(HttpChatApi::new(config.clone())?);
//!     let connector = Arc::new(WsConnector::new(config));
//!
//!     let (chat, task) = ChatEngine::spawn(EngineConfig::default(), api, connector);
//!
//!     let mut view = chat.subscribe();
//!     view.wait_for(|v| !v.sessions.is_empty()).await?;
//!     let first = chat.sessions()[0].id;
//!
//!     chat.select_session(first).await?;
//!     chat.send_message("Hi, how can I help?").await?;
//!
//!     chat.shutdown();
//!     task.await?;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod channel;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod grouping;
pub mod http;
pub mod message_log;
pub mod transport;

// Re-export main types at crate root
pub use channel::{ChannelEvent, ChannelManager, ConnectionState};
pub use config::EngineConfig;
pub use directory::SessionDirectory;
pub use engine::{ChatEngine, ChatHandle, ChatView};
pub use error::ChatError;
pub use grouping::MessageView;
pub use http::HttpChatApi;
pub use message_log::{DeliveryState, Message, MessageLog, SessionLog};
pub use transport::{Connector, WsConnector};
