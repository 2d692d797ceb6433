//! API client types and trait definitions
//!
//! This module defines the REST contract the chat engine consumes. The
//! engine only ever talks to the server through `ChatApi`, so tests can
//! substitute an in-memory fake.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ChatSession, MessageRecord};

/// API error types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiError {
    /// Network or connection error
    Network(String),
    /// Server returned an error status
    Server { status: u16, message: String },
    /// Failed to parse response
    Parse(String),
    /// Authentication required or failed
    Auth(String),
    /// Resource not found
    NotFound(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Network(msg) => write!(f, "Network error: {}", msg),
            ApiError::Server { status, message } => {
                write!(f, "Server error ({}): {}", status, message)
            }
            ApiError::Parse(msg) => write!(f, "Parse error: {}", msg),
            ApiError::Auth(msg) => write!(f, "Auth error: {}", msg),
            ApiError::NotFound(msg) => write!(f, "Not found: {}", msg),
        }
    }
}

impl std::error::Error for ApiError {}

/// API endpoint paths
pub mod endpoints {
    use uuid::Uuid;

    pub const SESSIONS: &str = "/api/chat/";
    pub const START_SESSION: &str = "/api/chat/start_session/";

    pub fn session_messages(id: Uuid) -> String {
        format!("/api/chat/{}/messages/", id)
    }

    pub fn session_read(id: Uuid) -> String {
        format!("/api/chat/{}/read/", id)
    }

    /// Path of the live channel for one session
    pub fn session_channel(id: Uuid) -> String {
        format!("/ws/chat/{}/", id)
    }
}

/// REST operations the chat engine needs from the server.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// List all sessions visible to the current user
    async fn list_sessions(&self) -> Result<Vec<ChatSession>, ApiError>;

    /// Full message history of one session, oldest first
    async fn session_messages(&self, id: Uuid) -> Result<Vec<MessageRecord>, ApiError>;

    /// Mark every message in the session as read
    async fn mark_read(&self, id: Uuid) -> Result<(), ApiError>;

    /// Start (or fetch the existing) session with a business
    async fn start_session(&self, tenant_id: Uuid) -> Result<ChatSession, ApiError>;
}

/// Configuration for creating an API client
#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    /// Base URL of the server (e.g., "http://localhost:8000")
    pub base_url: String,
    /// Optional bearer token for authenticated requests
    pub auth_token: Option<String>,
}

impl ApiClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    /// WebSocket URL for an endpoint (http -> ws, https -> wss)
    pub fn ws_url(&self, endpoint: &str) -> String {
        let base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.base_url.clone()
        };
        format!("{}{}", base, endpoint)
    }
}
