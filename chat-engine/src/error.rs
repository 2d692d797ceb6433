//! Error types for chat-engine

use shared::ApiError;
use uuid::Uuid;

/// Errors that can occur while driving a live chat
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Channel transport error: {0}")]
    Transport(String),

    #[error("Message {client_id} was not acknowledged in time")]
    AckTimeout { client_id: Uuid },

    #[error("Session directory poll failed: {0}")]
    DirectoryPoll(#[source] ApiError),

    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),

    #[error("Not connected to a session channel")]
    NotConnected,

    #[error("No session selected")]
    NoSessionSelected,

    #[error("Unknown message {0}")]
    UnknownMessage(Uuid),

    #[error("Message {0} has not failed and cannot be resent")]
    NotRetryable(Uuid),

    #[error("Cannot send an empty message")]
    EmptyMessage,

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Chat engine has stopped")]
    EngineStopped,
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ChatError::Transport(err.to_string())
    }
}
