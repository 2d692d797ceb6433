//! Channel transport seam and its WebSocket implementation

use async_trait::async_trait;
use futures_util::sink::{Sink, SinkExt};
use futures_util::stream::{Stream, StreamExt};
use shared::api::endpoints;
use shared::ApiClientConfig;
use std::future;
use std::pin::Pin;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::info;
use uuid::Uuid;

use crate::error::ChatError;

/// Outgoing half of a connected channel (raw text frames)
pub type FrameSink = Pin<Box<dyn Sink<String, Error = ChatError> + Send>>;

/// Incoming half of a connected channel (raw text frames)
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, ChatError>> + Send>>;

/// Opens the live channel for a session.
///
/// A successful return means the handshake completed. The stream ends (or
/// yields an error) when the transport is lost.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, session_id: Uuid) -> Result<(FrameSink, FrameStream), ChatError>;
}

/// WebSocket connector for `/ws/chat/{session_id}/`
pub struct WsConnector {
    config: ApiClientConfig,
}

impl WsConnector {
    pub fn new(config: ApiClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, session_id: Uuid) -> Result<(FrameSink, FrameStream), ChatError> {
        let ws_url = self.config.ws_url(&endpoints::session_channel(session_id));
        info!("Connecting to chat channel: {}", ws_url);

        let mut request = ws_url.as_str().into_client_request()?;
        if let Some(token) = &self.config.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ChatError::Transport(format!("invalid auth token: {}", e)))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws_stream, _) = connect_async(request).await?;
        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(ChatError::from)
            .with(|text: String| future::ready(Ok::<_, ChatError>(Message::Text(text))));

        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Close(frame)) => Some(Err(ChatError::Transport(format!(
                    "closed by server: {:?}",
                    frame
                )))),
                Ok(_) => None,
                Err(e) => Some(Err(e.into())),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}
