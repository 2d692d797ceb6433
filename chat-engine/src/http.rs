//! REST client for the chat endpoints using reqwest

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use shared::api::{endpoints, ApiClientConfig, ApiError, ChatApi};
use shared::{ChatSession, MessageRecord, StartSessionRequest};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// `ChatApi` over HTTP with bearer auth
pub struct HttpChatApi {
    client: Client,
    config: ApiClientConfig,
}

impl HttpChatApi {
    pub fn new(config: ApiClientConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Network(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn add_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.config.auth_token {
            req.header("Authorization", format!("Bearer {}", token))
        } else {
            req
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
        self.add_auth(req)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ApiError::Auth("Unauthorized".to_string()));
        }

        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound(response.url().path().to_string()));
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ApiError::Server {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        Self::check_status(response)
            .await?
            .json::<T>()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_sessions(&self) -> Result<Vec<ChatSession>, ApiError> {
        let url = self.config.url(endpoints::SESSIONS);
        let response = self.send(self.client.get(&url)).await?;
        Self::handle_response(response).await
    }

    async fn session_messages(&self, id: Uuid) -> Result<Vec<MessageRecord>, ApiError> {
        let url = self.config.url(&endpoints::session_messages(id));
        let response = self.send(self.client.get(&url)).await?;
        let records: Vec<MessageRecord> = Self::handle_response(response).await?;
        debug!("Fetched {} message(s) for session {}", records.len(), id);
        Ok(records)
    }

    async fn mark_read(&self, id: Uuid) -> Result<(), ApiError> {
        let url = self.config.url(&endpoints::session_read(id));
        let response = self.send(self.client.post(&url)).await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn start_session(&self, tenant_id: Uuid) -> Result<ChatSession, ApiError> {
        let url = self.config.url(endpoints::START_SESSION);
        let body = StartSessionRequest { tenant_id };
        let response = self.send(self.client.post(&url).json(&body)).await?;
        Self::handle_response(response).await
    }
}
