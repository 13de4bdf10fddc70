use async_trait::async_trait;
use reqwest::Client as ReqwestClient;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use crate::config::ClientConfig;
use crate::errors::{AppError, TransportError};
use crate::models::{Ack, ConversationId, PollReply, ReplyStatus, Request};
use crate::service::gateway_service::AgentGateway;

/// Carries protocol messages between the polling client and the gateway.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, request: &Request) -> Result<Ack, TransportError>;

    async fn fetch(&self, conversation_id: &ConversationId) -> Result<PollReply, TransportError>;

    async fn delete_chat(&self, conversation_id: &ConversationId) -> Result<(), TransportError>;

    async fn delete_all(&self) -> Result<(), TransportError>;
}

/// A reply that claims a result but does not carry one is treated as garbage.
fn check_reply(reply: PollReply) -> Result<PollReply, TransportError> {
    if reply.status != ReplyStatus::Pending && reply.ai_response.is_none() {
        return Err(TransportError::Decode(format!(
            "reply with status {:?} carries no ai_response",
            reply.status
        )));
    }
    Ok(reply)
}

// ── HTTP ──────────────────────────────────────────────────────────────────────

/// Talks to the backend's JSON endpoints.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: ReqwestClient,
    base_url: String,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, TransportError> {
        let client = ReqwestClient::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(TransportError::Network)?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, TransportError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status { status: status.as_u16(), body });
        }
        let bytes = response.bytes().await.map_err(TransportError::Network)?;
        serde_json::from_slice(&bytes).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn send(&self, request: &Request) -> Result<Ack, TransportError> {
        let response = self
            .client
            .post(self.url("input"))
            .json(request)
            .send()
            .await
            .map_err(TransportError::Network)?;
        Self::decode(response).await
    }

    async fn fetch(&self, conversation_id: &ConversationId) -> Result<PollReply, TransportError> {
        let response = self
            .client
            .get(self.url("get_response"))
            .query(&[("conversation_id", conversation_id.as_str())])
            .send()
            .await
            .map_err(TransportError::Network)?;
        let reply = check_reply(Self::decode(response).await?)?;
        debug!(conversation_id = %conversation_id, status = ?reply.status, "Polled backend");
        Ok(reply)
    }

    async fn delete_chat(&self, conversation_id: &ConversationId) -> Result<(), TransportError> {
        let response = self
            .client
            .post(self.url("delete_chat"))
            .json(&json!({ "conversation_id": conversation_id }))
            .send()
            .await
            .map_err(TransportError::Network)?;
        Self::decode::<Ack>(response).await.map(|_| ())
    }

    async fn delete_all(&self) -> Result<(), TransportError> {
        let response = self
            .client
            .post(self.url("delete_all_history"))
            .send()
            .await
            .map_err(TransportError::Network)?;
        Self::decode::<Ack>(response).await.map(|_| ())
    }
}

// ── In-process ────────────────────────────────────────────────────────────────

/// Calls a gateway living in the same process, skipping HTTP. Errors map onto
/// the status codes the HTTP surface would have used.
#[derive(Clone)]
pub struct LocalTransport {
    gateway: AgentGateway,
}

impl LocalTransport {
    pub fn new(gateway: AgentGateway) -> Self {
        Self { gateway }
    }
}

fn local_error(err: AppError) -> TransportError {
    let status = if err.is_validation() { 400 } else { 500 };
    TransportError::Status { status, body: err.to_string() }
}

#[async_trait]
impl ChatTransport for LocalTransport {
    async fn send(&self, request: &Request) -> Result<Ack, TransportError> {
        self.gateway.submit(request.clone()).await.map_err(local_error)
    }

    async fn fetch(&self, conversation_id: &ConversationId) -> Result<PollReply, TransportError> {
        self.gateway
            .get_response(conversation_id)
            .await
            .map_err(local_error)
    }

    async fn delete_chat(&self, conversation_id: &ConversationId) -> Result<(), TransportError> {
        self.gateway.delete_chat(conversation_id).await.map_err(local_error)
    }

    async fn delete_all(&self) -> Result<(), TransportError> {
        self.gateway.delete_all().await.map_err(local_error)
    }
}
