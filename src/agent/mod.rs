pub mod echo;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rig::client::Nothing;
use rig::completion::Chat;
use rig::message::Message as RigMessage;
use rig::prelude::CompletionClient;
use rig::providers::ollama;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::errors::AppError;
use crate::models::{ConversationId, Metadata};

pub use echo::EchoAgent;

pub const DEFAULT_MODEL: &str = "llama3.2";
const PREAMBLE: &str = "You are a helpful AI assistant running locally via Ollama. \
                        Be concise, accurate, and friendly. \
                        If you don't know something, say so.";

/// The external system that actually writes chat replies. Opaque to the
/// gateway: it only sees text in, text or an error out.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn respond(
        &self,
        conversation_id: &ConversationId,
        message: &str,
        metadata: &Metadata,
    ) -> Result<String, AppError>;

    /// Drops whatever the agent remembers about one conversation.
    async fn forget(&self, _conversation_id: &ConversationId) {}

    /// Drops everything the agent remembers.
    async fn forget_all(&self) {}
}

/// Agent backed by a local Ollama model through rig.
///
/// A fresh rig agent is built per call and the conversation's earlier turns are
/// replayed to it, so the model sees the whole thread.
#[derive(Clone)]
pub struct OllamaAgentService {
    client: ollama::Client,
    base_url: String,
    model: String,
    histories: Arc<Mutex<HashMap<ConversationId, Vec<RigMessage>>>>,
}

impl OllamaAgentService {
    pub fn new(base_url: &str, model: &str) -> Result<Self, AppError> {
        let client = ollama::Client::builder()
            .api_key(Nothing)
            .base_url(base_url)
            .build()
            .map_err(|e| AppError::Unexpected(format!("Failed to build Ollama client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.to_string(),
            model: model.to_string(),
            histories: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn classify(&self, conversation_id: &ConversationId, message: String) -> AppError {
        error!("Ollama inference failed for conversation {conversation_id}: {message}");
        if message.contains("Connection refused") || message.contains("connect") {
            AppError::OllamaUnavailable { host: self.base_url.clone() }
        } else if message.contains("model") {
            AppError::ModelNotFound { model_name: self.model.clone() }
        } else {
            AppError::InferenceError { message }
        }
    }
}

#[async_trait]
impl Agent for OllamaAgentService {
    async fn respond(
        &self,
        conversation_id: &ConversationId,
        message: &str,
        _metadata: &Metadata,
    ) -> Result<String, AppError> {
        let agent = self
            .client
            .agent(&self.model)
            .preamble(PREAMBLE)
            .build();

        // Snapshot so the lock is not held across the model call.
        let history = self
            .histories
            .lock()
            .await
            .get(conversation_id)
            .cloned()
            .unwrap_or_default();
        debug!(conversation_id = %conversation_id, turns = history.len(), "Replaying history to Ollama");

        let content = agent
            .chat(message, history)
            .await
            .map_err(|e| self.classify(conversation_id, e.to_string()))?;

        let mut histories = self.histories.lock().await;
        let turns = histories.entry(conversation_id.clone()).or_default();
        turns.push(RigMessage::user(message));
        turns.push(RigMessage::assistant(&content));

        Ok(content)
    }

    async fn forget(&self, conversation_id: &ConversationId) {
        self.histories.lock().await.remove(conversation_id);
    }

    async fn forget_all(&self) {
        self.histories.lock().await.clear();
    }
}
