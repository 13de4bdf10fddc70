use async_trait::async_trait;

use crate::agent::Agent;
use crate::errors::AppError;
use crate::models::{ConversationId, Metadata};

/// Offline stand-in that answers every message by repeating it.
#[derive(Debug, Clone, Default)]
pub struct EchoAgent;

#[async_trait]
impl Agent for EchoAgent {
    async fn respond(
        &self,
        _conversation_id: &ConversationId,
        message: &str,
        _metadata: &Metadata,
    ) -> Result<String, AppError> {
        Ok(format!("echo: {message}"))
    }
}
