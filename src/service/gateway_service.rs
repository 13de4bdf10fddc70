use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::agent::Agent;
use crate::config::{DispatchMode, GatewayConfig};
use crate::errors::{AppError, ValidationError};
use crate::models::{Ack, ConversationId, Metadata, PollReply, Request, RequestKind, Response};
use crate::store::ResponseStore;

/// Where a TEXT request is in its trip through the gateway. Only used for
/// logging; the transitions themselves are the body of [`AgentGateway::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Received,
    Dispatched,
    Succeeded,
    Failed,
}

impl fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RequestPhase::Received => "RECEIVED",
            RequestPhase::Dispatched => "DISPATCHED",
            RequestPhase::Succeeded => "SUCCEEDED",
            RequestPhase::Failed => "FAILED",
        })
    }
}

/// Bumped on every delete. An agent outcome is only stored while the
/// generation it was dispatched under is still current.
#[derive(Debug, Default)]
struct Generations {
    all: u64,
    conversations: HashMap<ConversationId, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Generation {
    all: u64,
    conversation: u64,
}

impl Generations {
    fn current(&self, conversation_id: &ConversationId) -> Generation {
        Generation {
            all: self.all,
            conversation: self.conversations.get(conversation_id).copied().unwrap_or(0),
        }
    }
}

/// Bridges validated requests to the agent and records every outcome in the
/// response store. Cheap to clone; all handles are shared.
#[derive(Clone)]
pub struct AgentGateway {
    store: Arc<dyn ResponseStore>,
    agent: Arc<dyn Agent>,
    config: GatewayConfig,
    generations: Arc<RwLock<Generations>>,
}

impl AgentGateway {
    pub fn new(store: Arc<dyn ResponseStore>, agent: Arc<dyn Agent>, config: GatewayConfig) -> Self {
        Self {
            store,
            agent,
            config,
            generations: Arc::default(),
        }
    }

    /// Handles one submission. Only envelope and store faults come back as
    /// errors; whatever the agent does ends up in the store.
    pub async fn submit(&self, request: Request) -> Result<Ack, AppError> {
        match request.kind() {
            RequestKind::Text => {
                let conversation_id = required_conversation(&request)?;
                let message_id = request.message_id();
                info!(
                    conversation_id = %conversation_id,
                    message_id = ?message_id,
                    phase = %RequestPhase::Received,
                    "Accepted chat message"
                );

                let generation = self.generations.read().await.current(&conversation_id);
                match self.config.dispatch {
                    DispatchMode::Background => {
                        let gateway = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = gateway.dispatch_under(request, generation).await {
                                error!("Failed to record agent outcome: {e}");
                            }
                        });
                    }
                    DispatchMode::Inline => {
                        self.dispatch_under(request, generation).await?;
                    }
                }
                Ok(Ack::accepted(message_id))
            }
            RequestKind::DeleteConversation => {
                let conversation_id = required_conversation(&request)?;
                self.delete_chat(&conversation_id).await?;
                Ok(Ack::accepted(None))
            }
            RequestKind::DeleteAll => {
                self.delete_all().await?;
                Ok(Ack::accepted(None))
            }
        }
    }

    /// Runs the agent for a TEXT request and stores the result, success or not.
    /// Returns the response; it is not stored when the conversation was deleted
    /// while the agent was working.
    pub async fn dispatch(&self, request: Request) -> Result<Response, AppError> {
        let conversation_id = required_conversation(&request)?;
        let generation = self.generations.read().await.current(&conversation_id);
        self.dispatch_under(request, generation).await
    }

    async fn dispatch_under(&self, request: Request, generation: Generation) -> Result<Response, AppError> {
        let conversation_id = required_conversation(&request)?;
        let message = request
            .payload()
            .ok_or(ValidationError::EmptyField { field_name: "payload" })?;
        let message_id = request.message_id();

        debug!(conversation_id = %conversation_id, phase = %RequestPhase::Dispatched, "Invoking agent");
        let outcome = self
            .invoke_agent(&conversation_id, message, request.metadata())
            .await;

        let response = match outcome {
            Ok(reply) => {
                info!(
                    conversation_id = %conversation_id,
                    message_id = ?message_id,
                    phase = %RequestPhase::Succeeded,
                    "Agent replied"
                );
                Response::success(conversation_id.clone(), reply, Metadata::new())
                    .unwrap_or_else(|e| Response::failure(conversation_id.clone(), e.to_string()))
            }
            Err(e) => {
                if e.is_agent() {
                    warn!(
                        conversation_id = %conversation_id,
                        message_id = ?message_id,
                        phase = %RequestPhase::Failed,
                        "Agent failed: {e}"
                    );
                } else {
                    error!(
                        conversation_id = %conversation_id,
                        message_id = ?message_id,
                        phase = %RequestPhase::Failed,
                        "Agent failed unexpectedly: {e}"
                    );
                }
                Response::failure(conversation_id.clone(), e.to_string())
            }
        }
        .answering(message_id);

        // Held across the put so a delete cannot slip in between check and write.
        let generations = self.generations.read().await;
        if generations.current(&conversation_id) != generation {
            info!(
                conversation_id = %conversation_id,
                message_id = ?message_id,
                "Conversation deleted while the agent was working, dropping its answer"
            );
            return Ok(response);
        }
        self.store.put(&conversation_id, response.clone()).await?;
        drop(generations);
        Ok(response)
    }

    /// Calls the agent on its own task so a panic or a hang is contained and
    /// reported as an agent error.
    async fn invoke_agent(
        &self,
        conversation_id: &ConversationId,
        message: &str,
        metadata: &Metadata,
    ) -> Result<String, AppError> {
        let agent = Arc::clone(&self.agent);
        let task_conversation = conversation_id.clone();
        let task_message = message.to_string();
        let task_metadata = metadata.clone();
        let task = tokio::spawn(async move {
            agent
                .respond(&task_conversation, &task_message, &task_metadata)
                .await
        });
        let abort = task.abort_handle();

        match tokio::time::timeout(self.config.agent_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(AppError::AgentPanicked { message: join_error.to_string() }),
            Err(_) => {
                abort.abort();
                Err(AppError::AgentTimeout { seconds: self.config.agent_timeout.as_secs() })
            }
        }
    }

    /// `GET /get_response`: hands out the oldest stored response, if any.
    pub async fn get_response(&self, conversation_id: &ConversationId) -> Result<PollReply, AppError> {
        let taken = self.store.take_first(conversation_id).await?;
        if let Some(response) = &taken {
            debug!(
                conversation_id = %conversation_id,
                status = %response.status(),
                "Delivering response to poller"
            );
        }
        Ok(PollReply::from_taken(taken))
    }

    pub async fn delete_chat(&self, conversation_id: &ConversationId) -> Result<(), AppError> {
        {
            let mut generations = self.generations.write().await;
            *generations.conversations.entry(conversation_id.clone()).or_default() += 1;
            self.store.clear(conversation_id).await?;
        }
        self.agent.forget(conversation_id).await;
        info!(conversation_id = %conversation_id, "Deleted conversation");
        Ok(())
    }

    pub async fn delete_all(&self) -> Result<(), AppError> {
        {
            let mut generations = self.generations.write().await;
            generations.all += 1;
            generations.conversations.clear();
            self.store.clear_all().await?;
        }
        self.agent.forget_all().await;
        info!("Deleted all conversations");
        Ok(())
    }
}

fn required_conversation(request: &Request) -> Result<ConversationId, ValidationError> {
    request
        .conversation_id()
        .cloned()
        .ok_or(ValidationError::MissingField {
            field_name: "conversation_id",
            context: "this request kind",
        })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::models::{metadata_for, MessageId, ReplyStatus, ResponseStatus};
    use crate::store::InMemoryResponseStore;

    /// Answers according to the message text.
    #[derive(Default)]
    struct ScriptedAgent {
        forgotten: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Agent for ScriptedAgent {
        async fn respond(
            &self,
            _conversation_id: &ConversationId,
            message: &str,
            _metadata: &Metadata,
        ) -> Result<String, AppError> {
            match message {
                "hello" => Ok("hi there".to_string()),
                "explode" => Err(AppError::InferenceError { message: "model crashed".into() }),
                "panic" => panic!("agent blew up"),
                "stall" => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok("too late".to_string())
                }
                other => Ok(format!("re: {other}")),
            }
        }

        async fn forget(&self, conversation_id: &ConversationId) {
            self.forgotten.lock().unwrap().push(conversation_id.to_string());
        }

        async fn forget_all(&self) {
            self.forgotten.lock().unwrap().push("*".to_string());
        }
    }

    fn gateway(dispatch: DispatchMode) -> (AgentGateway, Arc<InMemoryResponseStore>, Arc<ScriptedAgent>) {
        let store = Arc::new(InMemoryResponseStore::new());
        let agent = Arc::new(ScriptedAgent::default());
        let config = GatewayConfig { dispatch, agent_timeout: Duration::from_secs(5) };
        let gateway = AgentGateway::new(store.clone(), agent.clone(), config);
        (gateway, store, agent)
    }

    fn abc() -> ConversationId {
        ConversationId::new("abc").unwrap()
    }

    fn text(message: &str, id: MessageId) -> Request {
        Request::text(abc(), message, metadata_for(id)).unwrap()
    }

    #[tokio::test]
    async fn successful_reply_is_stored_with_its_message_id() {
        let (gateway, store, _) = gateway(DispatchMode::Inline);
        let id = MessageId::new();

        let ack = gateway.submit(text("hello", id)).await.unwrap();
        assert_eq!(ack, Ack::accepted(Some(id)));

        let stored = store.take_first(&abc()).await.unwrap().unwrap();
        assert_eq!(stored.status(), ResponseStatus::Success);
        assert_eq!(stored.message(), Some("hi there"));
        assert_eq!(stored.message_ids(), vec![id]);
    }

    #[tokio::test]
    async fn agent_error_becomes_stored_error_response() {
        let (gateway, _, _) = gateway(DispatchMode::Inline);
        let id = MessageId::new();

        let ack = gateway.submit(text("explode", id)).await.unwrap();
        assert_eq!(ack.status, ReplyStatus::Success);

        let reply = gateway.get_response(&abc()).await.unwrap();
        assert_eq!(reply.status, ReplyStatus::Error);
        let response = reply.ai_response.unwrap();
        assert!(response.error_description().unwrap().contains("model crashed"));
        assert_eq!(response.message_ids(), vec![id]);

        assert_eq!(gateway.get_response(&abc()).await.unwrap(), PollReply::pending());
    }

    #[tokio::test]
    async fn agent_panic_becomes_stored_error_response() {
        let (gateway, _, _) = gateway(DispatchMode::Inline);
        let response = gateway.dispatch(text("panic", MessageId::new())).await.unwrap();
        assert!(response.is_error());
        assert!(response.error_description().unwrap().contains("panicked"));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_agent_times_out_into_error_response() {
        let (gateway, store, _) = gateway(DispatchMode::Inline);
        let response = gateway.dispatch(text("stall", MessageId::new())).await.unwrap();
        assert!(response.is_error());
        assert_eq!(response.error_description(), Some("Agent did not answer within 5s"));
        assert_eq!(store.pending_len(&abc()), 1);
    }

    #[tokio::test]
    async fn background_dispatch_acknowledges_before_the_agent_answers() {
        let (gateway, store, _) = gateway(DispatchMode::Background);
        let id = MessageId::new();
        gateway.submit(text("hello", id)).await.unwrap();

        let stored = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(response) = store.take_first(&abc()).await.unwrap() {
                    return response;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(stored.message(), Some("hi there"));
    }

    #[tokio::test]
    async fn delete_requests_clear_store_and_agent_memory() {
        let (gateway, store, agent) = gateway(DispatchMode::Inline);
        gateway.submit(text("one", MessageId::new())).await.unwrap();
        gateway.submit(text("two", MessageId::new())).await.unwrap();
        assert_eq!(store.pending_len(&abc()), 2);

        gateway.submit(Request::delete_conversation(abc())).await.unwrap();
        assert_eq!(gateway.get_response(&abc()).await.unwrap(), PollReply::pending());

        gateway.submit(text("three", MessageId::new())).await.unwrap();
        gateway.submit(Request::delete_all()).await.unwrap();
        assert_eq!(store.pending_len(&abc()), 0);

        assert_eq!(*agent.forgotten.lock().unwrap(), vec!["abc".to_string(), "*".to_string()]);
    }

    /// Signals when a call starts and answers only once a permit is added.
    struct GatedAgent {
        entered: tokio::sync::Notify,
        permits: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl Agent for GatedAgent {
        async fn respond(
            &self,
            _conversation_id: &ConversationId,
            message: &str,
            _metadata: &Metadata,
        ) -> Result<String, AppError> {
            self.entered.notify_one();
            self.permits.acquire().await.unwrap().forget();
            Ok(format!("re: {message}"))
        }
    }

    fn gated_gateway() -> (AgentGateway, Arc<InMemoryResponseStore>, Arc<GatedAgent>) {
        let store = Arc::new(InMemoryResponseStore::new());
        let agent = Arc::new(GatedAgent {
            entered: tokio::sync::Notify::new(),
            permits: tokio::sync::Semaphore::new(0),
        });
        let config = GatewayConfig { dispatch: DispatchMode::Inline, agent_timeout: Duration::from_secs(5) };
        let gateway = AgentGateway::new(store.clone(), agent.clone(), config);
        (gateway, store, agent)
    }

    #[tokio::test]
    async fn answer_finishing_after_delete_chat_is_dropped() {
        let (gateway, store, agent) = gated_gateway();

        let in_flight = tokio::spawn({
            let gateway = gateway.clone();
            async move { gateway.submit(text("hello", MessageId::new())).await }
        });
        agent.entered.notified().await;

        gateway.submit(Request::delete_conversation(abc())).await.unwrap();
        agent.permits.add_permits(1);
        in_flight.await.unwrap().unwrap();

        assert_eq!(store.pending_len(&abc()), 0);
        assert_eq!(gateway.get_response(&abc()).await.unwrap(), PollReply::pending());

        // Messages sent after the delete are answered as usual.
        agent.permits.add_permits(1);
        gateway.submit(text("again", MessageId::new())).await.unwrap();
        let stored = store.take_first(&abc()).await.unwrap().unwrap();
        assert_eq!(stored.message(), Some("re: again"));
    }

    #[tokio::test]
    async fn answer_finishing_after_delete_all_is_dropped() {
        let (gateway, store, agent) = gated_gateway();

        let in_flight = tokio::spawn({
            let gateway = gateway.clone();
            async move { gateway.submit(text("hello", MessageId::new())).await }
        });
        agent.entered.notified().await;

        gateway.submit(Request::delete_all()).await.unwrap();
        agent.permits.add_permits(1);
        in_flight.await.unwrap().unwrap();

        assert_eq!(store.pending_len(&abc()), 0);
    }

    #[test]
    fn phases_render_as_protocol_names() {
        assert_eq!(RequestPhase::Dispatched.to_string(), "DISPATCHED");
    }
}
