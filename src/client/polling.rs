use futures_util::future::join_all;
use serde_json::Value;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::tracker::CorrelationTracker;
use crate::client::transport::ChatTransport;
use crate::config::ClientConfig;
use crate::errors::{ClientError, TransportError};
use crate::models::{metadata_for, ConversationId, MessageId, PollReply, Request, Response, ERROR_KEY};

/// Metadata flag on ERROR responses the client made up itself because the
/// backend never answered.
pub const LOCAL_KEY: &str = "local";

/// Drives submission and retrieval for one chat session. The session's
/// [`CorrelationTracker`] is passed into every call.
pub struct PollingClient<T> {
    transport: T,
    config: ClientConfig,
}

impl<T: ChatTransport> PollingClient<T> {
    pub fn new(transport: T, config: ClientConfig) -> Self {
        Self { transport, config }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Sends `text` as a new message and returns its correlation id. The id is
    /// registered before the request leaves, so even an instant answer is
    /// recognised.
    pub async fn submit(
        &self,
        tracker: &mut CorrelationTracker,
        conversation_id: &ConversationId,
        text: &str,
    ) -> Result<MessageId, ClientError> {
        let message_id = MessageId::new();
        let request = Request::text(conversation_id.clone(), text, metadata_for(message_id))?;
        tracker.register(conversation_id, message_id);

        match self.transport.send(&request).await {
            Ok(ack) => {
                if ack.message_id.is_some_and(|acked| acked != message_id) {
                    warn!(%message_id, acked = ?ack.message_id, "Backend acknowledged a different message id");
                }
                info!(conversation_id = %conversation_id, %message_id, "Submitted message");
                Ok(message_id)
            }
            Err(e) => {
                tracker.abandon(conversation_id, message_id);
                warn!(conversation_id = %conversation_id, %message_id, "Submission failed: {e}");
                Err(e.into())
            }
        }
    }

    /// One poll cycle for `conversation_id`. Returns a response to render, or
    /// `None` when there is nothing new.
    pub async fn poll(
        &self,
        tracker: &mut CorrelationTracker,
        conversation_id: &ConversationId,
    ) -> Result<Option<Response>, ClientError> {
        let fetched = self.transport.fetch(conversation_id).await;
        self.apply(tracker, conversation_id, fetched)
    }

    /// Polls every conversation that still has messages awaiting, concurrently.
    /// Results come back in conversation id order.
    pub async fn poll_pending(
        &self,
        tracker: &mut CorrelationTracker,
    ) -> Vec<(ConversationId, Result<Option<Response>, ClientError>)> {
        let conversations = tracker.pending_conversations();
        let fetched = join_all(conversations.iter().map(|id| self.transport.fetch(id))).await;

        conversations
            .into_iter()
            .zip(fetched)
            .map(|(id, fetched)| {
                let outcome = self.apply(tracker, &id, fetched);
                (id, outcome)
            })
            .collect()
    }

    /// Polls `conversation_id` every `poll_interval` until nothing is awaiting,
    /// handing each response to `on_response`.
    pub async fn drive<F>(
        &self,
        tracker: &mut CorrelationTracker,
        conversation_id: &ConversationId,
        mut on_response: F,
    ) -> Result<(), ClientError>
    where
        F: FnMut(Response),
    {
        let mut ticker = tokio::time::interval(self.config.poll_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while tracker.has_pending(conversation_id) {
            ticker.tick().await;
            if let Some(response) = self.poll(tracker, conversation_id).await? {
                on_response(response);
            }
        }
        Ok(())
    }

    /// Deletes the chat on the backend and forgets its outstanding messages.
    pub async fn delete_chat(
        &self,
        tracker: &mut CorrelationTracker,
        conversation_id: &ConversationId,
    ) -> Result<(), ClientError> {
        self.transport.delete_chat(conversation_id).await?;
        tracker.reset(conversation_id);
        Ok(())
    }

    pub async fn delete_all(&self, tracker: &mut CorrelationTracker) -> Result<(), ClientError> {
        self.transport.delete_all().await?;
        tracker.reset_all();
        Ok(())
    }

    fn apply(
        &self,
        tracker: &mut CorrelationTracker,
        conversation_id: &ConversationId,
        fetched: Result<PollReply, TransportError>,
    ) -> Result<Option<Response>, ClientError> {
        let reply = match fetched {
            Ok(reply) => {
                tracker.clear_transport_failures(conversation_id);
                reply
            }
            Err(e) if e.is_rejection() => return Err(e.into()),
            Err(e) => {
                let failures = tracker.record_transport_failure(conversation_id);
                warn!(conversation_id = %conversation_id, failures, "Poll failed: {e}");
                if failures >= self.config.max_transport_failures {
                    tracker.clear_transport_failures(conversation_id);
                    return Err(ClientError::BackendUnreachable { failures });
                }
                return Ok(self.expire(tracker, conversation_id));
            }
        };

        match reply.ai_response {
            Some(response) if response.status().is_terminal() => {
                let ids = response.message_ids();
                if ids.is_empty() {
                    debug!(conversation_id = %conversation_id, "Response carries no message id");
                }
                let still_pending = tracker.reconcile(conversation_id, ids);
                debug!(conversation_id = %conversation_id, still_pending, "Reconciled response");
                Ok(Some(response))
            }
            _ => Ok(self.expire(tracker, conversation_id)),
        }
    }

    /// Fails the oldest overdue message locally, if there is one.
    fn expire(&self, tracker: &mut CorrelationTracker, conversation_id: &ConversationId) -> Option<Response> {
        let ttl = self.config.message_ttl;
        let message_id = tracker.expire_oldest(conversation_id, Instant::now(), ttl)?;
        warn!(conversation_id = %conversation_id, %message_id, "No response within {}s", ttl.as_secs());

        let mut metadata = metadata_for(message_id);
        metadata.insert(
            ERROR_KEY.to_string(),
            Value::String(format!("No response within {}s", ttl.as_secs())),
        );
        metadata.insert(LOCAL_KEY.to_string(), Value::Bool(true));
        Response::error(conversation_id.clone(), metadata).ok()
    }
}
