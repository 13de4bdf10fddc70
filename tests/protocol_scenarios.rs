use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chat_relay::agent::Agent;
use chat_relay::client::{ChatTransport, CorrelationTracker, LocalTransport, PollingClient};
use chat_relay::config::{ClientConfig, DispatchMode, GatewayConfig};
use chat_relay::errors::AppError;
use chat_relay::models::{ConversationId, Metadata, Response, ResponseStatus};
use chat_relay::service::gateway_service::AgentGateway;
use chat_relay::store::{InMemoryResponseStore, ResponseStore};
use tokio::sync::Semaphore;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Replies only when the test hands out a permit.
struct GatedAgent {
    permits: Arc<Semaphore>,
}

#[async_trait]
impl Agent for GatedAgent {
    async fn respond(
        &self,
        _conversation_id: &ConversationId,
        message: &str,
        _metadata: &Metadata,
    ) -> Result<String, AppError> {
        self.permits
            .acquire()
            .await
            .map_err(|e| AppError::Unexpected(e.to_string()))?
            .forget();
        match message {
            "hello" => Ok("hi there".to_string()),
            "explode" => Err(AppError::InferenceError { message: "agent raised".to_string() }),
            other => Ok(format!("re: {other}")),
        }
    }
}

struct Harness {
    client: PollingClient<LocalTransport>,
    store: Arc<InMemoryResponseStore>,
    permits: Arc<Semaphore>,
}

fn harness(dispatch: DispatchMode, open: bool) -> Harness {
    let permits = Arc::new(Semaphore::new(if open { Semaphore::MAX_PERMITS } else { 0 }));
    let store = Arc::new(InMemoryResponseStore::new());
    let agent = Arc::new(GatedAgent { permits: permits.clone() });
    let gateway = AgentGateway::new(
        store.clone(),
        agent,
        GatewayConfig { dispatch, agent_timeout: Duration::from_secs(5) },
    );
    let config = ClientConfig {
        poll_interval: Duration::from_millis(5),
        ..ClientConfig::default()
    };
    Harness {
        client: PollingClient::new(LocalTransport::new(gateway), config),
        store,
        permits,
    }
}

fn abc() -> ConversationId {
    ConversationId::new("abc").expect("valid conversation id")
}

async fn poll_until_response(
    client: &PollingClient<LocalTransport>,
    tracker: &mut CorrelationTracker,
    conversation_id: &ConversationId,
) -> Response {
    timeout(TEST_TIMEOUT, async {
        loop {
            if let Some(response) = client.poll(tracker, conversation_id).await.expect("poll") {
                return response;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("response before timeout")
}

#[tokio::test]
async fn scenario_a_reply_is_rendered_and_awaiting_empties() {
    let h = harness(DispatchMode::Inline, true);
    let mut tracker = CorrelationTracker::new();

    let id = h.client.submit(&mut tracker, &abc(), "hello").await.expect("submit");
    assert!(tracker.awaiting(&abc()).contains(&id));

    let response = h.client.poll(&mut tracker, &abc()).await.expect("poll").expect("response");
    assert_eq!(response.status(), ResponseStatus::Success);
    assert_eq!(response.message(), Some("hi there"));
    assert_eq!(response.conversation_id(), &abc());
    assert!(tracker.awaiting(&abc()).is_empty());
    assert!(!tracker.has_pending(&abc()));
}

#[tokio::test]
async fn scenario_b_agent_failure_surfaces_once() {
    let h = harness(DispatchMode::Inline, true);
    let mut tracker = CorrelationTracker::new();

    h.client.submit(&mut tracker, &abc(), "explode").await.expect("submit is acknowledged");

    let response = h.client.poll(&mut tracker, &abc()).await.expect("poll").expect("response");
    assert_eq!(response.status(), ResponseStatus::Error);
    let description = response.error_description().expect("error entry");
    assert!(!description.is_empty());
    assert!(description.contains("agent raised"));

    assert_eq!(h.client.poll(&mut tracker, &abc()).await.expect("poll"), None);
    assert!(!tracker.has_pending(&abc()));
}

#[tokio::test]
async fn scenario_c_two_in_flight_messages_reconcile_independently() {
    let h = harness(DispatchMode::Background, false);
    let mut tracker = CorrelationTracker::new();

    let first = h.client.submit(&mut tracker, &abc(), "one").await.expect("submit one");
    let second = h.client.submit(&mut tracker, &abc(), "two").await.expect("submit two");
    assert_ne!(first, second);
    assert_eq!(tracker.awaiting(&abc()).len(), 2);

    h.permits.add_permits(1);
    let response = poll_until_response(&h.client, &mut tracker, &abc()).await;
    let answered = response.message_ids();
    assert_eq!(answered.len(), 1);
    let remaining = if answered[0] == first { second } else { first };
    assert_eq!(tracker.awaiting(&abc()).into_iter().collect::<Vec<_>>(), vec![remaining]);

    h.permits.add_permits(1);
    let response = poll_until_response(&h.client, &mut tracker, &abc()).await;
    assert_eq!(response.message_ids(), vec![remaining]);
    assert!(!tracker.has_pending(&abc()));
}

#[tokio::test]
async fn scenario_d_delete_chat_does_not_touch_the_tracker() {
    let h = harness(DispatchMode::Inline, true);
    let mut tracker = CorrelationTracker::new();

    h.client.submit(&mut tracker, &abc(), "hello").await.expect("submit");
    h.client.submit(&mut tracker, &abc(), "again").await.expect("submit");
    assert_eq!(h.store.pending_len(&abc()), 2);

    // Raw transport delete: the backend forgets, the client's tracker does not.
    h.client.transport().delete_chat(&abc()).await.expect("delete chat");
    assert_eq!(h.client.poll(&mut tracker, &abc()).await.expect("poll"), None);
    assert_eq!(tracker.awaiting(&abc()).len(), 2);

    // Resetting the tracker is the client's job, done by PollingClient::delete_chat.
    h.client.delete_chat(&mut tracker, &abc()).await.expect("delete chat");
    assert!(!tracker.has_pending(&abc()));
}

#[tokio::test]
async fn deleted_chat_stays_empty_when_a_background_answer_lands_late() {
    let h = harness(DispatchMode::Background, false);
    let mut tracker = CorrelationTracker::new();

    h.client.submit(&mut tracker, &abc(), "hello").await.expect("submit");
    h.client.delete_chat(&mut tracker, &abc()).await.expect("delete chat");

    h.permits.add_permits(1);
    timeout(TEST_TIMEOUT, async {
        while h.permits.available_permits() > 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("agent picked up the permit");

    let id = h.client.submit(&mut tracker, &abc(), "again").await.expect("submit again");
    h.permits.add_permits(1);
    let response = poll_until_response(&h.client, &mut tracker, &abc()).await;
    assert_eq!(response.message(), Some("re: again"));
    assert_eq!(response.message_ids(), vec![id]);
    assert_eq!(h.client.poll(&mut tracker, &abc()).await.expect("poll"), None);
    assert_eq!(h.store.pending_len(&abc()), 0);
}

#[tokio::test]
async fn other_conversations_keep_polling_after_switching() {
    let h = harness(DispatchMode::Background, false);
    let mut tracker = CorrelationTracker::new();
    let xyz = ConversationId::new("xyz").expect("valid conversation id");

    h.client.submit(&mut tracker, &abc(), "hello").await.expect("submit abc");
    h.client.submit(&mut tracker, &xyz, "hello").await.expect("submit xyz");
    h.permits.add_permits(2);

    let rendered = timeout(TEST_TIMEOUT, async {
        let mut rendered = Vec::new();
        while rendered.len() < 2 {
            for (_, outcome) in h.client.poll_pending(&mut tracker).await {
                if let Some(response) = outcome.expect("poll") {
                    rendered.push(response.conversation_id().clone());
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        rendered
    })
    .await
    .expect("both conversations answered");

    assert!(rendered.contains(&abc()));
    assert!(rendered.contains(&xyz));
    assert!(tracker.pending_conversations().is_empty());
}

#[tokio::test]
async fn drive_renders_each_response_exactly_once() {
    let h = harness(DispatchMode::Background, true);
    let mut tracker = CorrelationTracker::new();
    for text in ["one", "two", "three"] {
        h.client.submit(&mut tracker, &abc(), text).await.expect("submit");
    }

    let mut rendered = Vec::new();
    timeout(
        TEST_TIMEOUT,
        h.client.drive(&mut tracker, &abc(), |response| {
            rendered.push(response.message().map(str::to_string))
        }),
    )
    .await
    .expect("drive finishes")
    .expect("drive");

    rendered.sort();
    assert_eq!(
        rendered,
        vec![
            Some("re: one".to_string()),
            Some("re: three".to_string()),
            Some("re: two".to_string()),
        ]
    );
    assert_eq!(h.store.take_first(&abc()).await.expect("take"), None);
}
