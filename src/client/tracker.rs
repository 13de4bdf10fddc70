use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use crate::models::{ConversationId, MessageId};

/// How many retired ids each conversation remembers, so that reconciling the
/// same response twice is a no-op.
const RETIRED_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct Correlation {
    /// Outstanding messages and when they were registered.
    awaiting: HashMap<MessageId, Instant>,
    /// Answered ids not yet matched against `awaiting`.
    fulfilled: HashSet<MessageId>,
    retired: VecDeque<MessageId>,
    transport_failures: u32,
}

impl Correlation {
    fn retire(&mut self, id: MessageId) {
        if self.retired.len() == RETIRED_CAPACITY {
            self.retired.pop_front();
        }
        self.retired.push_back(id);
    }
}

/// Client-side bookkeeping of which messages are still waiting for an answer.
///
/// Owned by one chat session and passed by `&mut` into every submit and poll,
/// so it needs no locking. Unknown conversations behave as empty.
#[derive(Debug, Default)]
pub struct CorrelationTracker {
    conversations: HashMap<ConversationId, Correlation>,
}

impl CorrelationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, conversation_id: &ConversationId) -> &mut Correlation {
        self.conversations.entry(conversation_id.clone()).or_default()
    }

    /// Marks `message_id` as awaiting an answer. Call before the request is sent.
    pub fn register(&mut self, conversation_id: &ConversationId, message_id: MessageId) {
        self.entry(conversation_id).awaiting.insert(message_id, Instant::now());
    }

    /// Records answered ids and retires every id that is both awaiting and
    /// answered. Returns whether anything is still awaiting.
    pub fn reconcile(
        &mut self,
        conversation_id: &ConversationId,
        fulfilled: impl IntoIterator<Item = MessageId>,
    ) -> bool {
        let correlation = self.entry(conversation_id);
        for id in fulfilled {
            if !correlation.retired.contains(&id) {
                correlation.fulfilled.insert(id);
            }
        }

        let previous: HashSet<MessageId> = correlation.awaiting.keys().copied().collect();
        let answered = &correlation.fulfilled;
        correlation.awaiting.retain(|id, _| !answered.contains(id));
        let matched: Vec<MessageId> = correlation
            .fulfilled
            .intersection(&previous)
            .copied()
            .collect();
        for id in matched {
            correlation.fulfilled.remove(&id);
            correlation.retire(id);
        }

        !correlation.awaiting.is_empty()
    }

    pub fn has_pending(&self, conversation_id: &ConversationId) -> bool {
        self.conversations
            .get(conversation_id)
            .is_some_and(|c| !c.awaiting.is_empty())
    }

    pub fn awaiting(&self, conversation_id: &ConversationId) -> HashSet<MessageId> {
        self.conversations
            .get(conversation_id)
            .map(|c| c.awaiting.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn fulfilled(&self, conversation_id: &ConversationId) -> HashSet<MessageId> {
        self.conversations
            .get(conversation_id)
            .map(|c| c.fulfilled.clone())
            .unwrap_or_default()
    }

    /// Conversations with at least one message still awaiting an answer.
    pub fn pending_conversations(&self) -> Vec<ConversationId> {
        let mut pending: Vec<ConversationId> = self
            .conversations
            .iter()
            .filter(|(_, c)| !c.awaiting.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        pending.sort();
        pending
    }

    /// Withdraws a registration whose request never reached the backend.
    pub fn abandon(&mut self, conversation_id: &ConversationId, message_id: MessageId) -> bool {
        self.entry(conversation_id).awaiting.remove(&message_id).is_some()
    }

    /// Removes and returns the oldest awaiting id registered at least `ttl`
    /// before `now`.
    pub fn expire_oldest(
        &mut self,
        conversation_id: &ConversationId,
        now: Instant,
        ttl: Duration,
    ) -> Option<MessageId> {
        let correlation = self.conversations.get_mut(conversation_id)?;
        let (id, _) = correlation
            .awaiting
            .iter()
            .filter(|(_, registered)| now.saturating_duration_since(**registered) >= ttl)
            .min_by_key(|(_, registered)| **registered)
            .map(|(id, registered)| (*id, *registered))?;
        correlation.awaiting.remove(&id);
        correlation.retire(id);
        Some(id)
    }

    /// Forgets one conversation entirely; used after the chat is deleted.
    pub fn reset(&mut self, conversation_id: &ConversationId) {
        self.conversations.remove(conversation_id);
    }

    pub fn reset_all(&mut self) {
        self.conversations.clear();
    }

    /// Bumps and returns the consecutive failure count for `conversation_id`.
    pub fn record_transport_failure(&mut self, conversation_id: &ConversationId) -> u32 {
        let correlation = self.entry(conversation_id);
        correlation.transport_failures += 1;
        correlation.transport_failures
    }

    pub fn clear_transport_failures(&mut self, conversation_id: &ConversationId) {
        if let Some(correlation) = self.conversations.get_mut(conversation_id) {
            correlation.transport_failures = 0;
        }
    }
}
