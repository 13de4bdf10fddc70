use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::debug;

use crate::errors::AppError;
use crate::models::{ConversationId, Response};
use crate::store::ResponseStore;

type Queue = Arc<Mutex<VecDeque<Response>>>;

/// Process-local store. Each conversation owns its own queue lock, so writers on
/// different conversations never wait on each other; the map lock is only held
/// for writing when a conversation entry is created or destroyed.
#[derive(Default)]
pub struct InMemoryResponseStore {
    conversations: RwLock<HashMap<ConversationId, Queue>>,
}

impl InMemoryResponseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of responses waiting for `conversation_id`.
    pub fn pending_len(&self, conversation_id: &ConversationId) -> usize {
        let conversations = self.conversations.read().unwrap_or_else(PoisonError::into_inner);
        conversations
            .get(conversation_id)
            .map(|queue| queue.lock().unwrap_or_else(PoisonError::into_inner).len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ResponseStore for InMemoryResponseStore {
    async fn put(&self, conversation_id: &ConversationId, response: Response) -> Result<(), AppError> {
        // Push while still holding the map lock (read or write) so a concurrent
        // `clear` cannot detach the queue between lookup and push.
        {
            let conversations = self.conversations.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(queue) = conversations.get(conversation_id) {
                queue
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_back(response);
                return Ok(());
            }
        }

        let mut conversations = self.conversations.write().unwrap_or_else(PoisonError::into_inner);
        debug!(conversation_id = %conversation_id, "Creating response queue");
        conversations
            .entry(conversation_id.clone())
            .or_default()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(response);
        Ok(())
    }

    async fn take_first(&self, conversation_id: &ConversationId) -> Result<Option<Response>, AppError> {
        let (taken, drained) = {
            let conversations = self.conversations.read().unwrap_or_else(PoisonError::into_inner);
            match conversations.get(conversation_id) {
                Some(queue) => {
                    let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
                    (queue.pop_front(), queue.is_empty())
                }
                None => (None, false),
            }
        };

        if drained {
            // Writers push under the read lock, so the queue cannot refill while
            // the write lock is held.
            let mut conversations = self.conversations.write().unwrap_or_else(PoisonError::into_inner);
            let still_empty = conversations
                .get(conversation_id)
                .is_some_and(|queue| queue.lock().unwrap_or_else(PoisonError::into_inner).is_empty());
            if still_empty {
                conversations.remove(conversation_id);
                debug!(conversation_id = %conversation_id, "Dropped drained response queue");
            }
        }
        Ok(taken)
    }

    async fn clear(&self, conversation_id: &ConversationId) -> Result<(), AppError> {
        let mut conversations = self.conversations.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(queue) = conversations.remove(conversation_id) {
            let dropped = queue.lock().unwrap_or_else(PoisonError::into_inner).len();
            debug!(conversation_id = %conversation_id, dropped, "Cleared response queue");
        }
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), AppError> {
        let mut conversations = self.conversations.write().unwrap_or_else(PoisonError::into_inner);
        debug!(conversations = conversations.len(), "Clearing every response queue");
        conversations.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Metadata;

    fn conversation(id: &str) -> ConversationId {
        ConversationId::new(id).unwrap()
    }

    #[tokio::test]
    async fn take_first_on_empty_conversation_is_none() {
        let store = InMemoryResponseStore::new();
        assert_eq!(store.take_first(&conversation("nobody")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn responses_come_out_in_put_order_exactly_once() {
        let store = InMemoryResponseStore::new();
        let abc = conversation("abc");
        store.put(&abc, Response::success(abc.clone(), "first", Metadata::new()).unwrap()).await.unwrap();
        store.put(&abc, Response::success(abc.clone(), "second", Metadata::new()).unwrap()).await.unwrap();

        let first = store.take_first(&abc).await.unwrap().unwrap();
        let second = store.take_first(&abc).await.unwrap().unwrap();
        assert_eq!(first.message(), Some("first"));
        assert_eq!(second.message(), Some("second"));
        assert_eq!(store.take_first(&abc).await.unwrap(), None);
    }

    #[tokio::test]
    async fn drained_queues_are_dropped() {
        let store = InMemoryResponseStore::new();
        let abc = conversation("abc");
        let xyz = conversation("xyz");
        store.put(&abc, Response::failure(abc.clone(), "boom")).await.unwrap();
        store.put(&xyz, Response::failure(xyz.clone(), "boom")).await.unwrap();
        store.put(&xyz, Response::failure(xyz.clone(), "again")).await.unwrap();

        store.take_first(&abc).await.unwrap().unwrap();
        store.take_first(&xyz).await.unwrap().unwrap();
        {
            let conversations = store.conversations.read().unwrap();
            assert!(!conversations.contains_key(&abc));
            assert!(conversations.contains_key(&xyz));
        }

        store.take_first(&xyz).await.unwrap().unwrap();
        assert!(store.conversations.read().unwrap().is_empty());

        store.put(&abc, Response::failure(abc.clone(), "later")).await.unwrap();
        assert_eq!(store.pending_len(&abc), 1);
    }

    #[tokio::test]
    async fn clear_only_touches_one_conversation() {
        let store = InMemoryResponseStore::new();
        let abc = conversation("abc");
        let xyz = conversation("xyz");
        store.put(&abc, Response::failure(abc.clone(), "boom")).await.unwrap();
        store.put(&xyz, Response::success(xyz.clone(), "kept", Metadata::new()).unwrap()).await.unwrap();

        store.clear(&abc).await.unwrap();
        assert_eq!(store.pending_len(&abc), 0);
        assert_eq!(store.pending_len(&xyz), 1);

        store.clear_all().await.unwrap();
        assert_eq!(store.pending_len(&xyz), 0);
        assert_eq!(store.take_first(&xyz).await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_producers_keep_per_conversation_order() {
        let store = Arc::new(InMemoryResponseStore::new());
        let mut handles = Vec::new();
        for c in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let id = conversation(&format!("conv-{c}"));
                for n in 0..50 {
                    let response = Response::success(id.clone(), n.to_string(), Metadata::new()).unwrap();
                    store.put(&id, response).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for c in 0..8 {
            let id = conversation(&format!("conv-{c}"));
            for n in 0..50 {
                let taken = store.take_first(&id).await.unwrap().unwrap();
                assert_eq!(taken.message(), Some(n.to_string().as_str()));
            }
            assert_eq!(store.take_first(&id).await.unwrap(), None);
        }
    }
}
