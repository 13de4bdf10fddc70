pub mod memory_store;
pub mod pg_store;

use async_trait::async_trait;

use crate::errors::AppError;
use crate::models::{ConversationId, Response};

pub use memory_store::InMemoryResponseStore;
pub use pg_store::PgResponseStore;

/// Hand-off point between the agent gateway (producer) and pollers (consumer).
///
/// Per conversation the store is a FIFO: responses come back out in the order
/// they were `put`, and each one comes out at most once.
#[async_trait]
pub trait ResponseStore: Send + Sync {
    /// Appends `response` to the conversation's pending sequence.
    async fn put(&self, conversation_id: &ConversationId, response: Response) -> Result<(), AppError>;

    /// Removes and returns the oldest pending response. `None` means nothing is
    /// ready yet, which is the protocol's PENDING case rather than an error.
    async fn take_first(&self, conversation_id: &ConversationId) -> Result<Option<Response>, AppError>;

    async fn clear(&self, conversation_id: &ConversationId) -> Result<(), AppError>;

    async fn clear_all(&self) -> Result<(), AppError>;
}
