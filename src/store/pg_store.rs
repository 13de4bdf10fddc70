use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, error, info};

use crate::errors::AppError;
use crate::models::{ConversationId, Metadata, Response, ResponseStatus};
use crate::store::ResponseStore;

/// PostgreSQL-backed store. Survives backend restarts and can be shared by
/// several backend processes; `take_first` locks the row it deletes, so two
/// pollers racing on one conversation never receive the same response.
#[derive(Clone)]
pub struct PgResponseStore {
    pool: PgPool,
}

impl PgResponseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects and applies the bundled migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(AppError::DatabaseConnectionFailed)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| AppError::Unexpected(format!("Failed to run database migrations: {e}")))?;

        info!("Database connection established and migrations applied");
        Ok(Self::new(pool))
    }
}

fn read_response(conversation_id: &ConversationId, row: &PgRow) -> Result<Response, AppError> {
    let status: String = row
        .try_get("status")
        .map_err(|e| AppError::db_query("Failed to read status", e))?;
    let message: Option<String> = row
        .try_get("message")
        .map_err(|e| AppError::db_query("Failed to read message", e))?;
    let Json(metadata): Json<Metadata> = row
        .try_get("metadata")
        .map_err(|e| AppError::db_query("Failed to read metadata", e))?;
    let created_at: DateTime<Utc> = row
        .try_get("created_at")
        .map_err(|e| AppError::db_query("Failed to read created_at", e))?;

    let corrupt = |source| AppError::CorruptStoredResponse {
        conversation_id: conversation_id.to_string(),
        source,
    };
    let status = ResponseStatus::try_from(status).map_err(corrupt)?;
    let response = Response::from_parts(conversation_id.clone(), status, message, metadata)
        .map_err(corrupt)?;
    debug!(
        conversation_id = %conversation_id,
        waited_ms = (Utc::now() - created_at).num_milliseconds(),
        "Delivering stored response"
    );
    Ok(response)
}

#[async_trait]
impl ResponseStore for PgResponseStore {
    async fn put(&self, conversation_id: &ConversationId, response: Response) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO pending_responses (conversation_id, status, message, metadata, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(conversation_id.as_str())
        .bind(response.status().as_str())
        .bind(response.message())
        .bind(Json(response.metadata()))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to store response for conversation {conversation_id}: {e}");
            AppError::db_query("Failed to store response", e)
        })?;
        Ok(())
    }

    async fn take_first(&self, conversation_id: &ConversationId) -> Result<Option<Response>, AppError> {
        let row = sqlx::query(
            "DELETE FROM pending_responses
             WHERE seq = (
                 SELECT seq FROM pending_responses
                 WHERE conversation_id = $1
                 ORDER BY seq ASC
                 LIMIT 1
                 FOR UPDATE
             )
             RETURNING status, message, metadata, created_at",
        )
        .bind(conversation_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to take response for conversation {conversation_id}: {e}");
            AppError::db_query(format!("Failed to take response for conversation {conversation_id}"), e)
        })?;

        row.map(|row| read_response(conversation_id, &row)).transpose()
    }

    async fn clear(&self, conversation_id: &ConversationId) -> Result<(), AppError> {
        let result = sqlx::query("DELETE FROM pending_responses WHERE conversation_id = $1")
            .bind(conversation_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to clear conversation {conversation_id}: {e}");
                AppError::db_query("Failed to clear conversation", e)
            })?;
        debug!(conversation_id = %conversation_id, dropped = result.rows_affected(), "Cleared response queue");
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), AppError> {
        sqlx::query("DELETE FROM pending_responses")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to clear all conversations: {e}");
                AppError::db_query("Failed to clear all conversations", e)
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::models::Metadata;

    /// Needs a disposable database: `DATABASE_URL=... cargo test -- --ignored`.
    async fn live_store() -> PgResponseStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL for live store tests");
        PgResponseStore::connect(&url, 4).await.unwrap()
    }

    #[tokio::test]
    #[ignore]
    async fn take_first_waits_for_a_locked_head_instead_of_skipping_it() {
        let store = live_store().await;
        let conversation = ConversationId::generate();
        for text in ["first", "second"] {
            let response = Response::success(conversation.clone(), text, Metadata::new()).unwrap();
            store.put(&conversation, response).await.unwrap();
        }

        // Another poller holds the head row and then rolls back.
        let mut tx = store.pool.begin().await.unwrap();
        sqlx::query(
            "SELECT seq FROM pending_responses WHERE conversation_id = $1
             ORDER BY seq ASC LIMIT 1 FOR UPDATE",
        )
        .bind(conversation.as_str())
        .fetch_one(&mut *tx)
        .await
        .unwrap();

        let taker = tokio::spawn({
            let store = store.clone();
            let conversation = conversation.clone();
            async move { store.take_first(&conversation).await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.rollback().await.unwrap();

        let taken = taker.await.unwrap().unwrap().unwrap();
        assert_eq!(taken.message(), Some("first"));
        let next = store.take_first(&conversation).await.unwrap().unwrap();
        assert_eq!(next.message(), Some("second"));
        assert_eq!(store.take_first(&conversation).await.unwrap(), None);
    }
}
