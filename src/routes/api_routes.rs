use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::errors::{AppError, ValidationError};
use crate::models::{Ack, ConversationId, ReplyStatus, Request};
use crate::service::gateway_service::AgentGateway;

// ── Bodies ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ConversationQuery {
    pub conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteChatBody {
    #[serde(alias = "chat_id")]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    status: ReplyStatus,
    message: String,
}

// ── Handlers ─────────────────────────────────────────────────────────────────

/// POST `/input`: submit a serialized request.
pub async fn input_handler(
    State(gateway): State<AgentGateway>,
    payload: Result<Json<Request>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(request) => request,
        Err(rejection) => return bad_request(rejection.body_text()),
    };

    match gateway.submit(request).await {
        Ok(ack) => Json(ack).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/get_response?conversation_id=<id>`: pending is a 200, not an error.
pub async fn get_response_handler(
    State(gateway): State<AgentGateway>,
    query: Result<Query<ConversationQuery>, QueryRejection>,
) -> Response {
    let conversation_id = match query {
        Ok(Query(query)) => match parse_conversation(query.conversation_id) {
            Ok(id) => id,
            Err(e) => return bad_request(e.to_string()),
        },
        Err(rejection) => return bad_request(rejection.body_text()),
    };

    match gateway.get_response(&conversation_id).await {
        Ok(reply) => Json(reply).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST `/delete_all_history`
pub async fn delete_all_history_handler(State(gateway): State<AgentGateway>) -> Response {
    match gateway.delete_all().await {
        Ok(()) => Json(Ack::accepted(None)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST `/delete_chat`: body `{"conversation_id": ...}`.
pub async fn delete_chat_handler(
    State(gateway): State<AgentGateway>,
    body: Result<Json<DeleteChatBody>, JsonRejection>,
) -> Response {
    let conversation_id = match body {
        Ok(Json(body)) => match parse_conversation(body.conversation_id) {
            Ok(id) => id,
            Err(e) => return bad_request(e.to_string()),
        },
        Err(rejection) => return bad_request(rejection.body_text()),
    };

    match gateway.delete_chat(&conversation_id).await {
        Ok(()) => Json(Ack::accepted(None)).into_response(),
        Err(e) => error_response(&e),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn parse_conversation(raw: Option<String>) -> Result<ConversationId, ValidationError> {
    let raw = raw.ok_or(ValidationError::MissingField {
        field_name: "conversation_id",
        context: "this endpoint",
    })?;
    ConversationId::new(raw)
}

fn bad_request(message: String) -> Response {
    warn!("Rejected malformed request: {message}");
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody { status: ReplyStatus::Error, message }),
    )
        .into_response()
}

fn error_response(err: &AppError) -> Response {
    let status = if err.is_validation() {
        StatusCode::BAD_REQUEST
    } else {
        error!("Request failed: {err}");
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (
        status,
        Json(ErrorBody { status: ReplyStatus::Error, message: err.to_string() }),
    )
        .into_response()
}
