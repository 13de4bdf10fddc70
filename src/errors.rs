use thiserror::Error;

/// A request or response envelope that breaks the protocol's shape rules.
/// Always reported straight back to the caller; never stored.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Field '{field_name}' cannot be empty")]
    EmptyField { field_name: &'static str },

    #[error("Field '{field_name}' exceeds max length of {max_length} (actual: {actual_length})")]
    FieldTooLong { field_name: &'static str, max_length: usize, actual_length: usize },

    #[error("Field '{field_name}' is required for {context}")]
    MissingField { field_name: &'static str, context: &'static str },

    #[error("Metadata entry '{key}' is invalid: {reason}")]
    InvalidMetadata { key: String, reason: String },

    #[error("Malformed envelope: {0}")]
    Malformed(String),
}

/// Backend error type shared by the gateway, the stores and the agents.
#[derive(Debug, Error)]
pub enum AppError {
    // ── Envelope errors ──────────────────────────────────────────────────────
    #[error(transparent)]
    Validation(#[from] ValidationError),

    // ── Response store errors ────────────────────────────────────────────────
    #[error("Database connection failed: {0}")]
    DatabaseConnectionFailed(#[source] sqlx::Error),

    #[error("Database query failed: {message}")]
    DatabaseQueryFailed {
        message: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Stored response for conversation '{conversation_id}' is corrupt: {source}")]
    CorruptStoredResponse {
        conversation_id: String,
        #[source]
        source: ValidationError,
    },

    // ── AI Agent errors ──────────────────────────────────────────────────────
    #[error("Ollama service unavailable at {host}")]
    OllamaUnavailable { host: String },

    #[error("Model '{model_name}' not found in Ollama")]
    ModelNotFound { model_name: String },

    #[error("Inference error: {message}")]
    InferenceError { message: String },

    #[error("Agent did not answer within {seconds}s")]
    AgentTimeout { seconds: u64 },

    #[error("Agent task panicked: {message}")]
    AgentPanicked { message: String },

    // ── System errors ────────────────────────────────────────────────────────
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn db_query(message: impl Into<String>, source: sqlx::Error) -> Self {
        AppError::DatabaseQueryFailed { message: message.into(), source }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, AppError::Validation(_))
    }

    /// Errors raised by the external agent. The gateway turns these into stored
    /// ERROR responses instead of returning them to the submitter.
    pub fn is_agent(&self) -> bool {
        matches!(
            self,
            AppError::OllamaUnavailable { .. }
                | AppError::ModelNotFound { .. }
                | AppError::InferenceError { .. }
                | AppError::AgentTimeout { .. }
                | AppError::AgentPanicked { .. }
        )
    }
}

/// Failure talking to the backend over HTTP.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("Server error {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Could not decode backend reply: {0}")]
    Decode(String),
}

impl TransportError {
    /// A 4xx reply means the request itself was rejected; retrying will not help.
    pub fn is_rejection(&self) -> bool {
        matches!(self, TransportError::Status { status, .. } if (400..500).contains(status))
    }
}

/// Errors the polling client hands to its caller.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Backend unreachable after {failures} consecutive failures")]
    BackendUnreachable { failures: u32 },
}
