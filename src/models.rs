use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::errors::ValidationError;

pub const MAX_MESSAGE_LENGTH: usize = 8000;

/// Metadata key holding the correlation token a request carries and a response answers.
pub const MESSAGE_ID_KEY: &str = "message_id";
/// Metadata key for a response that answers several messages at once.
pub const MESSAGE_IDS_KEY: &str = "message_ids";
/// Metadata key describing why a response is an ERROR.
pub const ERROR_KEY: &str = "error";

pub type Metadata = Map<String, Value>;

// ── Identifiers ───────────────────────────────────────────────────────────────

/// Identifies one chat thread. Primary key into the response store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ValidationError::EmptyField { field_name: "conversation_id" });
        }
        Ok(Self(id))
    }

    /// A fresh id for a new chat thread.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ConversationId {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<ConversationId> for String {
    fn from(id: ConversationId) -> Self {
        id.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-message correlation token generated by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self).map_err(|e| ValidationError::InvalidMetadata {
            key: MESSAGE_ID_KEY.to_string(),
            reason: e.to_string(),
        })
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

/// Metadata carrying nothing but a correlation token.
pub fn metadata_for(message_id: MessageId) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert(MESSAGE_ID_KEY.to_string(), Value::String(message_id.to_string()));
    metadata
}

/// Every correlation token found in `metadata`, rejecting malformed ones.
fn correlation_ids(metadata: &Metadata) -> Result<Vec<MessageId>, ValidationError> {
    let invalid = |key: &str, reason: &str| ValidationError::InvalidMetadata {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    let mut ids = Vec::new();
    match metadata.get(MESSAGE_ID_KEY) {
        None | Some(Value::Null) => {}
        Some(Value::String(s)) => ids.push(s.parse()?),
        Some(_) => return Err(invalid(MESSAGE_ID_KEY, "expected a UUID string")),
    }
    match metadata.get(MESSAGE_IDS_KEY) {
        None | Some(Value::Null) => {}
        Some(Value::Array(values)) => {
            for value in values {
                let s = value
                    .as_str()
                    .ok_or_else(|| invalid(MESSAGE_IDS_KEY, "expected an array of UUID strings"))?;
                let id: MessageId = s.parse()?;
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        Some(_) => return Err(invalid(MESSAGE_IDS_KEY, "expected an array of UUID strings")),
    }
    Ok(ids)
}

// ── Request ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestKind {
    Text,
    DeleteConversation,
    DeleteAll,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Text => "TEXT",
            RequestKind::DeleteConversation => "DELETE_CONVERSATION",
            RequestKind::DeleteAll => "DELETE_ALL",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message from the client to the agent gateway.
///
/// Fields are private: a `Request` can only come out of one of the constructors
/// below, and deserialization goes through the same checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RequestWire", into = "RequestWire")]
pub struct Request {
    conversation_id: Option<ConversationId>,
    kind: RequestKind,
    payload: Option<String>,
    metadata: Metadata,
}

#[derive(Serialize, Deserialize)]
struct RequestWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    conversation_id: Option<ConversationId>,
    kind: RequestKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
    #[serde(default)]
    metadata: Metadata,
}

impl Request {
    pub fn text(
        conversation_id: ConversationId,
        message: impl Into<String>,
        metadata: Metadata,
    ) -> Result<Self, ValidationError> {
        let message = message.into();
        if message.trim().is_empty() {
            return Err(ValidationError::EmptyField { field_name: "payload" });
        }
        if message.len() > MAX_MESSAGE_LENGTH {
            return Err(ValidationError::FieldTooLong {
                field_name: "payload",
                max_length: MAX_MESSAGE_LENGTH,
                actual_length: message.len(),
            });
        }
        correlation_ids(&metadata)?;
        Ok(Self {
            conversation_id: Some(conversation_id),
            kind: RequestKind::Text,
            payload: Some(message),
            metadata,
        })
    }

    pub fn delete_conversation(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id: Some(conversation_id),
            kind: RequestKind::DeleteConversation,
            payload: None,
            metadata: Metadata::new(),
        }
    }

    pub fn delete_all() -> Self {
        Self {
            conversation_id: None,
            kind: RequestKind::DeleteAll,
            payload: None,
            metadata: Metadata::new(),
        }
    }

    /// `None` only for `DELETE_ALL`.
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.conversation_id.as_ref()
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn message_id(&self) -> Option<MessageId> {
        self.metadata
            .get(MESSAGE_ID_KEY)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }
}

impl TryFrom<RequestWire> for Request {
    type Error = ValidationError;

    fn try_from(wire: RequestWire) -> Result<Self, Self::Error> {
        match wire.kind {
            RequestKind::Text => {
                let conversation_id = wire.conversation_id.ok_or(ValidationError::MissingField {
                    field_name: "conversation_id",
                    context: "TEXT requests",
                })?;
                let payload = wire
                    .payload
                    .ok_or(ValidationError::EmptyField { field_name: "payload" })?;
                Request::text(conversation_id, payload, wire.metadata)
            }
            RequestKind::DeleteConversation => {
                let conversation_id = wire.conversation_id.ok_or(ValidationError::MissingField {
                    field_name: "conversation_id",
                    context: "DELETE_CONVERSATION requests",
                })?;
                correlation_ids(&wire.metadata)?;
                Ok(Self { metadata: wire.metadata, ..Request::delete_conversation(conversation_id) })
            }
            RequestKind::DeleteAll => {
                correlation_ids(&wire.metadata)?;
                Ok(Self { metadata: wire.metadata, ..Request::delete_all() })
            }
        }
    }
}

impl From<Request> for RequestWire {
    fn from(request: Request) -> Self {
        Self {
            conversation_id: request.conversation_id,
            kind: request.kind,
            payload: request.payload,
            metadata: request.metadata,
        }
    }
}

// ── Response ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseStatus {
    Success,
    Pending,
    Error,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Success => "SUCCESS",
            ResponseStatus::Pending => "PENDING",
            ResponseStatus::Error => "ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResponseStatus::Pending)
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for ResponseStatus {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, ValidationError> {
        match s.to_uppercase().as_str() {
            "SUCCESS" => Ok(ResponseStatus::Success),
            "PENDING" => Ok(ResponseStatus::Pending),
            "ERROR" => Ok(ResponseStatus::Error),
            other => Err(ValidationError::Malformed(format!("unknown response status: {other}"))),
        }
    }
}

/// The backend's answer to one request, as stored and as polled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ResponseWire", into = "ResponseWire")]
pub struct Response {
    conversation_id: ConversationId,
    message: Option<String>,
    status: ResponseStatus,
    metadata: Metadata,
}

#[derive(Serialize, Deserialize)]
struct ResponseWire {
    conversation_id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    status: ResponseStatus,
    #[serde(default)]
    metadata: Metadata,
}

impl Response {
    /// Fails when `metadata` carries a malformed correlation id.
    pub fn success(
        conversation_id: ConversationId,
        message: impl Into<String>,
        metadata: Metadata,
    ) -> Result<Self, ValidationError> {
        Self::from_parts(
            conversation_id,
            ResponseStatus::Success,
            Some(message.into()),
            metadata,
        )
    }

    pub fn pending(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            message: None,
            status: ResponseStatus::Pending,
            metadata: Metadata::new(),
        }
    }

    /// Fails unless `metadata` holds a non-empty `"error"` string.
    pub fn error(conversation_id: ConversationId, metadata: Metadata) -> Result<Self, ValidationError> {
        Self::from_parts(conversation_id, ResponseStatus::Error, None, metadata)
    }

    /// ERROR response whose metadata is just the given description.
    pub fn failure(conversation_id: ConversationId, description: impl Into<String>) -> Self {
        let description = description.into();
        let description = if description.trim().is_empty() {
            "unknown error".to_string()
        } else {
            description
        };
        let mut metadata = Metadata::new();
        metadata.insert(ERROR_KEY.to_string(), Value::String(description));
        Self {
            conversation_id,
            message: None,
            status: ResponseStatus::Error,
            metadata,
        }
    }

    /// Checked assembly from loose fields, used by deserialization and by stores
    /// reading rows back.
    pub fn from_parts(
        conversation_id: ConversationId,
        status: ResponseStatus,
        message: Option<String>,
        metadata: Metadata,
    ) -> Result<Self, ValidationError> {
        match status {
            ResponseStatus::Success => {
                if message.is_none() {
                    return Err(ValidationError::MissingField {
                        field_name: "message",
                        context: "SUCCESS responses",
                    });
                }
            }
            ResponseStatus::Pending => {
                if message.is_some() {
                    return Err(ValidationError::Malformed(
                        "PENDING responses carry no message".to_string(),
                    ));
                }
            }
            ResponseStatus::Error => match metadata.get(ERROR_KEY) {
                Some(Value::String(s)) if !s.trim().is_empty() => {}
                Some(_) => {
                    return Err(ValidationError::InvalidMetadata {
                        key: ERROR_KEY.to_string(),
                        reason: "expected a non-empty string".to_string(),
                    });
                }
                None => {
                    return Err(ValidationError::MissingField {
                        field_name: "metadata.error",
                        context: "ERROR responses",
                    });
                }
            },
        }
        correlation_ids(&metadata)?;
        Ok(Self { conversation_id, message, status, metadata })
    }

    /// Records which client message this response answers.
    pub fn answering(mut self, message_id: Option<MessageId>) -> Self {
        if let Some(id) = message_id {
            self.metadata
                .insert(MESSAGE_ID_KEY.to_string(), Value::String(id.to_string()));
        }
        self
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn is_pending(&self) -> bool {
        self.status == ResponseStatus::Pending
    }

    pub fn is_error(&self) -> bool {
        self.status == ResponseStatus::Error
    }

    /// The `"error"` description of an ERROR response.
    pub fn error_description(&self) -> Option<&str> {
        self.metadata.get(ERROR_KEY).and_then(Value::as_str)
    }

    /// Every client message this response answers.
    pub fn message_ids(&self) -> Vec<MessageId> {
        correlation_ids(&self.metadata).unwrap_or_default()
    }
}

impl TryFrom<ResponseWire> for Response {
    type Error = ValidationError;
    fn try_from(wire: ResponseWire) -> Result<Self, Self::Error> {
        Response::from_parts(wire.conversation_id, wire.status, wire.message, wire.metadata)
    }
}

impl From<Response> for ResponseWire {
    fn from(response: Response) -> Self {
        Self {
            conversation_id: response.conversation_id,
            message: response.message,
            status: response.status,
            metadata: response.metadata,
        }
    }
}

// ── HTTP bodies ───────────────────────────────────────────────────────────────

/// Lower-case status used in HTTP acknowledgments and poll replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Success,
    Pending,
    Error,
}

/// Body returned by `POST /input` and the delete endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
}

impl Ack {
    pub fn accepted(message_id: Option<MessageId>) -> Self {
        Self { status: ReplyStatus::Success, message_id }
    }
}

/// Body returned by `GET /get_response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollReply {
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_response: Option<Response>,
}

impl PollReply {
    pub fn pending() -> Self {
        Self { status: ReplyStatus::Pending, ai_response: None }
    }

    /// Wraps whatever `take_first` produced.
    pub fn from_taken(taken: Option<Response>) -> Self {
        match taken {
            None => Self::pending(),
            Some(response) => {
                let status = match response.status() {
                    ResponseStatus::Success => ReplyStatus::Success,
                    ResponseStatus::Pending => ReplyStatus::Pending,
                    ResponseStatus::Error => ReplyStatus::Error,
                };
                Self { status, ai_response: Some(response) }
            }
        }
    }
}
