use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidEnvelope,
    RequestRejected,
    ProvisionFailed,
    SessionNotFound,
    SessionAlreadyExists,
    ChannelError,
    CleanupFailed,
    HandlerFailed,
    SandboxRuntime,
    Timeout,
    ShuttingDown,
    NotFound,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidEnvelope => "urn:sandbox-session:error:invalid_envelope",
            Self::RequestRejected => "urn:sandbox-session:error:request_rejected",
            Self::ProvisionFailed => "urn:sandbox-session:error:provision_failed",
            Self::SessionNotFound => "urn:sandbox-session:error:session_not_found",
            Self::SessionAlreadyExists => "urn:sandbox-session:error:session_already_exists",
            Self::ChannelError => "urn:sandbox-session:error:channel_error",
            Self::CleanupFailed => "urn:sandbox-session:error:cleanup_failed",
            Self::HandlerFailed => "urn:sandbox-session:error:handler_failed",
            Self::SandboxRuntime => "urn:sandbox-session:error:sandbox_runtime",
            Self::Timeout => "urn:sandbox-session:error:timeout",
            Self::ShuttingDown => "urn:sandbox-session:error:shutting_down",
            Self::NotFound => "urn:sandbox-session:error:not_found",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidEnvelope => "Invalid Envelope",
            Self::RequestRejected => "Request Rejected",
            Self::ProvisionFailed => "Provision Failed",
            Self::SessionNotFound => "Session Not Found",
            Self::SessionAlreadyExists => "Session Already Exists",
            Self::ChannelError => "Channel Error",
            Self::CleanupFailed => "Cleanup Failed",
            Self::HandlerFailed => "Handler Failed",
            Self::SandboxRuntime => "Sandbox Runtime Error",
            Self::Timeout => "Timeout",
            Self::ShuttingDown => "Shutting Down",
            Self::NotFound => "Not Found",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidEnvelope => 400,
            Self::RequestRejected => 422,
            Self::ProvisionFailed => 503,
            Self::SessionNotFound => 404,
            Self::SessionAlreadyExists => 409,
            Self::ChannelError => 502,
            Self::CleanupFailed => 500,
            Self::HandlerFailed => 500,
            Self::SandboxRuntime => 502,
            Self::Timeout => 504,
            Self::ShuttingDown => 503,
            Self::NotFound => 404,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

/// Every failure a session or the inspection API can surface.
///
/// Variants follow the lifecycle taxonomy: `Provision` never reaches an active
/// session, `Decode` and `Rejected` are recovered locally, `Channel` and
/// `HandlerFailed` end the session, `Cleanup` is only ever logged, and
/// `DuplicateSession` / `SessionNotFound` mean the record/sandbox pairing broke.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("sandbox provisioning failed for image {image}: {message}")]
    Provision { image: String, message: String },
    #[error("malformed envelope: {message}")]
    Decode { message: String },
    #[error("request rejected: {message}")]
    Rejected { message: String },
    #[error("channel error: {message}")]
    Channel { message: String },
    #[error("cleanup {operation} failed for session {session_id}: {message}")]
    Cleanup {
        session_id: String,
        operation: String,
        message: String,
    },
    #[error("session already exists: {session_id}")]
    DuplicateSession { session_id: String },
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("request handler failed: {message}")]
    HandlerFailed { message: String },
    #[error("sandbox runtime error during {operation}: {message}")]
    SandboxRuntime { operation: String, message: String },
    #[error("session {session_id} idle for {idle_secs}s")]
    IdleTimeout { session_id: String, idle_secs: u64 },
    #[error("server is shutting down")]
    ShuttingDown,
    #[error("not found: {message}")]
    NotFound { message: String },
}

impl SessionError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::Provision { .. } => ErrorType::ProvisionFailed,
            Self::Decode { .. } => ErrorType::InvalidEnvelope,
            Self::Rejected { .. } => ErrorType::RequestRejected,
            Self::Channel { .. } => ErrorType::ChannelError,
            Self::Cleanup { .. } => ErrorType::CleanupFailed,
            Self::DuplicateSession { .. } => ErrorType::SessionAlreadyExists,
            Self::SessionNotFound { .. } => ErrorType::SessionNotFound,
            Self::HandlerFailed { .. } => ErrorType::HandlerFailed,
            Self::SandboxRuntime { .. } => ErrorType::SandboxRuntime,
            Self::IdleTimeout { .. } => ErrorType::Timeout,
            Self::ShuttingDown => ErrorType::ShuttingDown,
            Self::NotFound { .. } => ErrorType::NotFound,
        }
    }

    /// Whether the error leaves the session usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Decode { .. } | Self::Rejected { .. })
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Cleanup { session_id, .. }
            | Self::DuplicateSession { session_id }
            | Self::SessionNotFound { session_id }
            | Self::IdleTimeout { session_id, .. } => Some(session_id),
            _ => None,
        }
    }

    fn details(&self) -> Option<Value> {
        let mut map = Map::new();
        match self {
            Self::Provision { image, .. } => {
                map.insert("image".to_string(), Value::String(image.clone()));
            }
            Self::Cleanup { operation, .. } | Self::SandboxRuntime { operation, .. } => {
                map.insert("operation".to_string(), Value::String(operation.clone()));
            }
            Self::IdleTimeout { idle_secs, .. } => {
                map.insert(
                    "idleSecs".to_string(),
                    Value::Number(serde_json::Number::from(*idle_secs)),
                );
            }
            _ => {}
        }
        if map.is_empty() {
            None
        } else {
            Some(Value::Object(map))
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));

        let mut extensions = Map::new();
        if let Some(session_id) = self.session_id() {
            extensions.insert(
                "sessionId".to_string(),
                Value::String(session_id.to_string()),
            );
        }
        if let Some(details) = self.details() {
            extensions.insert("details".to_string(), details);
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<SessionError> for ProblemDetails {
    fn from(value: SessionError) -> Self {
        value.to_problem_details()
    }
}

impl From<&SessionError> for ProblemDetails {
    fn from(value: &SessionError) -> Self {
        value.to_problem_details()
    }
}
