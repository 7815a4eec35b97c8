//! Envelope codec for the session channel.
//!
//! Clients send one JSON value per frame. The server answers every
//! processed message with the full session record, or with an error
//! envelope when the message could not be handled.

use sandbox_session_error::{ProblemDetails, SessionError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use utoipa::ToSchema;

use crate::channel::Frame;
use crate::provider::SandboxId;
use crate::store::{ResultEntry, SessionRecord, SessionStatus};

/// Request sent by a client. Only a string `op` field of an object is
/// interpreted by the server; everything else is handed to the request
/// handler untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientRequest {
    pub op: Option<String>,
    pub payload: Value,
}

impl ClientRequest {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(mut fields) => match fields.remove("op") {
                Some(Value::String(op)) => Self {
                    op: Some(op),
                    payload: Value::Object(fields),
                },
                Some(other) => {
                    fields.insert("op".to_string(), other);
                    Self {
                        op: None,
                        payload: Value::Object(fields),
                    }
                }
                None => Self {
                    op: None,
                    payload: Value::Object(fields),
                },
            },
            other => Self {
                op: None,
                payload: other,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionEnvelope {
    pub sandbox_id: SandboxId,
    pub status: SessionStatus,
    pub results: Vec<ResultEntry>,
}

impl From<&SessionRecord> for SessionEnvelope {
    fn from(record: &SessionRecord) -> Self {
        Self {
            sandbox_id: record.session_id.clone(),
            status: record.status,
            results: record.results.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<SandboxId>,
    pub error: ProblemDetails,
}

/// Any message the server writes to a client.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(untagged)]
pub enum ServerEnvelope {
    Session(SessionEnvelope),
    Error(ErrorEnvelope),
}

impl ServerEnvelope {
    pub fn session(record: &SessionRecord) -> Self {
        Self::Session(SessionEnvelope::from(record))
    }

    pub fn error(sandbox_id: Option<&SandboxId>, error: &SessionError) -> Self {
        Self::Error(ErrorEnvelope {
            sandbox_id: sandbox_id.cloned(),
            error: error.to_problem_details(),
        })
    }

    /// Serializes the envelope into a text frame.
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|err| {
            tracing::error!(error = %err, "failed to encode server envelope");
            r#"{"error":{"type":"urn:sandbox-session:error:handler_failed","title":"Handler Failed","status":500}}"#
                .to_string()
        })
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("binary frame is not valid UTF-8")]
    InvalidUtf8,
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

impl From<DecodeError> for SessionError {
    fn from(value: DecodeError) -> Self {
        SessionError::Decode {
            message: value.to_string(),
        }
    }
}

pub fn decode_request(frame: &Frame) -> Result<ClientRequest, DecodeError> {
    let text = match frame {
        Frame::Text(text) => text.as_str(),
        Frame::Binary(bytes) => std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)?,
    };
    let value: Value = serde_json::from_str(text)?;
    Ok(ClientRequest::from_value(value))
}
