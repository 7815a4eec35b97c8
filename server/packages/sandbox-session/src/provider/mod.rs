//! Sandbox provider boundary: create, stop, remove and read logs of one
//! disposable sandbox per session.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use sandbox_session_error::SessionError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use utoipa::ToSchema;

mod docker;
mod mock;

pub use docker::{DockerProvider, DockerProviderConfig};
pub use mock::{MockProvider, ProviderCall};

/// Label attached to every container this server creates.
pub const MANAGED_LABEL: &str = "sandbox-session.managed";

pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Raw log chunks (stdout and stderr interleaved) read from a sandbox.
pub type LogStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProviderError>> + Send>>;

/// Identifier the runtime assigned to a sandbox. Doubles as the session key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(transparent)]
pub struct SandboxId(String);

impl SandboxId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form used in log lines.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(12)
            .map(|(idx, _)| idx)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Image the sandbox is created from. Always server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef(String);

impl ImageRef {
    pub fn new(image: impl Into<String>) -> Self {
        Self(image.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits `repo:tag` into its parts, defaulting the tag to `latest`.
    /// A colon that belongs to a registry port (`host:5000/repo`) is not a tag.
    pub fn repository_and_tag(&self) -> (&str, &str) {
        match self.0.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo, tag),
            _ => (self.0.as_str(), "latest"),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One provisioned sandbox. Deliberately not `Clone`: the lifecycle instance
/// that created it is its only owner until cleanup consumes it.
#[derive(Debug)]
pub struct SandboxHandle {
    id: SandboxId,
    image: ImageRef,
    created_at: OffsetDateTime,
}

impl SandboxHandle {
    pub fn new(id: SandboxId, image: ImageRef) -> Self {
        Self {
            id,
            image,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn id(&self) -> &SandboxId {
        &self.id
    }

    pub fn image(&self) -> &ImageRef {
        &self.image
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// Keep the stream open and yield new output as it is produced.
    pub follow: bool,
    /// Only return the last `tail` lines.
    pub tail: Option<usize>,
}

impl LogOptions {
    pub fn follow() -> Self {
        Self {
            follow: true,
            tail: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("failed to provision sandbox from {image}: {message}")]
    Provision { image: String, message: String },
    #[error("sandbox {id} not found")]
    NotFound { id: String },
    #[error("sandbox {id} is already stopped")]
    AlreadyStopped { id: String },
    #[error("sandbox runtime error during {operation} on {id}: {message}")]
    Runtime {
        operation: &'static str,
        id: String,
        message: String,
    },
}

impl ProviderError {
    /// Errors that mean the cleanup goal is already met.
    pub fn is_tolerable(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::AlreadyStopped { .. })
    }
}

impl From<ProviderError> for SessionError {
    fn from(value: ProviderError) -> Self {
        match value {
            ProviderError::Provision { image, message } => SessionError::Provision { image, message },
            ProviderError::NotFound { id } => SessionError::NotFound {
                message: format!("sandbox {id}"),
            },
            err @ ProviderError::AlreadyStopped { .. } => SessionError::SandboxRuntime {
                operation: "stop".to_string(),
                message: err.to_string(),
            },
            ProviderError::Runtime {
                operation, message, ..
            } => SessionError::SandboxRuntime {
                operation: operation.to_string(),
                message,
            },
        }
    }
}

/// Adapter over the external sandbox runtime.
///
/// `stop` and `remove` must be safe to call again after a failure: a second
/// call against an already stopped or removed sandbox reports
/// [`ProviderError::AlreadyStopped`] or [`ProviderError::NotFound`], which
/// callers treat as success.
pub trait SandboxProvider: fmt::Debug + Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn create<'a>(&'a self, image: &'a ImageRef) -> ProviderFuture<'a, SandboxHandle>;

    fn fetch_logs<'a>(&'a self, id: &'a SandboxId, options: LogOptions) -> ProviderFuture<'a, LogStream>;

    fn stop<'a>(&'a self, handle: &'a SandboxHandle) -> ProviderFuture<'a, ()>;

    fn remove<'a>(&'a self, handle: &'a SandboxHandle) -> ProviderFuture<'a, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_ref_splits_tag() {
        assert_eq!(ImageRef::new("alpine:3.20").repository_and_tag(), ("alpine", "3.20"));
        assert_eq!(ImageRef::new("alpine").repository_and_tag(), ("alpine", "latest"));
        assert_eq!(
            ImageRef::new("registry.local:5000/tools/runner").repository_and_tag(),
            ("registry.local:5000/tools/runner", "latest")
        );
        assert_eq!(
            ImageRef::new("registry.local:5000/tools/runner:v2").repository_and_tag(),
            ("registry.local:5000/tools/runner", "v2")
        );
    }

    #[test]
    fn cleanup_tolerates_missing_or_stopped() {
        assert!(ProviderError::NotFound { id: "a".into() }.is_tolerable());
        assert!(ProviderError::AlreadyStopped { id: "a".into() }.is_tolerable());
        assert!(!ProviderError::Runtime {
            operation: "stop",
            id: "a".into(),
            message: "daemon unreachable".into(),
        }
        .is_tolerable());
    }

    #[test]
    fn short_id_truncates_long_container_ids() {
        let id = SandboxId::new("4f1c2d3e5a6b7c8d9e0f1a2b3c4d5e6f");
        assert_eq!(id.short(), "4f1c2d3e5a6b");
        assert_eq!(SandboxId::new("mock-1").short(), "mock-1");
    }
}
