use std::fmt;
use std::future::Future;
use std::pin::Pin;

use sandbox_session_error::SessionError;
use thiserror::Error;

use crate::codec::ClientRequest;
use crate::provider::SandboxId;
use crate::store::ResultEntry;

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<ResultEntry, HandlerError>> + Send + 'a>>;

/// What a handler knows about the session a request arrived on.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: SandboxId,
    /// 1-based position of the request among the session's decoded requests.
    pub sequence: u64,
}

#[derive(Debug, Error)]
pub enum HandlerError {
    /// The request was understood but refused. The session carries on.
    #[error("{0}")]
    Rejected(String),
    /// The handler cannot continue serving this session.
    #[error("{0}")]
    Fatal(String),
}

impl From<HandlerError> for SessionError {
    fn from(value: HandlerError) -> Self {
        match value {
            HandlerError::Rejected(message) => SessionError::Rejected { message },
            HandlerError::Fatal(message) => SessionError::HandlerFailed { message },
        }
    }
}

/// Business logic that turns one client request into one result entry.
pub trait RequestHandler: fmt::Debug + Send + Sync + 'static {
    fn handle<'a>(&'a self, ctx: &'a SessionContext, request: ClientRequest) -> HandlerFuture<'a>;
}

/// Default handler dispatching on the request's `op` field.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpHandler;

impl RequestHandler for OpHandler {
    fn handle<'a>(&'a self, ctx: &'a SessionContext, request: ClientRequest) -> HandlerFuture<'a> {
        Box::pin(async move {
            match request.op.as_deref() {
                Some("ping") => Ok(ResultEntry::new("pong")),
                Some("echo") => serde_json::to_string(&request.payload)
                    .map(ResultEntry::new)
                    .map_err(|err| HandlerError::Fatal(err.to_string())),
                Some(other) => Err(HandlerError::Rejected(format!("unsupported op: {other}"))),
                None => {
                    tracing::debug!(
                        session_id = %ctx.session_id.short(),
                        sequence = ctx.sequence,
                        "request without op"
                    );
                    Ok(ResultEntry::new("request received"))
                }
            }
        })
    }
}
