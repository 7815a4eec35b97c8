//! Session Lifecycle Manager.
//!
//! One [`SessionLifecycle::run`] call owns one connection from accept to
//! teardown:
//!
//! ```text
//! Init --sandbox created--> Active --closed / error / idle / shutdown--> Closing --cleanup--> Terminated
//! Init --create failed----------------------------------------------------------------------> Terminated
//! ```
//!
//! Once a sandbox exists, a [`CleanupGuard`] owns its handle. Cleanup runs in
//! a detached task, so it completes even if the session task is aborted or
//! the handler panics halfway through a message.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use sandbox_session_error::SessionError;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::channel::{ChannelError, DuplexChannel, Frame};
use crate::codec::{decode_request, ServerEnvelope};
use crate::handler::{RequestHandler, SessionContext};
use crate::provider::{
    ImageRef, LogOptions, ProviderError, SandboxHandle, SandboxId, SandboxProvider,
};
use crate::store::{SessionRecord, SessionStore};

const CLEANUP_RETRY_DELAY: Duration = Duration::from_millis(250);
/// Upper bound for the farewell error frame and the close handshake. A peer
/// that stopped reading must not hold the session open.
const CHANNEL_FAREWELL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub image: ImageRef,
    /// Close sessions that receive nothing for this long.
    pub idle_timeout: Option<Duration>,
    /// Forward sandbox output to the server log while the session is active.
    pub follow_logs: bool,
}

impl SessionConfig {
    pub fn new(image: ImageRef) -> Self {
        Self {
            image,
            idle_timeout: None,
            follow_logs: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Init,
    Active,
    Closing,
    Terminated,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Terminated => "terminated",
        }
    }

    pub fn can_transition_to(&self, next: SessionPhase) -> bool {
        matches!(
            (self, next),
            (Self::Init, Self::Active)
                | (Self::Init, Self::Terminated)
                // sandbox exists but was never registered
                | (Self::Init, Self::Closing)
                | (Self::Active, Self::Closing)
                | (Self::Closing, Self::Terminated)
        )
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    ProvisionFailed,
    ClientClosed,
    ChannelError,
    HandlerFailed,
    IdleTimeout,
    Shutdown,
    StoreInvariant,
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProvisionFailed => "provision_failed",
            Self::ClientClosed => "client_closed",
            Self::ChannelError => "channel_error",
            Self::HandlerFailed => "handler_failed",
            Self::IdleTimeout => "idle_timeout",
            Self::Shutdown => "shutdown",
            Self::StoreInvariant => "store_invariant",
        }
    }
}

struct PhaseTracker {
    phase: SessionPhase,
    session_id: Option<SandboxId>,
    started: Instant,
}

impl PhaseTracker {
    fn new() -> Self {
        Self {
            phase: SessionPhase::Init,
            session_id: None,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, next: SessionPhase) {
        if !self.phase.can_transition_to(next) {
            tracing::error!(
                from = self.phase.as_str(),
                to = next.as_str(),
                "invalid session phase transition"
            );
        }
        let session_id = self
            .session_id
            .as_ref()
            .map(|id| id.short().to_string())
            .unwrap_or_default();
        tracing::debug!(
            session_id = %session_id,
            from = self.phase.as_str(),
            to = next.as_str(),
            age_ms = self.started.elapsed().as_millis() as u64,
            "session phase"
        );
        self.phase = next;
    }
}

enum Inbound {
    Frame(Frame),
    Closed,
    Failed(ChannelError),
    Idle,
}

/// Drives one connection through its session. Cheap to clone; every accepted
/// connection gets its own clone.
#[derive(Debug, Clone)]
pub struct SessionLifecycle {
    provider: Arc<dyn SandboxProvider>,
    store: Arc<SessionStore>,
    handler: Arc<dyn RequestHandler>,
    config: SessionConfig,
    shutdown: watch::Receiver<bool>,
}

impl SessionLifecycle {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        store: Arc<SessionStore>,
        handler: Arc<dyn RequestHandler>,
        config: SessionConfig,
    ) -> Self {
        // Sender dropped right away: the receiver never reports a shutdown.
        let (_tx, shutdown) = watch::channel(false);
        Self {
            provider,
            store,
            handler,
            config,
            shutdown,
        }
    }

    /// Ends active sessions once `shutdown` flips to `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub async fn run<C: DuplexChannel>(&self, mut channel: C) -> SessionOutcome {
        let mut phase = PhaseTracker::new();

        let handle = match self.provider.create(&self.config.image).await {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!(
                    image = %self.config.image,
                    provider = self.provider.name(),
                    error = %err,
                    "sandbox provisioning failed"
                );
                let err = SessionError::from(err);
                send_farewell(&mut channel, ServerEnvelope::error(None, &err).to_frame()).await;
                close_channel(&mut channel).await;
                phase.advance(SessionPhase::Terminated);
                return SessionOutcome::ProvisionFailed;
            }
        };

        let session_id = handle.id().clone();
        phase.session_id = Some(session_id.clone());
        let record = SessionRecord::for_sandbox(&handle);
        let mut guard = CleanupGuard::new(self.provider.clone(), self.store.clone(), handle);

        let outcome = match self.store.insert(record).await {
            Ok(()) => {
                guard.registered = true;
                phase.advance(SessionPhase::Active);
                tracing::info!(
                    session_id = %session_id.short(),
                    image = %self.config.image,
                    "session started"
                );
                let log_task = self.spawn_log_follower(&session_id);
                let outcome = self.serve(&session_id, &mut channel).await;
                if let Some(task) = log_task {
                    task.abort();
                }
                outcome
            }
            Err(err) => {
                tracing::error!(
                    session_id = %session_id,
                    error = %err,
                    "sandbox id already registered to another session"
                );
                SessionOutcome::StoreInvariant
            }
        };

        phase.advance(SessionPhase::Closing);
        // Cleanup must not wait on the peer.
        let cleanup = guard.spawn_cleanup();
        close_channel(&mut channel).await;
        if let Some(cleanup) = cleanup {
            if let Err(err) = cleanup.await {
                tracing::error!(session_id = %session_id, error = %err, "sandbox cleanup task failed");
            }
        }
        phase.advance(SessionPhase::Terminated);
        tracing::info!(
            session_id = %session_id.short(),
            outcome = outcome.as_str(),
            "session ended"
        );
        outcome
    }

    async fn serve<C: DuplexChannel>(&self, session_id: &SandboxId, channel: &mut C) -> SessionOutcome {
        let mut shutdown = self.shutdown.clone();
        let mut sequence: u64 = 0;

        loop {
            let inbound = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => {
                    tracing::info!(session_id = %session_id.short(), "server shutting down; closing session");
                    return SessionOutcome::Shutdown;
                }
                inbound = next_inbound(&mut *channel, self.config.idle_timeout) => inbound,
            };

            let frame = match inbound {
                Inbound::Frame(frame) => frame,
                Inbound::Closed => {
                    tracing::debug!(session_id = %session_id.short(), "client closed channel");
                    return SessionOutcome::ClientClosed;
                }
                Inbound::Failed(err) => {
                    tracing::warn!(session_id = %session_id.short(), error = %err, "channel failed");
                    return SessionOutcome::ChannelError;
                }
                Inbound::Idle => {
                    let idle_secs = self
                        .config
                        .idle_timeout
                        .map(|timeout| timeout.as_secs())
                        .unwrap_or_default();
                    let err = SessionError::IdleTimeout {
                        session_id: session_id.to_string(),
                        idle_secs,
                    };
                    tracing::info!(session_id = %session_id.short(), idle_secs, "session idle; closing");
                    send_farewell(channel, ServerEnvelope::error(Some(session_id), &err).to_frame()).await;
                    return SessionOutcome::IdleTimeout;
                }
            };

            sequence += 1;
            let started = Instant::now();
            let reply = match self.process(session_id, sequence, &frame).await {
                Ok(record) => ServerEnvelope::session(&record),
                Err(err) if err.is_recoverable() => {
                    tracing::debug!(
                        session_id = %session_id.short(),
                        sequence,
                        error = %err,
                        "request not processed"
                    );
                    ServerEnvelope::error(Some(session_id), &err)
                }
                Err(err @ SessionError::SessionNotFound { .. }) => {
                    tracing::error!(
                        session_id = %session_id,
                        error = %err,
                        "session record vanished while its sandbox is live"
                    );
                    return SessionOutcome::StoreInvariant;
                }
                Err(err) => {
                    tracing::error!(session_id = %session_id.short(), error = %err, "request handler failed");
                    send_farewell(channel, ServerEnvelope::error(Some(session_id), &err).to_frame()).await;
                    return SessionOutcome::HandlerFailed;
                }
            };

            if let Err(err) = channel.send(reply.to_frame()).await {
                tracing::warn!(session_id = %session_id.short(), error = %err, "failed to send response");
                return SessionOutcome::ChannelError;
            }
            tracing::debug!(
                session_id = %session_id.short(),
                sequence,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "request processed"
            );
        }
    }

    async fn process(
        &self,
        session_id: &SandboxId,
        sequence: u64,
        frame: &Frame,
    ) -> Result<SessionRecord, SessionError> {
        let request = decode_request(frame)?;
        let ctx = SessionContext {
            session_id: session_id.clone(),
            sequence,
        };
        let entry = self.handler.handle(&ctx, request).await?;
        let record = self.store.append_result(session_id, entry).await?;
        Ok(record)
    }

    fn spawn_log_follower(&self, session_id: &SandboxId) -> Option<JoinHandle<()>> {
        if !self.config.follow_logs {
            return None;
        }
        let provider = self.provider.clone();
        let session_id = session_id.clone();

        Some(tokio::spawn(async move {
            let mut logs = match provider.fetch_logs(&session_id, LogOptions::follow()).await {
                Ok(logs) => logs,
                Err(err) => {
                    tracing::warn!(session_id = %session_id.short(), error = %err, "cannot follow sandbox logs");
                    return;
                }
            };

            let mut line_count: u64 = 0;
            while let Some(chunk) = logs.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        tracing::debug!(session_id = %session_id.short(), error = %err, "sandbox log stream failed");
                        break;
                    }
                };
                for line in String::from_utf8_lossy(&chunk).lines() {
                    let line = line.trim_end();
                    if line.is_empty() {
                        continue;
                    }
                    line_count += 1;
                    tracing::info!(
                        session_id = %session_id.short(),
                        line_number = line_count,
                        "sandbox: {}",
                        line
                    );
                }
            }

            tracing::debug!(
                session_id = %session_id.short(),
                total_lines = line_count,
                "sandbox log stream ended"
            );
        }))
    }
}

async fn next_inbound<C: DuplexChannel>(channel: &mut C, idle_timeout: Option<Duration>) -> Inbound {
    let received = match idle_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, channel.recv()).await {
            Ok(received) => received,
            Err(_) => return Inbound::Idle,
        },
        None => channel.recv().await,
    };
    match received {
        Some(Ok(frame)) => Inbound::Frame(frame),
        Some(Err(err)) => Inbound::Failed(err),
        None => Inbound::Closed,
    }
}

/// Best-effort last frame before the session closes.
async fn send_farewell<C: DuplexChannel>(channel: &mut C, text: String) {
    match tokio::time::timeout(CHANNEL_FAREWELL_TIMEOUT, channel.send(text)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::debug!(error = %err, "failed to send final frame"),
        Err(_) => tracing::debug!("peer not reading; final frame dropped"),
    }
}

async fn close_channel<C: DuplexChannel>(channel: &mut C) {
    if tokio::time::timeout(CHANNEL_FAREWELL_TIMEOUT, channel.close())
        .await
        .is_err()
    {
        tracing::debug!("channel close timed out");
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        // Sender gone without ever signalling: nothing will.
        std::future::pending::<()>().await;
    }
}

/// Owns a provisioned sandbox until cleanup has been started for it.
struct CleanupGuard {
    provider: Arc<dyn SandboxProvider>,
    store: Arc<SessionStore>,
    handle: Option<SandboxHandle>,
    registered: bool,
}

impl CleanupGuard {
    fn new(provider: Arc<dyn SandboxProvider>, store: Arc<SessionStore>, handle: SandboxHandle) -> Self {
        Self {
            provider,
            store,
            handle: Some(handle),
            registered: false,
        }
    }

    fn spawn_cleanup(&mut self) -> Option<JoinHandle<()>> {
        let handle = self.handle.take()?;
        Some(tokio::spawn(cleanup_session(
            self.provider.clone(),
            self.store.clone(),
            handle,
            self.registered,
        )))
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::warn!(
                    session_id = %handle.id().short(),
                    "session task ended before cleanup; cleaning up in background"
                );
                runtime.spawn(cleanup_session(
                    self.provider.clone(),
                    self.store.clone(),
                    handle,
                    self.registered,
                ));
            }
            Err(_) => {
                tracing::error!(
                    session_id = %handle.id(),
                    "no runtime left to clean up sandbox; it will leak"
                );
            }
        }
    }
}

/// Unregisters the session, then stops and removes its sandbox. Each step
/// runs whatever happened to the previous one.
async fn cleanup_session(
    provider: Arc<dyn SandboxProvider>,
    store: Arc<SessionStore>,
    handle: SandboxHandle,
    registered: bool,
) {
    let session_id = handle.id().clone();

    if registered && store.remove(&session_id).await.is_none() {
        tracing::error!(session_id = %session_id, "session record missing at cleanup");
    }

    let stopped = run_cleanup_step(provider.as_ref(), &handle, CleanupStep::Stop).await;
    let removed = run_cleanup_step(provider.as_ref(), &handle, CleanupStep::Remove).await;

    tracing::info!(
        session_id = %session_id.short(),
        stopped,
        removed,
        "sandbox cleaned up"
    );
}

#[derive(Debug, Clone, Copy)]
enum CleanupStep {
    Stop,
    Remove,
}

impl CleanupStep {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Remove => "remove",
        }
    }
}

/// Runs one cleanup call, retrying a hard failure once. Returns whether the
/// sandbox is known to be in the target state afterwards.
async fn run_cleanup_step(provider: &dyn SandboxProvider, handle: &SandboxHandle, step: CleanupStep) -> bool {
    let session_id = handle.id();
    let mut attempt = 1;
    loop {
        let result = match step {
            CleanupStep::Stop => provider.stop(handle).await,
            CleanupStep::Remove => provider.remove(handle).await,
        };
        match result {
            Ok(()) => return true,
            Err(err) if err.is_tolerable() => {
                tracing::debug!(
                    session_id = %session_id.short(),
                    operation = step.as_str(),
                    error = %err,
                    "sandbox already cleaned"
                );
                return true;
            }
            Err(err) => {
                let err = cleanup_error(step.as_str(), session_id, err);
                if attempt >= 2 {
                    tracing::warn!(session_id = %session_id, error = %err, "sandbox cleanup step failed");
                    return false;
                }
                tracing::debug!(session_id = %session_id.short(), error = %err, "sandbox cleanup step failed; retrying");
                attempt += 1;
                tokio::time::sleep(CLEANUP_RETRY_DELAY).await;
            }
        }
    }
}

fn cleanup_error(operation: &'static str, session_id: &SandboxId, err: ProviderError) -> SessionError {
    SessionError::Cleanup {
        session_id: session_id.to_string(),
        operation: operation.to_string(),
        message: err.to_string(),
    }
}
