use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use crate::handler::RequestHandler;
use crate::lifecycle::SessionConfig;
use crate::provider::SandboxProvider;
use crate::router::{begin_shutdown, build_router_with_state, drain_sessions, AppState};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub session: SessionConfig,
    /// How long shutdown waits for sessions to clean up their sandboxes.
    pub shutdown_grace: Duration,
    pub cors: Option<CorsLayer>,
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Binds the configured address and serves until ctrl-c.
pub async fn run_server(
    config: ServerConfig,
    provider: Arc<dyn SandboxProvider>,
    handler: Arc<dyn RequestHandler>,
) -> Result<(), ServeError> {
    let addr = config.addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| ServeError::Bind {
            addr: addr.clone(),
            source,
        })?;
    tracing::info!(
        addr = %addr,
        image = %config.session.image,
        provider = provider.name(),
        "server listening"
    );

    let state = Arc::new(AppState::new(provider, handler, config.session.clone()));
    let (mut router, state) = build_router_with_state(state);
    if let Some(cors) = config.cors {
        router = router.layer(cors);
    }

    serve(listener, router, state, config.shutdown_grace, shutdown_signal()).await
}

/// Serves `router` on `listener` until `signal` resolves, then closes every
/// session and waits up to `grace` for their cleanup.
pub async fn serve<F>(
    listener: TcpListener,
    router: Router,
    state: Arc<AppState>,
    grace: Duration,
    signal: F,
) -> Result<(), ServeError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let shutdown_state = state.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            signal.await;
            begin_shutdown(&shutdown_state);
        })
        .await?;

    drain_sessions(&state, grace).await;
    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c; shutting down");
    }
}
