use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderName, HeaderValue, Method};
use clap::{Args, Parser, Subcommand, ValueEnum};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use utoipa::OpenApi;

mod build_version {
    include!(concat!(env!("OUT_DIR"), "/version.rs"));
}

use crate::handler::{OpHandler, RequestHandler};
use crate::lifecycle::SessionConfig;
use crate::provider::{
    DockerProvider, DockerProviderConfig, ImageRef, MockProvider, ProviderError, SandboxProvider,
};
use crate::router::ApiDoc;
use crate::server::{run_server, ServeError, ServerConfig};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8765;

#[derive(Parser, Debug)]
#[command(name = "sandbox-session", bin_name = "sandbox-session")]
#[command(about = "One disposable sandbox per WebSocket connection", version = build_version::VERSION)]
#[command(arg_required_else_help = true)]
pub struct SandboxSessionCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the WebSocket session server.
    Server(ServerArgs),
    /// Print the OpenAPI document for the HTTP routes.
    Openapi(OpenapiArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProviderKind {
    /// Containers on the local Docker daemon.
    Docker,
    /// In-memory sandboxes; nothing is started.
    Mock,
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST, env = "SANDBOX_SESSION_HOST")]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT, env = "SANDBOX_SESSION_PORT")]
    port: u16,

    /// Image every session sandbox is created from.
    #[arg(long, short = 'i', env = "SANDBOX_SESSION_IMAGE")]
    image: String,

    #[arg(long, value_enum, default_value_t = ProviderKind::Docker, env = "SANDBOX_SESSION_PROVIDER")]
    provider: ProviderKind,

    /// Pull the image when it is not present locally.
    #[arg(long, env = "SANDBOX_SESSION_PULL")]
    pull: bool,

    #[arg(long = "stop-timeout-secs", default_value_t = 10, env = "SANDBOX_SESSION_STOP_TIMEOUT_SECS")]
    stop_timeout_secs: u64,

    /// Close sessions that stay silent this long.
    #[arg(long = "idle-timeout-secs", env = "SANDBOX_SESSION_IDLE_TIMEOUT_SECS")]
    idle_timeout_secs: Option<u64>,

    /// Forward sandbox output to the server log.
    #[arg(long = "follow-logs", env = "SANDBOX_SESSION_FOLLOW_LOGS")]
    follow_logs: bool,

    #[arg(long = "shutdown-grace-secs", default_value_t = 15, env = "SANDBOX_SESSION_SHUTDOWN_GRACE_SECS")]
    shutdown_grace_secs: u64,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    cors_allow_credentials: bool,
}

#[derive(Args, Debug)]
pub struct OpenapiArgs {
    /// Write to this file instead of stdout.
    #[arg(long, short = 'o')]
    out: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("invalid image reference: {0:?}")]
    InvalidImage(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("sandbox provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Serve(#[from] ServeError),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_sandbox_session() -> Result<(), CliError> {
    let cli = SandboxSessionCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(&cli.command)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| CliError::Server(err.to_string()))
}

pub fn run_command(command: &Command) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server_command(args),
        Command::Openapi(args) => write_openapi(args),
    }
}

fn run_server_command(args: &ServerArgs) -> Result<(), CliError> {
    let config = server_config(args)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        // bollard needs a runtime to connect, so the provider is built inside it.
        let provider = build_provider(args)?;
        let handler: Arc<dyn RequestHandler> = Arc::new(OpHandler);
        run_server(config, provider, handler).await?;
        Ok::<(), CliError>(())
    })
}

fn server_config(args: &ServerArgs) -> Result<ServerConfig, CliError> {
    let image = args.image.trim();
    if image.is_empty() {
        return Err(CliError::InvalidImage(args.image.clone()));
    }

    let session = SessionConfig {
        image: ImageRef::new(image),
        idle_timeout: args
            .idle_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs),
        follow_logs: args.follow_logs,
    };

    let cors = if args.cors_allow_origin.is_empty() {
        None
    } else {
        Some(build_cors_layer(args)?)
    };

    Ok(ServerConfig {
        host: args.host.clone(),
        port: args.port,
        session,
        shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        cors,
    })
}

fn build_provider(args: &ServerArgs) -> Result<Arc<dyn SandboxProvider>, CliError> {
    match args.provider {
        ProviderKind::Docker => {
            let config = DockerProviderConfig {
                pull_missing: args.pull,
                stop_timeout: Duration::from_secs(args.stop_timeout_secs),
                ..DockerProviderConfig::default()
            };
            Ok(Arc::new(DockerProvider::connect(config)?))
        }
        ProviderKind::Mock => {
            tracing::warn!("using mock sandbox provider; no containers will be started");
            Ok(Arc::new(MockProvider::new()))
        }
    }
}

fn build_cors_layer(args: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut origins: Vec<HeaderValue> = Vec::new();
    for origin in &args.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    let mut cors = CorsLayer::new().allow_origin(origins);

    if args.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods: Vec<Method> = Vec::new();
        for method in &args.cors_allow_method {
            let parsed = method
                .parse()
                .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?;
            methods.push(parsed);
        }
        cors = cors.allow_methods(methods);
    }

    if args.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers: Vec<HeaderName> = Vec::new();
        for header in &args.cors_allow_header {
            let parsed = header
                .parse()
                .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?;
            headers.push(parsed);
        }
        cors = cors.allow_headers(headers);
    }

    if args.cors_allow_credentials {
        cors = cors.allow_credentials(true);
    }

    Ok(cors)
}

fn write_openapi(args: &OpenapiArgs) -> Result<(), CliError> {
    let json = serde_json::to_string_pretty(&ApiDoc::openapi())?;
    match &args.out {
        Some(path) => {
            std::fs::write(path, json)?;
            tracing::info!(path = %path.display(), "wrote openapi document");
        }
        None => {
            let mut stdout = std::io::stdout();
            stdout.write_all(json.as_bytes())?;
            stdout.write_all(b"\n")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ServerArgs {
        let mut argv = vec!["sandbox-session", "server"];
        argv.extend_from_slice(args);
        match SandboxSessionCli::try_parse_from(argv).expect("parse").command {
            Command::Server(args) => args,
            other => panic!("expected server command, got {other:?}"),
        }
    }

    #[test]
    fn server_defaults() {
        let args = parse(&["--image", "alpine:3"]);
        let config = server_config(&args).expect("config");
        assert_eq!(config.addr(), "127.0.0.1:8765");
        assert_eq!(config.session.image.as_str(), "alpine:3");
        assert_eq!(config.session.idle_timeout, None);
        assert!(!config.session.follow_logs);
        assert_eq!(config.shutdown_grace, Duration::from_secs(15));
        assert!(config.cors.is_none());
        assert_eq!(args.provider, ProviderKind::Docker);
        assert_eq!(args.stop_timeout_secs, 10);
    }

    #[test]
    fn server_flags() {
        let args = parse(&[
            "--image",
            "ghcr.io/acme/sandbox:1.2",
            "--provider",
            "mock",
            "--idle-timeout-secs",
            "30",
            "--follow-logs",
            "-p",
            "9000",
            "-O",
            "http://localhost:3000",
        ]);
        let config = server_config(&args).expect("config");
        assert_eq!(config.port, 9000);
        assert_eq!(config.session.idle_timeout, Some(Duration::from_secs(30)));
        assert!(config.session.follow_logs);
        assert!(config.cors.is_some());
        assert_eq!(args.provider, ProviderKind::Mock);
    }

    #[test]
    fn zero_idle_timeout_disables_it() {
        let args = parse(&["--image", "alpine:3", "--idle-timeout-secs", "0"]);
        let config = server_config(&args).expect("config");
        assert_eq!(config.session.idle_timeout, None);
    }

    #[test]
    fn blank_image_is_rejected() {
        let args = parse(&["--image", "  "]);
        assert!(matches!(server_config(&args), Err(CliError::InvalidImage(_))));
    }

    #[test]
    fn invalid_cors_origin_is_reported() {
        let args = parse(&["--image", "alpine:3", "-O", "not a\nheader"]);
        assert!(matches!(
            server_config(&args),
            Err(CliError::InvalidCorsOrigin(_))
        ));
    }
}
