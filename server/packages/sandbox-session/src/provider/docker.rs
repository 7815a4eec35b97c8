use std::collections::HashMap;
use std::time::{Duration, Instant};

use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptionsBuilder, InspectContainerOptions,
    LogsOptionsBuilder, RemoveContainerOptionsBuilder, StartContainerOptions,
    StopContainerOptionsBuilder,
};
use bollard::Docker;
use futures::{StreamExt, TryStreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{
    ImageRef, LogOptions, LogStream, ProviderError, ProviderFuture, SandboxHandle, SandboxId,
    SandboxProvider, MANAGED_LABEL,
};

const LOG_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct DockerProviderConfig {
    /// Pull the image when it is not present locally.
    pub pull_missing: bool,
    /// Grace period given to the container before it is killed on stop.
    pub stop_timeout: Duration,
    pub labels: HashMap<String, String>,
}

impl Default for DockerProviderConfig {
    fn default() -> Self {
        Self {
            pull_missing: false,
            stop_timeout: Duration::from_secs(10),
            labels: HashMap::new(),
        }
    }
}

/// Sandbox provider backed by the local Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerProvider {
    docker: Docker,
    config: DockerProviderConfig,
}

impl DockerProvider {
    pub fn connect(config: DockerProviderConfig) -> Result<Self, ProviderError> {
        let docker = Docker::connect_with_local_defaults().map_err(|err| ProviderError::Runtime {
            operation: "connect",
            id: "-".to_string(),
            message: err.to_string(),
        })?;
        Ok(Self::with_client(docker, config))
    }

    pub fn with_client(docker: Docker, config: DockerProviderConfig) -> Self {
        Self { docker, config }
    }

    async fn ensure_image(&self, image: &ImageRef) -> Result<(), ProviderError> {
        match self.docker.inspect_image(image.as_str()).await {
            Ok(_) => return Ok(()),
            Err(err) if is_status(&err, 404) && self.config.pull_missing => {}
            Err(err) => return Err(provision_error(image, err)),
        }

        let (repository, tag) = image.repository_and_tag();
        tracing::info!(image = %image, "pulling sandbox image");
        let pull_start = Instant::now();
        self.docker
            .create_image(
                Some(
                    CreateImageOptionsBuilder::new()
                        .from_image(repository)
                        .tag(tag)
                        .build(),
                ),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|err| provision_error(image, err))?;
        tracing::info!(
            image = %image,
            elapsed_ms = pull_start.elapsed().as_millis() as u64,
            "sandbox image pulled"
        );
        Ok(())
    }

    fn labels(&self) -> HashMap<String, String> {
        let mut labels = self.config.labels.clone();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels
    }

    async fn create_container(&self, image: &ImageRef) -> Result<SandboxHandle, ProviderError> {
        let create_start = Instant::now();
        self.ensure_image(image).await?;

        let body = ContainerCreateBody {
            image: Some(image.as_str().to_string()),
            labels: Some(self.labels()),
            tty: Some(true),
            open_stdin: Some(true),
            host_config: Some(HostConfig {
                auto_remove: Some(false),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        let created = self
            .docker
            .create_container(None::<CreateContainerOptions>, body)
            .await
            .map_err(|err| provision_error(image, err))?;
        let id = SandboxId::new(created.id);
        for warning in &created.warnings {
            tracing::warn!(sandbox_id = %id.short(), warning = %warning, "docker create warning");
        }

        if let Err(err) = self
            .docker
            .start_container(id.as_str(), None::<StartContainerOptions>)
            .await
        {
            // Never leave a created-but-unstarted container behind.
            if let Err(remove_err) = self
                .docker
                .remove_container(
                    id.as_str(),
                    Some(RemoveContainerOptionsBuilder::new().force(true).v(true).build()),
                )
                .await
            {
                tracing::warn!(
                    sandbox_id = %id,
                    error = %remove_err,
                    "failed to remove container after start failure; it may leak"
                );
            }
            return Err(provision_error(image, err));
        }

        tracing::info!(
            sandbox_id = %id.short(),
            image = %image,
            elapsed_ms = create_start.elapsed().as_millis() as u64,
            "sandbox container started"
        );
        Ok(SandboxHandle::new(id, image.clone()))
    }

    async fn open_logs(&self, id: &SandboxId, options: LogOptions) -> Result<LogStream, ProviderError> {
        self.docker
            .inspect_container(id.as_str(), None::<InspectContainerOptions>)
            .await
            .map_err(|err| map_error("logs", id, err))?;

        let tail = options
            .tail
            .map(|lines| lines.to_string())
            .unwrap_or_else(|| "all".to_string());
        let logs_options = LogsOptionsBuilder::new()
            .follow(options.follow)
            .stdout(true)
            .stderr(true)
            .tail(&tail)
            .build();

        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let docker = self.docker.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let mut logs = docker.logs(id.as_str(), Some(logs_options));
            while let Some(item) = logs.next().await {
                let item = item
                    .map(|output| output.into_bytes())
                    .map_err(|err| map_error("logs", &id, err));
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

impl SandboxProvider for DockerProvider {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn create<'a>(&'a self, image: &'a ImageRef) -> ProviderFuture<'a, SandboxHandle> {
        Box::pin(self.create_container(image))
    }

    fn fetch_logs<'a>(&'a self, id: &'a SandboxId, options: LogOptions) -> ProviderFuture<'a, LogStream> {
        Box::pin(self.open_logs(id, options))
    }

    fn stop<'a>(&'a self, handle: &'a SandboxHandle) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let timeout = i32::try_from(self.config.stop_timeout.as_secs()).unwrap_or(i32::MAX);
            self.docker
                .stop_container(
                    handle.id().as_str(),
                    Some(StopContainerOptionsBuilder::new().t(timeout).build()),
                )
                .await
                .map_err(|err| map_error("stop", handle.id(), err))
        })
    }

    fn remove<'a>(&'a self, handle: &'a SandboxHandle) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.docker
                .remove_container(
                    handle.id().as_str(),
                    Some(RemoveContainerOptionsBuilder::new().force(true).v(true).build()),
                )
                .await
                .map_err(|err| map_error("remove", handle.id(), err))
        })
    }
}

fn is_status(error: &BollardError, status: u16) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError { status_code, .. } if *status_code == status
    )
}

fn provision_error(image: &ImageRef, error: BollardError) -> ProviderError {
    ProviderError::Provision {
        image: image.to_string(),
        message: error.to_string(),
    }
}

fn map_error(operation: &'static str, id: &SandboxId, error: BollardError) -> ProviderError {
    if is_status(&error, 404) {
        return ProviderError::NotFound { id: id.to_string() };
    }
    // Docker answers 304 Not Modified when stopping a container that is not running.
    if operation == "stop" && is_status(&error, 304) {
        return ProviderError::AlreadyStopped { id: id.to_string() };
    }
    ProviderError::Runtime {
        operation,
        id: id.to_string(),
        message: error.to_string(),
    }
}
