use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{InspectContainerOptions, LogsOptions, RemoveContainerOptions};
use bollard::errors::Error as BollardError;
use bollard::image::RemoveImageOptions;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::error::PreviewError;

/// Container operations the orchestrator performs outside of build steps.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Force-removes the named container. `Ok(false)` when there was none.
    async fn remove_container(&self, name: &str) -> Result<bool, PreviewError>;

    /// Force-removes an image tag. `Ok(false)` when it did not exist.
    async fn remove_image(&self, image: &str) -> anyhow::Result<bool>;

    async fn is_running(&self, name: &str) -> anyhow::Result<bool>;
}

/// A wrapper around the Docker client for container cleanup and log streaming.
#[derive(Clone)]
pub struct DockerClient {
    docker: Docker,
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

impl DockerClient {
    /// Creates a new DockerClient connecting to the local Docker socket.
    pub fn new() -> Result<Self, BollardError> {
        let docker = Docker::connect_with_socket_defaults()?;
        Ok(Self { docker })
    }

    /// Streams logs from a running preview container.
    /// Returns a receiver that yields log lines as they arrive.
    ///
    /// # Arguments
    /// * `container_name` - The container name (not ID)
    /// * `tail` - Number of lines to return from the end of the logs (0 = all)
    /// * `follow` - Whether to follow the log stream (like `tail -f`)
    pub async fn stream_logs(
        &self,
        container_name: &str,
        tail: u64,
        follow: bool,
    ) -> Result<mpsc::Receiver<Result<String, String>>, String> {
        self.docker
            .inspect_container(container_name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| format!("Container '{}' not found: {}", container_name, e))?;

        let (tx, rx) = mpsc::channel(100);

        let options = LogsOptions::<String> {
            follow,
            stdout: true,
            stderr: true,
            tail: if tail > 0 {
                tail.to_string()
            } else {
                "all".to_string()
            },
            timestamps: true,
            ..Default::default()
        };

        let docker = self.docker.clone();
        let container = container_name.to_string();

        tokio::spawn(async move {
            let mut stream = docker.logs(&container, Some(options));

            while let Some(result) = stream.next().await {
                let msg = match result {
                    Ok(output) => Ok(output.to_string()),
                    Err(e) => Err(format!("Log stream error: {}", e)),
                };

                if tx.send(msg).await.is_err() {
                    // Receiver dropped, stop streaming
                    break;
                }
            }
        });

        Ok(rx)
    }
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn remove_container(&self, name: &str) -> Result<bool, PreviewError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(PreviewError::ContainerRemoveFailed {
                name: name.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn remove_image(&self, image: &str) -> anyhow::Result<bool> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_image(image, Some(options), None).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn is_running(&self, name: &str) -> anyhow::Result<bool> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(info.state.and_then(|s| s.running).unwrap_or(false)),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
