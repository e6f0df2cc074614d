use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::Arc;

use crate::docker_client::ContainerRuntime;
use crate::error::PreviewError;
use crate::events::Events;
use crate::models::{PreviewId, Project};
use crate::ports::PortAllocator;
use crate::process::{CommandSpec, ProcessRunner};
use crate::store::{RecordStore, Reservation};

/// How many times a freshly allocated port may lose the reservation race
/// before the attempt gives up.
const RESERVE_ATTEMPTS: usize = 3;

/// Settings shared by every build attempt.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub port_range: RangeInclusive<u16>,
    pub container_port: u16,
    pub public_host: String,
    pub docker_bin: String,
    /// Build template, relative to the source tree.
    pub dockerfile: String,
}

/// Accumulated output of one build attempt. Every chunk is also forwarded
/// to the preview's event stream.
pub struct BuildLog {
    preview_id: PreviewId,
    text: String,
    events: Events,
}

impl BuildLog {
    pub fn new(preview_id: PreviewId, events: Events) -> Self {
        Self {
            preview_id,
            text: String::new(),
            events,
        }
    }

    pub fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        self.events.log_chunk(self.preview_id, chunk);
    }

    /// Appends an orchestrator status line.
    pub fn note(&mut self, message: impl AsRef<str>) {
        self.push(&format!("==> {}\n", message.as_ref()));
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

/// One build attempt, as handed over by the lifecycle.
#[derive(Debug, Clone)]
pub struct BuildRequest<'a> {
    pub project: &'a Project,
    pub preview_id: PreviewId,
    pub pr_number: u64,
    pub build_number: u32,
    /// Port recorded on the preview before this attempt, if any.
    pub held_port: Option<u16>,
    pub source_path: &'a Path,
}

/// A container started by a successful attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub url: String,
    pub port: u16,
    pub container_name: String,
}

/// Turns a source tree into a running container on a host port.
pub struct BuildExecutor {
    store: Arc<dyn RecordStore>,
    allocator: Arc<dyn PortAllocator>,
    runner: Arc<dyn ProcessRunner>,
    runtime: Arc<dyn ContainerRuntime>,
    settings: ExecutorSettings,
}

fn is_port_conflict(output: &str) -> bool {
    let output = output.to_ascii_lowercase();
    output.contains("port is already allocated") || output.contains("address already in use")
}

impl BuildExecutor {
    pub fn new(
        store: Arc<dyn RecordStore>,
        allocator: Arc<dyn PortAllocator>,
        runner: Arc<dyn ProcessRunner>,
        runtime: Arc<dyn ContainerRuntime>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            store,
            allocator,
            runner,
            runtime,
            settings,
        }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub fn image_tag(container_name: &str) -> String {
        format!("previewd/{}:latest", container_name)
    }

    pub fn preview_url(&self, port: u16) -> String {
        format!("http://{}:{}", self.settings.public_host, port)
    }

    /// Runs port selection, stale cleanup, image build and container run.
    /// On failure the log keeps everything captured so far.
    pub async fn build(
        &self,
        req: &BuildRequest<'_>,
        log: &mut BuildLog,
    ) -> Result<Deployment, PreviewError> {
        let mut port = self.resolve_port(req, log).await?;

        let container_name =
            crate::derive_container_name(req.project, req.pr_number, req.build_number);
        self.remove_stale(&container_name, log).await;

        let image = Self::image_tag(&container_name);
        self.build_image(&image, req.source_path, log).await?;

        let mut retried = false;
        loop {
            match self.run_container(&container_name, &image, port, log).await {
                Ok(()) => break,
                Err(PreviewError::RunFailed {
                    port_in_use: true, ..
                }) if !retried => {
                    retried = true;
                    log.note(format!("Host port {} is already in use, allocating another", port));
                    // `docker run` leaves the created container behind.
                    self.remove_stale(&container_name, log).await;
                    port = self.allocate_and_reserve(req.preview_id, log).await?;
                }
                Err(e) => return Err(e),
            }
        }

        let url = self.preview_url(port);
        log.note(format!("Preview is live at {}", url));
        Ok(Deployment {
            url,
            port,
            container_name,
        })
    }

    async fn resolve_port(
        &self,
        req: &BuildRequest<'_>,
        log: &mut BuildLog,
    ) -> Result<u16, PreviewError> {
        if let Some(port) = req.held_port {
            if !self.allocator.is_held(port) {
                match self.store.reserve_port(req.preview_id, port).await? {
                    Reservation::Reserved => {
                        log.note(format!("Reusing host port {}", port));
                        return Ok(port);
                    }
                    Reservation::Inactive => {
                        return Err(PreviewError::PreviewDeleted(req.preview_id));
                    }
                    Reservation::Conflict => {}
                }
            }
            tracing::info!(
                preview_id = req.preview_id,
                port,
                "Held port is no longer free, allocating a new one"
            );
        }
        self.allocate_and_reserve(req.preview_id, log).await
    }

    async fn allocate_and_reserve(
        &self,
        preview_id: PreviewId,
        log: &mut BuildLog,
    ) -> Result<u16, PreviewError> {
        let (min, max) = (
            *self.settings.port_range.start(),
            *self.settings.port_range.end(),
        );
        for _ in 0..RESERVE_ATTEMPTS {
            let port = self.allocator.allocate(min, max).await?;
            match self.store.reserve_port(preview_id, port).await? {
                Reservation::Reserved => {
                    log.note(format!("Allocated host port {}", port));
                    return Ok(port);
                }
                Reservation::Inactive => return Err(PreviewError::PreviewDeleted(preview_id)),
                Reservation::Conflict => {
                    tracing::debug!(preview_id, port, "Lost port reservation race, retrying");
                }
            }
        }
        Err(PreviewError::PortExhausted { min, max })
    }

    async fn remove_stale(&self, container_name: &str, log: &mut BuildLog) {
        match self.runtime.remove_container(container_name).await {
            Ok(true) => log.note(format!("Removed stale container {}", container_name)),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(error = %e, container = container_name, "Stale container cleanup failed");
                log.note(format!("Warning: {}", e));
            }
        }
    }

    async fn build_image(
        &self,
        image: &str,
        source_path: &Path,
        log: &mut BuildLog,
    ) -> Result<(), PreviewError> {
        let dockerfile = source_path.join(&self.settings.dockerfile);
        let cmd = CommandSpec::new(&self.settings.docker_bin)
            .args(["build", "-t", image, "-f"])
            .arg(dockerfile.to_string_lossy())
            .arg(source_path.to_string_lossy())
            .current_dir(source_path);

        log.note(format!("Building image {}", image));
        let exit_code = self.runner.execute(&cmd, &mut |chunk| log.push(chunk)).await?;
        if exit_code != 0 {
            return Err(PreviewError::BuildFailed { exit_code });
        }
        Ok(())
    }

    async fn run_container(
        &self,
        container_name: &str,
        image: &str,
        port: u16,
        log: &mut BuildLog,
    ) -> Result<(), PreviewError> {
        let cmd = CommandSpec::new(&self.settings.docker_bin)
            .args(["run", "-d", "--name", container_name, "-p"])
            .arg(format!("{}:{}", port, self.settings.container_port))
            .arg(image);

        log.note(format!("Starting container {} on host port {}", container_name, port));
        let mut output = String::new();
        let exit_code = self
            .runner
            .execute(&cmd, &mut |chunk| {
                output.push_str(chunk);
                log.push(chunk);
            })
            .await?;
        if exit_code != 0 {
            return Err(PreviewError::RunFailed {
                exit_code,
                port_in_use: is_port_conflict(&output),
            });
        }

        match self.runtime.is_running(container_name).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                log.note(format!("Container {} exited right after start", container_name));
                Err(PreviewError::ContainerExited(container_name.to_string()))
            }
            Err(e) => {
                // Daemon unreachable; trust the run exit code.
                tracing::warn!(error = %e, container = container_name, "Could not inspect started container");
                Ok(())
            }
        }
    }
}
