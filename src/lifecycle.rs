use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::docker_client::ContainerRuntime;
use crate::error::PreviewError;
use crate::events::Events;
use crate::executor::{BuildExecutor, BuildLog, BuildRequest, Deployment};
use crate::models::{NewPreview, Preview, PreviewId, PreviewPatch, PreviewStatus, Project};
use crate::source::SourceProvider;
use crate::store::RecordStore;

/// Who is asking for a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// The repository host (webhooks); may act on any project.
    System,
    User(String),
}

impl Actor {
    fn authorize(&self, project: &Project) -> Result<(), PreviewError> {
        match self {
            Actor::System => Ok(()),
            Actor::User(user) if *user == project.owner_id => Ok(()),
            Actor::User(user) => {
                tracing::warn!(user = %user, project_id = %project.id, "Rejected action on foreign project");
                Err(PreviewError::Forbidden)
            }
        }
    }
}

/// Handle to a build attempt that was accepted and recorded as `building`.
///
/// Dropping the ticket detaches from the attempt; it keeps running.
#[derive(Debug)]
pub struct BuildTicket {
    preview: Preview,
    handle: JoinHandle<Result<String, PreviewError>>,
}

impl BuildTicket {
    /// The preview as recorded by the `building` transition.
    pub fn preview(&self) -> &Preview {
        &self.preview
    }

    /// Waits for the attempt to finish; resolves to the preview URL.
    pub async fn wait(self) -> Result<String, PreviewError> {
        self.handle
            .await
            .map_err(|e| PreviewError::Unexpected(anyhow::anyhow!("build task failed: {}", e)))?
    }
}

struct Inner {
    store: Arc<dyn RecordStore>,
    source: Arc<dyn SourceProvider>,
    executor: BuildExecutor,
    runtime: Arc<dyn ContainerRuntime>,
    events: Events,
    /// Serializes transitions of a single preview.
    locks: Mutex<HashMap<PreviewId, Arc<AsyncMutex<()>>>>,
    /// Previews with a build attempt in flight.
    in_flight: Mutex<HashSet<PreviewId>>,
}

/// Marks a preview as building until dropped.
struct InFlight {
    inner: Arc<Inner>,
    preview_id: PreviewId,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.preview_id);
    }
}

/// Owns preview status and drives build, rebuild and delete sequences.
#[derive(Clone)]
pub struct PreviewService {
    inner: Arc<Inner>,
}

impl PreviewService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        source: Arc<dyn SourceProvider>,
        executor: BuildExecutor,
        runtime: Arc<dyn ContainerRuntime>,
        events: Events,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                source,
                executor,
                runtime,
                events,
                locks: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.inner.store
    }

    /// Handles a pull request being opened or updated: creates the preview
    /// on first sight, then starts a build attempt of `git_ref`.
    pub async fn start_build(
        &self,
        project_id: Uuid,
        pr_number: u64,
        git_ref: &str,
    ) -> Result<BuildTicket, PreviewError> {
        let project = self.project(project_id).await?;

        if let Some(existing) = self.inner.store.find_preview(project_id, pr_number).await?
            && existing.is_deleted()
        {
            return Err(PreviewError::PreviewDeleted(existing.id));
        }

        let preview = self
            .inner
            .store
            .upsert_preview(NewPreview {
                project_id,
                pr_number,
                head_ref: git_ref.to_string(),
            })
            .await?;

        tracing::info!(
            preview_id = preview.id,
            project = %project.full_name(),
            pr_number,
            git_ref,
            "Starting preview build"
        );
        self.begin_attempt(project, preview.id).await
    }

    /// Starts a new build attempt of the preview's current ref.
    pub async fn rebuild(
        &self,
        preview_id: PreviewId,
        actor: &Actor,
    ) -> Result<BuildTicket, PreviewError> {
        let (project, _) = self.authorized(preview_id, actor).await?;
        tracing::info!(preview_id, ?actor, "Rebuilding preview");
        self.begin_attempt(project, preview_id).await
    }

    /// Tears the preview down. Deleting an already deleted preview succeeds.
    pub async fn delete_preview(
        &self,
        preview_id: PreviewId,
        actor: &Actor,
    ) -> Result<Preview, PreviewError> {
        self.authorized(preview_id, actor).await?;
        tracing::info!(preview_id, ?actor, "Deleting preview");
        self.apply_delete(preview_id).await
    }

    /// Handles a pull request being closed. `None` when it never had a preview.
    pub async fn close_pull_request(
        &self,
        project_id: Uuid,
        pr_number: u64,
    ) -> Result<Option<Preview>, PreviewError> {
        match self.inner.store.find_preview(project_id, pr_number).await? {
            Some(preview) => Ok(Some(self.apply_delete(preview.id).await?)),
            None => Ok(None),
        }
    }

    /// Looks up the current preview of a pull request.
    pub async fn preview_for_pull_request(
        &self,
        project_id: Uuid,
        pr_number: u64,
    ) -> Result<Preview, PreviewError> {
        self.inner
            .store
            .find_preview(project_id, pr_number)
            .await?
            .ok_or_else(|| {
                PreviewError::not_found(format!("preview for PR #{}", pr_number))
            })
    }

    pub async fn get_preview(
        &self,
        preview_id: PreviewId,
        actor: &Actor,
    ) -> Result<Preview, PreviewError> {
        let (_, preview) = self.authorized(preview_id, actor).await?;
        Ok(preview)
    }

    pub async fn list_previews(
        &self,
        project_id: Uuid,
        actor: &Actor,
    ) -> Result<Vec<Preview>, PreviewError> {
        let project = self.project(project_id).await?;
        actor.authorize(&project)?;
        Ok(self.inner.store.list_previews(project_id).await?)
    }

    pub fn is_building(&self, preview_id: PreviewId) -> bool {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&preview_id)
    }

    async fn project(&self, project_id: Uuid) -> Result<Project, PreviewError> {
        self.inner
            .store
            .find_project(project_id)
            .await?
            .ok_or_else(|| PreviewError::not_found(format!("project {}", project_id)))
    }

    async fn authorized(
        &self,
        preview_id: PreviewId,
        actor: &Actor,
    ) -> Result<(Project, Preview), PreviewError> {
        let preview = self.load(preview_id).await?;
        let project = self.project(preview.project_id).await?;
        actor.authorize(&project)?;
        Ok((project, preview))
    }

    async fn load(&self, preview_id: PreviewId) -> Result<Preview, PreviewError> {
        self.inner
            .store
            .get_preview(preview_id)
            .await?
            .ok_or_else(|| PreviewError::not_found(format!("preview {}", preview_id)))
    }

    async fn lock(&self, preview_id: PreviewId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .inner
                .locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            locks.entry(preview_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    fn mark_in_flight(&self, preview_id: PreviewId) -> Result<InFlight, PreviewError> {
        let mut in_flight = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(preview_id) {
            return Err(PreviewError::BuildInProgress(preview_id));
        }
        Ok(InFlight {
            inner: self.inner.clone(),
            preview_id,
        })
    }

    fn forget_lock(&self, preview_id: PreviewId) {
        self.inner
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&preview_id);
    }

    /// Removes an attempt's container and the image tagged for it.
    async fn remove_deployment_best_effort(&self, preview_id: PreviewId, name: &str) {
        match self.inner.runtime.remove_container(name).await {
            Ok(removed) => {
                tracing::debug!(preview_id, container = name, removed, "Container cleanup")
            }
            Err(e) => tracing::warn!(preview_id, error = %e, "Container cleanup failed"),
        }
        let image = BuildExecutor::image_tag(name);
        match self.inner.runtime.remove_image(&image).await {
            Ok(removed) => tracing::debug!(preview_id, image = %image, removed, "Image cleanup"),
            Err(e) => tracing::warn!(preview_id, image = %image, error = %e, "Image cleanup failed"),
        }
    }

    /// `(any) -> building`, then hands the attempt to a background task.
    async fn begin_attempt(
        &self,
        project: Project,
        preview_id: PreviewId,
    ) -> Result<BuildTicket, PreviewError> {
        let guard = self.lock(preview_id).await;
        let current = self.load(preview_id).await?;
        if current.is_deleted() {
            return Err(PreviewError::PreviewDeleted(preview_id));
        }
        let in_flight = self.mark_in_flight(preview_id)?;

        if let Some(name) = &current.container_name {
            self.remove_deployment_best_effort(preview_id, name).await;
        }

        let build_number = self.inner.store.increment_build_number(preview_id).await?;
        let container_name =
            crate::derive_container_name(&project, current.pr_number, build_number);
        let preview = self
            .inner
            .store
            .update_preview(
                preview_id,
                PreviewPatch {
                    status: Some(PreviewStatus::Building),
                    url: Some(None),
                    container_name: Some(Some(container_name)),
                    build_started_at: Some(Some(Utc::now())),
                    build_completed_at: Some(None),
                    build_logs: Some(String::new()),
                    ..Default::default()
                },
            )
            .await?;
        self.inner.events.state_changed(&preview);
        drop(guard);

        let service = self.clone();
        let attempt = preview.clone();
        let handle = tokio::spawn(async move {
            let result = service.run_attempt(project, attempt).await;
            drop(in_flight);
            result
        });

        Ok(BuildTicket { preview, handle })
    }

    async fn run_attempt(&self, project: Project, preview: Preview) -> Result<String, PreviewError> {
        let mut log = BuildLog::new(preview.id, self.inner.events.clone());
        log.note(format!(
            "Build #{} of {} PR #{} at {}",
            preview.build_number,
            project.full_name(),
            preview.pr_number,
            preview.head_ref
        ));

        let cloned = self
            .inner
            .source
            .clone_source(
                &project.repo_owner,
                &project.repo_name,
                Some(&preview.head_ref),
                &mut |chunk| log.push(chunk),
            )
            .await;

        let outcome = match cloned {
            Ok(path) => {
                let req = BuildRequest {
                    project: &project,
                    preview_id: preview.id,
                    pr_number: preview.pr_number,
                    build_number: preview.build_number,
                    held_port: preview.port,
                    source_path: &path,
                };
                let outcome = self.inner.executor.build(&req, &mut log).await;
                discard_source(&path).await;
                outcome
            }
            Err(e) => Err(e),
        };

        self.finish_attempt(&preview, outcome, log).await
    }

    /// `building -> live` or `building -> error`, unless the preview was
    /// deleted while the attempt ran.
    async fn finish_attempt(
        &self,
        attempt: &Preview,
        outcome: Result<Deployment, PreviewError>,
        mut log: BuildLog,
    ) -> Result<String, PreviewError> {
        let _guard = self.lock(attempt.id).await;
        let current = self.load(attempt.id).await?;

        if current.is_deleted() {
            tracing::info!(preview_id = attempt.id, "Preview deleted during build, discarding attempt");
            if let Some(name) = &attempt.container_name {
                self.remove_deployment_best_effort(attempt.id, name).await;
            }
            log.note("Preview was deleted while building");
            let preview = self
                .inner
                .store
                .update_preview(
                    attempt.id,
                    PreviewPatch {
                        url: Some(None),
                        port: Some(None),
                        container_name: Some(None),
                        build_logs: Some(log.into_text()),
                        ..Default::default()
                    },
                )
                .await?;
            self.inner.events.state_changed(&preview);
            self.forget_lock(attempt.id);
            return Err(PreviewError::PreviewDeleted(attempt.id));
        }

        match outcome {
            Ok(deployment) => {
                let preview = self
                    .inner
                    .store
                    .update_preview(
                        attempt.id,
                        PreviewPatch {
                            status: Some(PreviewStatus::Live),
                            url: Some(Some(deployment.url.clone())),
                            port: Some(Some(deployment.port)),
                            container_name: Some(Some(deployment.container_name)),
                            build_completed_at: Some(Some(Utc::now())),
                            build_logs: Some(log.into_text()),
                            ..Default::default()
                        },
                    )
                    .await?;
                tracing::info!(
                    preview_id = preview.id,
                    build_number = preview.build_number,
                    url = %deployment.url,
                    "Preview is live"
                );
                self.inner.events.state_changed(&preview);
                Ok(deployment.url)
            }
            Err(e) => {
                tracing::warn!(
                    preview_id = attempt.id,
                    build_number = attempt.build_number,
                    error = %e,
                    "Preview build failed"
                );
                log.push(&format!("\nBuild failed: {}\n", e));
                if let Some(name) = &attempt.container_name {
                    self.remove_deployment_best_effort(attempt.id, name).await;
                }
                let preview = self
                    .inner
                    .store
                    .update_preview(
                        attempt.id,
                        PreviewPatch {
                            status: Some(PreviewStatus::Error),
                            url: Some(None),
                            port: Some(None),
                            container_name: Some(None),
                            build_completed_at: Some(Some(Utc::now())),
                            build_logs: Some(log.into_text()),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.inner.events.state_changed(&preview);
                Err(e)
            }
        }
    }

    /// `(any) -> deleted`.
    async fn apply_delete(&self, preview_id: PreviewId) -> Result<Preview, PreviewError> {
        let _guard = self.lock(preview_id).await;
        let current = self.load(preview_id).await?;
        if current.is_deleted() {
            self.forget_lock(preview_id);
            return Ok(current);
        }

        if let Some(name) = &current.container_name {
            self.remove_deployment_best_effort(preview_id, name).await;
        }

        let preview = self
            .inner
            .store
            .update_preview(
                preview_id,
                PreviewPatch {
                    status: Some(PreviewStatus::Deleted),
                    url: Some(None),
                    port: Some(None),
                    container_name: Some(None),
                    build_completed_at: Some(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await?;
        tracing::info!(preview_id, pr_number = preview.pr_number, "Preview deleted");
        self.inner.events.state_changed(&preview);
        // Later transitions only find `deleted`; none need the old lock.
        self.forget_lock(preview_id);
        Ok(preview)
    }
}

async fn discard_source(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        tracing::warn!(error = %e, path = %path.display(), "Failed to remove source tree");
    }
}
