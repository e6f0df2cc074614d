use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{NewPreview, Preview, PreviewId, PreviewPatch, PreviewStatus, Project};

/// Outcome of [`RecordStore::reserve_port`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Reserved,
    /// Another non-deleted preview already holds the port.
    Conflict,
    /// The preview is deleted (or gone) and may not hold a port.
    Inactive,
}

/// Narrow read/update interface over persisted projects and previews.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find_project(&self, id: Uuid) -> Result<Option<Project>>;

    async fn find_project_by_repo(&self, repo_owner: &str, repo_name: &str)
    -> Result<Option<Project>>;

    /// Latest preview for the pull request, preferring a non-deleted one.
    async fn find_preview(&self, project_id: Uuid, pr_number: u64) -> Result<Option<Preview>>;

    async fn get_preview(&self, id: PreviewId) -> Result<Option<Preview>>;

    async fn list_previews(&self, project_id: Uuid) -> Result<Vec<Preview>>;

    /// Returns the active preview for the pull request with its `head_ref`
    /// refreshed, or creates one in `building` with build number 0.
    async fn upsert_preview(&self, new: NewPreview) -> Result<Preview>;

    async fn update_preview(&self, id: PreviewId, patch: PreviewPatch) -> Result<Preview>;

    /// Atomically bumps the build counter and returns the new value.
    async fn increment_build_number(&self, id: PreviewId) -> Result<u32>;

    async fn find_preview_by_port(&self, port: u16, exclude_deleted: bool)
    -> Result<Option<Preview>>;

    /// Records `port` on the preview unless it is deleted or the port is held
    /// by another non-deleted preview.
    async fn reserve_port(&self, id: PreviewId, port: u16) -> Result<Reservation>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    #[serde(default)]
    projects: Vec<Project>,
    #[serde(default)]
    previews: Vec<Preview>,
    #[serde(default)]
    next_preview_id: PreviewId,
}

#[derive(Debug, Default)]
struct State {
    projects: HashMap<Uuid, Project>,
    previews: BTreeMap<PreviewId, Preview>,
    next_preview_id: PreviewId,
}

impl State {
    fn preview_mut(&mut self, id: PreviewId) -> Result<&mut Preview> {
        self.previews
            .get_mut(&id)
            .ok_or_else(|| anyhow!("preview {} not found", id))
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            projects: self.projects.values().cloned().collect(),
            previews: self.previews.values().cloned().collect(),
            next_preview_id: self.next_preview_id,
        }
    }
}

/// In-process record store, optionally mirrored to a JSON snapshot file.
pub struct MemoryStore {
    state: RwLock<State>,
    snapshot_path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State {
                next_preview_id: 1,
                ..Default::default()
            }),
            snapshot_path: None,
        }
    }

    /// Opens a store backed by `path`, loading it if the file exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Snapshot>(&bytes)
                .with_context(|| format!("failed to parse store snapshot {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read store snapshot {}", path.display()));
            }
        };

        let max_id = snapshot.previews.iter().map(|p| p.id).max().unwrap_or(0);
        let state = State {
            projects: snapshot
                .projects
                .into_iter()
                .map(|p| (p.id, p))
                .collect(),
            previews: snapshot
                .previews
                .into_iter()
                .map(|p| (p.id, p))
                .collect(),
            next_preview_id: snapshot.next_preview_id.max(max_id + 1),
        };

        tracing::info!(
            path = %path.display(),
            projects = state.projects.len(),
            previews = state.previews.len(),
            "Loaded record store"
        );

        Ok(Self {
            state: RwLock::new(state),
            snapshot_path: Some(path),
        })
    }

    pub async fn insert_project(&self, project: Project) -> Result<()> {
        let mut state = self.state.write().await;
        state.projects.insert(project.id, project);
        self.persist(&state).await
    }

    async fn persist(&self, state: &State) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(&state.snapshot())?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn holder_of(state: &State, port: u16, exclude_deleted: bool) -> Option<&Preview> {
    state
        .previews
        .values()
        .find(|p| p.port == Some(port) && !(exclude_deleted && p.is_deleted()))
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn find_project(&self, id: Uuid) -> Result<Option<Project>> {
        Ok(self.state.read().await.projects.get(&id).cloned())
    }

    async fn find_project_by_repo(
        &self,
        repo_owner: &str,
        repo_name: &str,
    ) -> Result<Option<Project>> {
        let state = self.state.read().await;
        Ok(state
            .projects
            .values()
            .find(|p| {
                p.repo_owner.eq_ignore_ascii_case(repo_owner)
                    && p.repo_name.eq_ignore_ascii_case(repo_name)
            })
            .cloned())
    }

    async fn find_preview(&self, project_id: Uuid, pr_number: u64) -> Result<Option<Preview>> {
        let state = self.state.read().await;
        let mut matching = state
            .previews
            .values()
            .rev()
            .filter(|p| p.project_id == project_id && p.pr_number == pr_number);
        let latest = matching.clone().next().cloned();
        Ok(matching.find(|p| !p.is_deleted()).cloned().or(latest))
    }

    async fn get_preview(&self, id: PreviewId) -> Result<Option<Preview>> {
        Ok(self.state.read().await.previews.get(&id).cloned())
    }

    async fn list_previews(&self, project_id: Uuid) -> Result<Vec<Preview>> {
        let state = self.state.read().await;
        Ok(state
            .previews
            .values()
            .filter(|p| p.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn upsert_preview(&self, new: NewPreview) -> Result<Preview> {
        let mut state = self.state.write().await;
        let existing = state
            .previews
            .values()
            .find(|p| p.project_id == new.project_id && p.pr_number == new.pr_number && !p.is_deleted())
            .map(|p| p.id);

        let preview = match existing {
            Some(id) => {
                let preview = state.preview_mut(id)?;
                preview.head_ref = new.head_ref;
                preview.clone()
            }
            None => {
                let id = state.next_preview_id;
                state.next_preview_id += 1;
                let preview = Preview {
                    id,
                    project_id: new.project_id,
                    pr_number: new.pr_number,
                    head_ref: new.head_ref,
                    status: PreviewStatus::Building,
                    url: None,
                    port: None,
                    container_name: None,
                    build_number: 0,
                    build_started_at: None,
                    build_completed_at: None,
                    build_logs: String::new(),
                };
                state.previews.insert(id, preview.clone());
                preview
            }
        };

        self.persist(&state).await?;
        Ok(preview)
    }

    async fn update_preview(&self, id: PreviewId, patch: PreviewPatch) -> Result<Preview> {
        let mut state = self.state.write().await;
        let preview = state.preview_mut(id)?;
        patch.apply(preview);
        let preview = preview.clone();
        self.persist(&state).await?;
        Ok(preview)
    }

    async fn increment_build_number(&self, id: PreviewId) -> Result<u32> {
        let mut state = self.state.write().await;
        let preview = state.preview_mut(id)?;
        preview.build_number += 1;
        let build_number = preview.build_number;
        self.persist(&state).await?;
        Ok(build_number)
    }

    async fn find_preview_by_port(
        &self,
        port: u16,
        exclude_deleted: bool,
    ) -> Result<Option<Preview>> {
        let state = self.state.read().await;
        Ok(holder_of(&state, port, exclude_deleted).cloned())
    }

    async fn reserve_port(&self, id: PreviewId, port: u16) -> Result<Reservation> {
        let mut state = self.state.write().await;
        match state.previews.get(&id) {
            Some(p) if !p.is_deleted() => {}
            _ => return Ok(Reservation::Inactive),
        }
        if holder_of(&state, port, true).is_some_and(|holder| holder.id != id) {
            return Ok(Reservation::Conflict);
        }
        state.preview_mut(id)?.port = Some(port);
        self.persist(&state).await?;
        Ok(Reservation::Reserved)
    }
}
