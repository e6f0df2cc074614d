use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type PreviewId = i64;

/// A source repository registered for previews, owned by a single user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: Uuid,
    pub repo_owner: String,
    pub repo_name: String,
    pub owner_id: String,
}

impl Project {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.repo_owner, self.repo_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewStatus {
    Building,
    Live,
    Error,
    Deleted,
}

impl PreviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PreviewStatus::Building => "building",
            PreviewStatus::Live => "live",
            PreviewStatus::Error => "error",
            PreviewStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for PreviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ephemeral deployment of one pull request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preview {
    pub id: PreviewId,
    pub project_id: Uuid,
    pub pr_number: u64,
    /// Git ref the next build attempt checks out.
    pub head_ref: String,
    pub status: PreviewStatus,
    pub url: Option<String>,
    pub port: Option<u16>,
    pub container_name: Option<String>,
    pub build_number: u32,
    pub build_started_at: Option<DateTime<Utc>>,
    pub build_completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub build_logs: String,
}

impl Preview {
    pub fn is_deleted(&self) -> bool {
        self.status == PreviewStatus::Deleted
    }

    /// Duration of the most recent build attempt in seconds, if it has finished.
    pub fn build_duration_secs(&self) -> Option<i64> {
        let started = self.build_started_at?;
        let completed = self.build_completed_at?;
        Some(completed.signed_duration_since(started).num_seconds().max(0))
    }
}

#[derive(Debug, Clone)]
pub struct NewPreview {
    pub project_id: Uuid,
    pub pr_number: u64,
    pub head_ref: String,
}

/// Field-level update of a preview. `None` leaves a field untouched; for
/// nullable fields `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct PreviewPatch {
    pub status: Option<PreviewStatus>,
    pub url: Option<Option<String>>,
    pub port: Option<Option<u16>>,
    pub container_name: Option<Option<String>>,
    pub build_started_at: Option<Option<DateTime<Utc>>>,
    pub build_completed_at: Option<Option<DateTime<Utc>>>,
    pub build_logs: Option<String>,
}

impl PreviewPatch {
    pub fn apply(self, preview: &mut Preview) {
        if let Some(status) = self.status {
            preview.status = status;
        }
        if let Some(url) = self.url {
            preview.url = url;
        }
        if let Some(port) = self.port {
            preview.port = port;
        }
        if let Some(container_name) = self.container_name {
            preview.container_name = container_name;
        }
        if let Some(started) = self.build_started_at {
            preview.build_started_at = started;
        }
        if let Some(completed) = self.build_completed_at {
            preview.build_completed_at = completed;
        }
        if let Some(logs) = self.build_logs {
            preview.build_logs = logs;
        }
    }
}
