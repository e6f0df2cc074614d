use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Preview, PreviewId, PreviewStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewListResponse {
    pub previews: Vec<PreviewSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewSummary {
    pub id: PreviewId,
    pub project_id: Uuid,
    pub pr_number: u64,
    pub head_ref: String,
    pub status: PreviewStatus,
    pub url: Option<String>,
    pub port: Option<u16>,
    pub container_name: Option<String>,
    pub build_number: u32,
    pub build_started_at: Option<DateTime<Utc>>,
    pub build_completed_at: Option<DateTime<Utc>>,
    pub build_duration_seconds: Option<i64>,
}

impl From<&Preview> for PreviewSummary {
    fn from(p: &Preview) -> Self {
        Self {
            id: p.id,
            project_id: p.project_id,
            pr_number: p.pr_number,
            head_ref: p.head_ref.clone(),
            status: p.status,
            url: p.url.clone(),
            port: p.port,
            container_name: p.container_name.clone(),
            build_number: p.build_number,
            build_started_at: p.build_started_at,
            build_completed_at: p.build_completed_at,
            build_duration_seconds: p.build_duration_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewDetailResponse {
    #[serde(flatten)]
    pub summary: PreviewSummary,
    pub build_logs: String,
}

impl From<Preview> for PreviewDetailResponse {
    fn from(p: Preview) -> Self {
        Self {
            summary: PreviewSummary::from(&p),
            build_logs: p.build_logs,
        }
    }
}

/// Query parameters for listing previews
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    pub project_id: Uuid,
}

/// Query parameters for log streaming
#[derive(Debug, Deserialize)]
pub struct LogParams {
    #[serde(default = "default_tail")]
    pub tail: usize,
    #[serde(default = "default_follow")]
    pub follow: bool,
}

fn default_tail() -> usize {
    100
}

fn default_follow() -> bool {
    true
}
