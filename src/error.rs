use thiserror::Error;

use crate::models::PreviewId;

/// Failures surfaced by the preview orchestrator.
///
/// Collaborators (record store, runtime clients) report through `anyhow` and
/// land in [`PreviewError::Unexpected`].
#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("clone failed: {0}")]
    CloneFailed(String),

    #[error("no free host port in range {min}-{max}")]
    PortExhausted { min: u16, max: u16 },

    #[error("image build exited with status {exit_code}")]
    BuildFailed { exit_code: i32 },

    #[error("container run exited with status {exit_code}")]
    RunFailed { exit_code: i32, port_in_use: bool },

    #[error("container {0} exited right after start")]
    ContainerExited(String),

    #[error("failed to remove container {name}: {reason}")]
    ContainerRemoveFailed { name: String, reason: String },

    #[error("forbidden")]
    Forbidden,

    #[error("{0} not found")]
    NotFound(String),

    #[error("preview {0} already has a build in progress")]
    BuildInProgress(PreviewId),

    #[error("preview {0} has been deleted")]
    PreviewDeleted(PreviewId),

    #[error("unexpected error: {0:#}")]
    Unexpected(#[from] anyhow::Error),
}

impl PreviewError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        PreviewError::NotFound(what.to_string())
    }
}
