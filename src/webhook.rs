//! GitHub webhook deliveries: signature check, payload shapes and the
//! lifecycle transitions they trigger.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

use crate::error::PreviewError;
use crate::lifecycle::{Actor, PreviewService};
use crate::models::{PreviewId, Project};
use crate::slash_cmd::SlashCommand;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid webhook payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error(transparent)]
    Preview(#[from] PreviewError),
}

/// Checks an `x-hub-signature-256` header value against the raw body.
pub fn validate_signature(secret: &[u8], payload: &[u8], signature: &str) -> bool {
    let sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(sig_bytes) = hex::decode(sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&sig_bytes).is_ok()
}

#[derive(Debug, Deserialize)]
pub struct Repository {
    pub name: String,
    pub owner: Account,
}

#[derive(Debug, Deserialize)]
pub struct Account {
    pub login: String,
}

#[derive(Debug, Deserialize)]
pub struct PullRequestEvent {
    pub action: String,
    pub number: u64,
    pub repository: Repository,
}

#[derive(Debug, Deserialize)]
pub struct IssueCommentEvent {
    pub action: String,
    pub issue: Issue,
    pub comment: Comment,
    pub repository: Repository,
}

#[derive(Debug, Deserialize)]
pub struct Issue {
    pub number: u64,
    /// Present only when the issue is a pull request.
    pub pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct Comment {
    pub body: String,
}

/// What a delivery ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Ignored(String),
    BuildStarted(PreviewId),
    Deleted(PreviewId),
}

/// Ref GitHub publishes for a pull request's head commit.
pub fn pull_request_ref(pr_number: u64) -> String {
    format!("refs/pull/{}/head", pr_number)
}

/// Dispatches one delivery by its `x-github-event` type.
pub async fn handle_event(
    service: &PreviewService,
    event_type: &str,
    body: &[u8],
) -> Result<WebhookOutcome, WebhookError> {
    let outcome = match event_type {
        "pull_request" => {
            let event: PullRequestEvent = serde_json::from_slice(body)?;
            handle_pull_request(service, event).await
        }
        "issue_comment" => {
            let event: IssueCommentEvent = serde_json::from_slice(body)?;
            handle_issue_comment(service, event).await
        }
        "ping" => {
            tracing::info!("Received GitHub ping webhook");
            return Ok(WebhookOutcome::Ignored("ping".to_string()));
        }
        other => {
            tracing::debug!("Ignoring webhook event: {}", other);
            return Ok(WebhookOutcome::Ignored(format!("event {}", other)));
        }
    };

    // Overlapping deliveries are expected; they are not delivery failures.
    match outcome {
        Err(e @ (PreviewError::BuildInProgress(_) | PreviewError::PreviewDeleted(_))) => {
            tracing::info!(error = %e, "Webhook delivery skipped");
            Ok(WebhookOutcome::Ignored(e.to_string()))
        }
        other => Ok(other?),
    }
}

async fn project_for(
    service: &PreviewService,
    repository: &Repository,
) -> Result<Option<Project>, PreviewError> {
    let project = service
        .store()
        .find_project_by_repo(&repository.owner.login, &repository.name)
        .await?;
    if project.is_none() {
        tracing::debug!(
            "No project registered for repo: {}/{}",
            repository.owner.login,
            repository.name
        );
    }
    Ok(project)
}

async fn handle_pull_request(
    service: &PreviewService,
    event: PullRequestEvent,
) -> Result<WebhookOutcome, PreviewError> {
    let Some(project) = project_for(service, &event.repository).await? else {
        return Ok(WebhookOutcome::Ignored("unknown repository".to_string()));
    };

    match event.action.as_str() {
        "opened" | "reopened" | "synchronize" => {
            let ticket = service
                .start_build(project.id, event.number, &pull_request_ref(event.number))
                .await?;
            Ok(WebhookOutcome::BuildStarted(ticket.preview().id))
        }
        "closed" => match service.close_pull_request(project.id, event.number).await? {
            Some(preview) => Ok(WebhookOutcome::Deleted(preview.id)),
            None => Ok(WebhookOutcome::Ignored("no preview".to_string())),
        },
        other => Ok(WebhookOutcome::Ignored(format!("action {}", other))),
    }
}

async fn handle_issue_comment(
    service: &PreviewService,
    event: IssueCommentEvent,
) -> Result<WebhookOutcome, PreviewError> {
    if event.action != "created" || event.issue.pull_request.is_none() {
        return Ok(WebhookOutcome::Ignored("not a new pull request comment".to_string()));
    }
    let Some(command) = SlashCommand::from_comment(&event.comment.body) else {
        return Ok(WebhookOutcome::Ignored("no command".to_string()));
    };
    let Some(project) = project_for(service, &event.repository).await? else {
        return Ok(WebhookOutcome::Ignored("unknown repository".to_string()));
    };
    let pr_number = event.issue.number;

    tracing::info!(project_id = %project.id, pr_number, ?command, "Slash command received");
    match command {
        SlashCommand::Preview => {
            let ticket = match service.preview_for_pull_request(project.id, pr_number).await {
                Ok(preview) => service.rebuild(preview.id, &Actor::System).await?,
                Err(PreviewError::NotFound(_)) => {
                    service
                        .start_build(project.id, pr_number, &pull_request_ref(pr_number))
                        .await?
                }
                Err(e) => return Err(e),
            };
            Ok(WebhookOutcome::BuildStarted(ticket.preview().id))
        }
        SlashCommand::Delete => match service.close_pull_request(project.id, pr_number).await? {
            Some(preview) => Ok(WebhookOutcome::Deleted(preview.id)),
            None => Ok(WebhookOutcome::Ignored("no preview".to_string())),
        },
    }
}
