use anyhow::{Context, Result};
use reqwest::Client;
use slack_morphism::prelude::*;
use url::Url;

use crate::events::{EventPublisher, PreviewEvent, Topic};
use crate::models::PreviewStatus;

/// Lightweight Slack Incoming Webhook sender built on slack-morphism request shapes.
#[derive(Clone)]
pub struct SlackWebhookClient {
    client: Client,
    webhook_url: Url,
}

impl SlackWebhookClient {
    pub fn new(webhook_url: &str) -> Result<Self> {
        let client = Client::new();
        let webhook_url = Url::parse(webhook_url)?;

        Ok(Self { client, webhook_url })
    }

    pub async fn send_text(&self, text: impl AsRef<str>) -> Result<()> {
        let req = SlackApiPostWebhookMessageRequest::new(
            SlackMessageContent::new().with_text(text.as_ref().to_string()),
        );

        self.client
            .post(self.webhook_url.clone())
            .json(&req)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }
}

/// Posts to Slack when a preview goes live or fails.
pub struct SlackNotifier {
    client: SlackWebhookClient,
}

impl SlackNotifier {
    pub fn new(client: SlackWebhookClient) -> Self {
        Self { client }
    }
}

fn notification_text(event: &PreviewEvent) -> Option<String> {
    let PreviewEvent::StateUpdate {
        preview_id,
        pr_number,
        status,
        url,
        build_number,
        ..
    } = event
    else {
        return None;
    };
    match status {
        PreviewStatus::Live => Some(format!(
            ":rocket: Preview for PR #{} is live at {} (build #{})",
            pr_number,
            url.as_deref().unwrap_or("-"),
            build_number
        )),
        PreviewStatus::Error => Some(format!(
            ":x: Preview build #{} for PR #{} failed (preview {})",
            build_number, pr_number, preview_id
        )),
        _ => None,
    }
}

impl EventPublisher for SlackNotifier {
    fn publish(&self, topic: Topic, event: &PreviewEvent) -> Result<()> {
        // State updates arrive on both topics; notify once.
        if !matches!(topic, Topic::Project(_)) {
            return Ok(());
        }
        let Some(text) = notification_text(event) else {
            return Ok(());
        };

        let handle = tokio::runtime::Handle::try_current()
            .context("Slack notifications need a tokio runtime")?;
        let client = self.client.clone();
        handle.spawn(async move {
            if let Err(e) = client.send_text(&text).await {
                tracing::warn!(error = %e, "Failed to send Slack notification");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn state(status: PreviewStatus) -> PreviewEvent {
        PreviewEvent::StateUpdate {
            preview_id: 3,
            project_id: Uuid::nil(),
            pr_number: 42,
            status,
            url: Some("http://localhost:5007".to_string()),
            port: Some(5007),
            container_name: None,
            build_number: 2,
            build_duration_secs: None,
        }
    }

    #[test]
    fn only_terminal_build_states_notify() {
        assert!(notification_text(&state(PreviewStatus::Building)).is_none());
        assert!(notification_text(&state(PreviewStatus::Deleted)).is_none());
        assert_eq!(
            notification_text(&state(PreviewStatus::Live)).unwrap(),
            ":rocket: Preview for PR #42 is live at http://localhost:5007 (build #2)"
        );
        assert!(
            notification_text(&state(PreviewStatus::Error))
                .unwrap()
                .contains("build #2 for PR #42 failed")
        );
    }

    #[test]
    fn rejects_invalid_webhook_url() {
        assert!(SlackWebhookClient::new("not a url").is_err());
    }
}
