use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{Preview, PreviewId, PreviewStatus};

/// Where an event is delivered: everyone watching a project, or only the
/// observers of one preview.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Project(Uuid),
    Preview(PreviewId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PreviewEvent {
    #[serde(rename_all = "camelCase")]
    StateUpdate {
        preview_id: PreviewId,
        project_id: Uuid,
        pr_number: u64,
        status: PreviewStatus,
        url: Option<String>,
        port: Option<u16>,
        container_name: Option<String>,
        build_number: u32,
        build_duration_secs: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    LogChunk { preview_id: PreviewId, chunk: String },
}

impl PreviewEvent {
    pub fn state(preview: &Preview) -> Self {
        PreviewEvent::StateUpdate {
            preview_id: preview.id,
            project_id: preview.project_id,
            pr_number: preview.pr_number,
            status: preview.status,
            url: preview.url.clone(),
            port: preview.port,
            container_name: preview.container_name.clone(),
            build_number: preview.build_number,
            build_duration_secs: preview.build_duration_secs(),
        }
    }
}

/// Transport for preview events. Delivery is at-most-once.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, topic: Topic, event: &PreviewEvent) -> Result<()>;
}

/// Fire-and-forget front to an [`EventPublisher`]: failures are logged and
/// never reach the caller.
#[derive(Clone)]
pub struct Events {
    publisher: Arc<dyn EventPublisher>,
}

impl Events {
    pub fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self { publisher }
    }

    pub fn state_changed(&self, preview: &Preview) {
        let event = PreviewEvent::state(preview);
        self.emit(Topic::Project(preview.project_id), &event);
        self.emit(Topic::Preview(preview.id), &event);
    }

    pub fn log_chunk(&self, preview_id: PreviewId, chunk: &str) {
        let event = PreviewEvent::LogChunk {
            preview_id,
            chunk: chunk.to_string(),
        };
        self.emit(Topic::Preview(preview_id), &event);
    }

    fn emit(&self, topic: Topic, event: &PreviewEvent) {
        if let Err(e) = self.publisher.publish(topic, event) {
            tracing::warn!(error = %e, ?topic, "Failed to publish preview event");
        }
    }
}

/// A project-wide event as seen by project subscribers.
#[derive(Debug, Clone)]
pub struct ProjectEvent {
    pub project_id: Uuid,
    pub event: PreviewEvent,
}

/// In-process publisher over tokio broadcast channels.
pub struct BroadcastPublisher {
    capacity: usize,
    project_tx: broadcast::Sender<ProjectEvent>,
    scoped: Mutex<HashMap<PreviewId, broadcast::Sender<PreviewEvent>>>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (project_tx, _) = broadcast::channel(capacity);
        Self {
            capacity,
            project_tx,
            scoped: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe_projects(&self) -> broadcast::Receiver<ProjectEvent> {
        self.project_tx.subscribe()
    }

    pub fn subscribe_preview(&self, preview_id: PreviewId) -> Result<broadcast::Receiver<PreviewEvent>> {
        let mut scoped = self
            .scoped
            .lock()
            .map_err(|e| anyhow!("event channel lock poisoned: {}", e))?;
        // Drop channels whose observers all went away without a publish
        scoped.retain(|_, tx| tx.receiver_count() > 0);
        let tx = scoped
            .entry(preview_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(tx.subscribe())
    }

    /// Number of previews with an open scoped channel.
    pub fn scoped_channels(&self) -> usize {
        self.scoped.lock().map(|scoped| scoped.len()).unwrap_or(0)
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, topic: Topic, event: &PreviewEvent) -> Result<()> {
        match topic {
            Topic::Project(project_id) => {
                // Ignore error if no receivers
                let _ = self.project_tx.send(ProjectEvent {
                    project_id,
                    event: event.clone(),
                });
            }
            Topic::Preview(preview_id) => {
                let mut scoped = self
                    .scoped
                    .lock()
                    .map_err(|e| anyhow!("event channel lock poisoned: {}", e))?;
                if let Some(tx) = scoped.get(&preview_id)
                    && tx.send(event.clone()).is_err()
                {
                    // Every observer went away
                    scoped.remove(&preview_id);
                }
            }
        }
        Ok(())
    }
}

/// Delivers each event to every inner publisher.
pub struct FanoutPublisher {
    publishers: Vec<Arc<dyn EventPublisher>>,
}

impl FanoutPublisher {
    pub fn new(publishers: Vec<Arc<dyn EventPublisher>>) -> Self {
        Self { publishers }
    }
}

impl EventPublisher for FanoutPublisher {
    fn publish(&self, topic: Topic, event: &PreviewEvent) -> Result<()> {
        let errors: Vec<String> = self
            .publishers
            .iter()
            .filter_map(|p| p.publish(topic, event).err())
            .map(|e| format!("{:#}", e))
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl EventPublisher for Failing {
        fn publish(&self, _topic: Topic, _event: &PreviewEvent) -> Result<()> {
            Err(anyhow!("transport down"))
        }
    }

    fn chunk(preview_id: PreviewId, text: &str) -> PreviewEvent {
        PreviewEvent::LogChunk {
            preview_id,
            chunk: text.to_string(),
        }
    }

    #[tokio::test]
    async fn log_chunks_only_reach_their_preview() {
        let publisher = BroadcastPublisher::new(16);
        let mut one = publisher.subscribe_preview(1).unwrap();
        let mut two = publisher.subscribe_preview(2).unwrap();

        publisher.publish(Topic::Preview(1), &chunk(1, "hello")).unwrap();

        assert_eq!(one.recv().await.unwrap(), chunk(1, "hello"));
        assert!(matches!(
            two.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn project_events_carry_project_id() {
        let publisher = BroadcastPublisher::new(16);
        let mut rx = publisher.subscribe_projects();
        let project_id = Uuid::new_v4();

        publisher
            .publish(Topic::Project(project_id), &chunk(3, "x"))
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.project_id, project_id);
    }

    #[test]
    fn publishing_without_observers_succeeds() {
        let publisher = BroadcastPublisher::new(4);
        assert!(publisher.publish(Topic::Preview(9), &chunk(9, "x")).is_ok());
        assert!(
            publisher
                .publish(Topic::Project(Uuid::new_v4()), &chunk(9, "x"))
                .is_ok()
        );

        let rx = publisher.subscribe_preview(9).unwrap();
        drop(rx);
        assert!(publisher.publish(Topic::Preview(9), &chunk(9, "x")).is_ok());
        assert!(publisher.scoped.lock().unwrap().is_empty());
    }

    #[test]
    fn abandoned_subscriptions_do_not_accumulate() {
        let publisher = BroadcastPublisher::new(4);
        for id in 0..1000 {
            drop(publisher.subscribe_preview(id).unwrap());
        }
        assert!(publisher.scoped_channels() <= 1);

        let _live = publisher.subscribe_preview(5000).unwrap();
        drop(publisher.subscribe_preview(5001).unwrap());
        drop(publisher.subscribe_preview(5002).unwrap());
        assert_eq!(publisher.scoped_channels(), 2);
        assert!(publisher.scoped.lock().unwrap().contains_key(&5000));
    }

    #[test]
    fn fanout_reports_failures_but_still_delivers() {
        let broadcast = Arc::new(BroadcastPublisher::new(4));
        let mut rx = broadcast.subscribe_preview(5).unwrap();
        let publishers: Vec<Arc<dyn EventPublisher>> = vec![Arc::new(Failing), broadcast.clone()];
        let fanout = FanoutPublisher::new(publishers);

        assert!(fanout.publish(Topic::Preview(5), &chunk(5, "a")).is_err());
        assert_eq!(rx.try_recv().unwrap(), chunk(5, "a"));
    }

    #[test]
    fn events_swallow_publisher_errors() {
        let events = Events::new(Arc::new(Failing));
        events.log_chunk(1, "ignored");
    }

    #[test]
    fn state_event_serializes_camel_case() {
        let event = PreviewEvent::StateUpdate {
            preview_id: 1,
            project_id: Uuid::nil(),
            pr_number: 42,
            status: PreviewStatus::Live,
            url: Some("http://localhost:5000".to_string()),
            port: Some(5000),
            container_name: Some("pv-x".to_string()),
            build_number: 1,
            build_duration_secs: Some(3),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stateUpdate");
        assert_eq!(json["prNumber"], 42);
        assert_eq!(json["status"], "live");
    }
}
