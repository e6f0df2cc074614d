//! Substitutable collaborators for unit tests.

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;
use uuid::Uuid;

use crate::docker_client::ContainerRuntime;
use crate::error::PreviewError;
use crate::events::{EventPublisher, PreviewEvent, Topic};
use crate::models::{PreviewId, PreviewStatus, Project};
use crate::process::{CommandSpec, ProcessRunner};
use crate::source::SourceProvider;

pub fn test_project() -> Project {
    Project {
        id: Uuid::new_v4(),
        repo_owner: "acme".to_string(),
        repo_name: "shop".to_string(),
        owner_id: "alice".to_string(),
    }
}

/// A run of `len` ports starting at one the OS just handed out.
pub fn free_port_range(len: u16) -> RangeInclusive<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    if port > u16::MAX - len {
        (port - len + 1)..=port
    } else {
        port..=(port + len - 1)
    }
}

struct Rule {
    subcommand: String,
    exit_code: i32,
    output: String,
    once: bool,
}

#[derive(Default)]
struct DockerState {
    calls: Vec<CommandSpec>,
    containers: HashSet<String>,
    images: HashSet<String>,
    rules: Vec<Rule>,
    removal_error: Option<String>,
    exit_on_start: bool,
}

/// Scripted process runner and container runtime. Every command succeeds
/// unless a rule for its first argument (`build`, `run`, `clone`, ...) says
/// otherwise. A successful `docker build` registers its tag and a successful
/// `docker run` registers the named container.
#[derive(Default)]
pub struct FakeDocker {
    state: Mutex<DockerState>,
}

impl FakeDocker {
    pub fn fail_when(&self, subcommand: &str, exit_code: i32, output: &str) {
        self.state.lock().unwrap().rules.push(Rule {
            subcommand: subcommand.to_string(),
            exit_code,
            output: output.to_string(),
            once: false,
        });
    }

    pub fn fail_run_once_with_port_conflict(&self) {
        self.state.lock().unwrap().rules.push(Rule {
            subcommand: "run".to_string(),
            exit_code: 125,
            output: "docker: Error response from daemon: Bind for 0.0.0.0 failed: port is already allocated.\n"
                .to_string(),
            once: true,
        });
    }

    pub fn clear_rules(&self) {
        self.state.lock().unwrap().rules.clear();
    }

    pub fn fail_removals(&self, reason: &str) {
        self.state.lock().unwrap().removal_error = Some(reason.to_string());
    }

    /// `docker run` succeeds but the container stops immediately.
    pub fn exit_on_start(&self) {
        self.state.lock().unwrap().exit_on_start = true;
    }

    pub fn add_container(&self, name: &str) {
        self.state.lock().unwrap().containers.insert(name.to_string());
    }

    pub fn is_container_running(&self, name: &str) -> bool {
        self.state.lock().unwrap().containers.contains(name)
    }

    pub fn running_containers(&self) -> Vec<String> {
        self.state.lock().unwrap().containers.iter().cloned().collect()
    }

    pub fn images(&self) -> Vec<String> {
        self.state.lock().unwrap().images.iter().cloned().collect()
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.state.lock().unwrap().calls.clone()
    }
}

fn flag_value(cmd: &CommandSpec, flag: &str) -> Option<String> {
    let idx = cmd.args.iter().position(|a| a == flag)?;
    cmd.args.get(idx + 1).cloned()
}

#[async_trait]
impl ProcessRunner for FakeDocker {
    async fn execute(
        &self,
        command: &CommandSpec,
        output: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<i32> {
        let subcommand = command.args.first().cloned().unwrap_or_default();
        let scripted = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(command.clone());
            match state.rules.iter().position(|r| r.subcommand == subcommand) {
                Some(idx) if state.rules[idx].once => {
                    let rule = state.rules.remove(idx);
                    Some((rule.exit_code, rule.output))
                }
                Some(idx) => Some((state.rules[idx].exit_code, state.rules[idx].output.clone())),
                None => None,
            }
        };

        if let Some((exit_code, text)) = scripted {
            output(&text);
            return Ok(exit_code);
        }

        match subcommand.as_str() {
            "build" => {
                if let Some(tag) = flag_value(command, "-t") {
                    self.state.lock().unwrap().images.insert(tag);
                }
                output("Step 1/1 : FROM scratch\nSuccessfully built 0123456789ab\n");
            }
            "run" => {
                let mut state = self.state.lock().unwrap();
                if let Some(name) = flag_value(command, "--name")
                    && !state.exit_on_start
                {
                    state.containers.insert(name);
                }
                drop(state);
                output("4f2c9d1e7a3b\n");
            }
            other => output(&format!("{} ok\n", other)),
        }
        Ok(0)
    }
}

#[async_trait]
impl ContainerRuntime for FakeDocker {
    async fn remove_container(&self, name: &str) -> Result<bool, PreviewError> {
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = &state.removal_error {
            return Err(PreviewError::ContainerRemoveFailed {
                name: name.to_string(),
                reason: reason.clone(),
            });
        }
        Ok(state.containers.remove(name))
    }

    async fn remove_image(&self, image: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = &state.removal_error {
            anyhow::bail!("failed to remove image {}: {}", image, reason);
        }
        Ok(state.images.remove(image))
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        Ok(self.is_container_running(name))
    }
}

/// Writes a minimal source tree into a temporary directory per clone.
pub struct FakeSource {
    root: tempfile::TempDir,
    fail_with: Mutex<Option<String>>,
    cloned: Mutex<Vec<(PathBuf, Option<String>)>>,
    paused: watch::Sender<bool>,
}

impl Default for FakeSource {
    fn default() -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
            fail_with: Mutex::new(None),
            cloned: Mutex::new(Vec::new()),
            paused: watch::channel(false).0,
        }
    }
}

impl FakeSource {
    pub fn fail_with(&self, reason: &str) {
        *self.fail_with.lock().unwrap() = Some(reason.to_string());
    }

    /// Holds every clone until [`FakeSource::resume`] is called.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn clones(&self) -> Vec<(PathBuf, Option<String>)> {
        self.cloned.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceProvider for FakeSource {
    async fn clone_source(
        &self,
        _repo_owner: &str,
        repo_name: &str,
        git_ref: Option<&str>,
        output: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<PathBuf, PreviewError> {
        let mut paused = self.paused.subscribe();
        let _ = paused.wait_for(|p| !*p).await;

        output(&format!("Cloning into '{}'...\n", repo_name));
        let failure = self.fail_with.lock().unwrap().clone();
        if let Some(reason) = failure {
            output(&format!("fatal: {}\n", reason));
            return Err(PreviewError::CloneFailed(reason));
        }

        let dir = self.root.path().join(Uuid::new_v4().simple().to_string());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("Dockerfile"), "FROM scratch\n").unwrap();
        self.cloned
            .lock()
            .unwrap()
            .push((dir.clone(), git_ref.map(str::to_string)));
        Ok(dir)
    }
}

/// Keeps every published event for later inspection.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<(Topic, PreviewEvent)>>,
}

impl RecordingPublisher {
    pub fn events(&self) -> Vec<(Topic, PreviewEvent)> {
        self.events.lock().unwrap().clone()
    }

    /// Statuses announced on the project topic for one preview, in order.
    pub fn states(&self, preview_id: PreviewId) -> Vec<PreviewStatus> {
        self.events()
            .into_iter()
            .filter_map(|(topic, event)| match (topic, event) {
                (
                    Topic::Project(_),
                    PreviewEvent::StateUpdate {
                        preview_id: id,
                        status,
                        ..
                    },
                ) if id == preview_id => Some(status),
                _ => None,
            })
            .collect()
    }

    pub fn log_chunks(&self, preview_id: PreviewId) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|(topic, event)| match (topic, event) {
                (Topic::Preview(t), PreviewEvent::LogChunk { chunk, .. }) if t == preview_id => {
                    Some(chunk)
                }
                _ => None,
            })
            .collect()
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, topic: Topic, event: &PreviewEvent) -> Result<()> {
        self.events.lock().unwrap().push((topic, event.clone()));
        Ok(())
    }
}
