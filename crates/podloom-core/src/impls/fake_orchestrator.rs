//! Scripted in-process orchestrator.
//!
//! イメージ名ごとに `FakeBehavior` を登録しておくと、起動からの経過時間
//! （tokio の仮想時間）に応じてフェーズが進みます。テストと `--fake` 実行で使います。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::domain::LaunchSpec;
use crate::ports::{
    ContainerHandle, ContainerPhase, ContainerState, Label, Orchestrator, OrchestratorError,
};

/// How a container of a given image behaves once launched.
#[derive(Debug, Clone)]
pub struct FakeBehavior {
    /// Stays `Accepted` until this much time has passed since launch.
    pub place_after: Duration,
    /// Stays `Placed` until this much time has passed since launch.
    pub start_after: Duration,
    /// Run time before exiting; `None` runs until terminated.
    pub run_for: Option<Duration>,
    pub exit_code: i64,
    pub memory_bytes: Option<u64>,
    /// Run time after which the kernel kills the container.
    pub oom_kill_after: Option<Duration>,
    pub log: String,
    /// Launch is refused outright.
    pub reject: bool,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            place_after: Duration::ZERO,
            start_after: Duration::ZERO,
            run_for: Some(Duration::from_secs(1)),
            exit_code: 0,
            memory_bytes: None,
            oom_kill_after: None,
            log: String::new(),
            reject: false,
        }
    }
}

impl FakeBehavior {
    pub fn exits_after(run_for: Duration, exit_code: i64, log: impl Into<String>) -> Self {
        Self {
            run_for: Some(run_for),
            exit_code,
            log: log.into(),
            ..Self::default()
        }
    }

    pub fn runs_forever(log: impl Into<String>) -> Self {
        Self {
            run_for: None,
            log: log.into(),
            ..Self::default()
        }
    }

    pub fn with_startup(mut self, place_after: Duration, start_after: Duration) -> Self {
        self.place_after = place_after;
        self.start_after = start_after;
        self
    }

    pub fn with_memory(mut self, bytes: u64) -> Self {
        self.memory_bytes = Some(bytes);
        self
    }
}

/// Orchestrator call that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    Launch,
    List,
    Logs,
    Terminate,
}

struct FakeContainer {
    handle: ContainerHandle,
    label: Label,
    launched_at: Instant,
    behavior: FakeBehavior,
}

impl FakeContainer {
    fn phase(&self, now: Instant) -> ContainerPhase {
        let elapsed = now.saturating_duration_since(self.launched_at);
        let b = &self.behavior;
        if elapsed < b.place_after {
            return ContainerPhase::Accepted;
        }
        if elapsed < b.start_after {
            return ContainerPhase::Placed;
        }
        let ran = elapsed - b.start_after;
        if b.oom_kill_after.is_some_and(|d| ran >= d) {
            return ContainerPhase::OomKilled;
        }
        match b.run_for {
            Some(d) if ran >= d => ContainerPhase::Exited { code: b.exit_code },
            _ => ContainerPhase::Running,
        }
    }
}

#[derive(Default)]
struct FakeState {
    behaviors: HashMap<String, FakeBehavior>,
    containers: Vec<FakeContainer>,
    next_handle: u64,
    failures: HashMap<FakeOp, u32>,
    launches: HashMap<Label, u32>,
    launched_specs: HashMap<Label, LaunchSpec>,
    terminations: HashMap<Label, u32>,
}

impl FakeState {
    fn take_failure(&mut self, op: FakeOp) -> Result<(), OrchestratorError> {
        match self.failures.get_mut(&op) {
            Some(left) if *left > 0 => {
                *left = left.saturating_sub(1);
                Err(OrchestratorError::Unavailable(format!("injected {op:?} failure")))
            }
            _ => Ok(()),
        }
    }
}

/// Scripted orchestrator; clones share state.
#[derive(Clone, Default)]
pub struct FakeOrchestrator {
    state: Arc<Mutex<FakeState>>,
}

impl FakeOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the behavior of containers launched from `image`.
    pub async fn script(&self, image: impl Into<String>, behavior: FakeBehavior) {
        self.state
            .lock()
            .await
            .behaviors
            .insert(image.into(), behavior);
    }

    /// The next `times` calls of `op` fail with a transient error.
    pub async fn fail_times(&self, op: FakeOp, times: u32) {
        self.state.lock().await.failures.insert(op, times);
    }

    pub async fn launch_calls(&self, label: &Label) -> u32 {
        self.state
            .lock()
            .await
            .launches
            .get(label)
            .copied()
            .unwrap_or(0)
    }

    /// Spec of the last launch under `label`.
    pub async fn launched_spec(&self, label: &Label) -> Option<LaunchSpec> {
        self.state.lock().await.launched_specs.get(label).cloned()
    }

    pub async fn terminate_calls(&self, label: &Label) -> u32 {
        self.state
            .lock()
            .await
            .terminations
            .get(label)
            .copied()
            .unwrap_or(0)
    }

    /// Containers still known to the orchestrator.
    pub async fn container_count(&self) -> usize {
        self.state.lock().await.containers.len()
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn launch(
        &self,
        spec: &LaunchSpec,
        label: &Label,
    ) -> Result<ContainerHandle, OrchestratorError> {
        let mut state = self.state.lock().await;
        state.take_failure(FakeOp::Launch)?;

        let behavior = state
            .behaviors
            .get(&spec.image)
            .cloned()
            .unwrap_or_default();
        if behavior.reject {
            return Err(OrchestratorError::Rejected(format!(
                "image {} refused",
                spec.image
            )));
        }

        state.next_handle += 1;
        let handle = ContainerHandle(format!("fake-{}", state.next_handle));
        *state.launches.entry(label.clone()).or_default() += 1;
        state.launched_specs.insert(label.clone(), spec.clone());
        state.containers.push(FakeContainer {
            handle: handle.clone(),
            label: label.clone(),
            launched_at: Instant::now(),
            behavior,
        });
        Ok(handle)
    }

    async fn list(&self, label: &Label) -> Result<Vec<ContainerState>, OrchestratorError> {
        let mut state = self.state.lock().await;
        state.take_failure(FakeOp::List)?;

        let now = Instant::now();
        Ok(state
            .containers
            .iter()
            .filter(|c| &c.label == label)
            .map(|c| {
                let phase = c.phase(now);
                ContainerState {
                    handle: c.handle.clone(),
                    phase,
                    memory_bytes: match phase {
                        ContainerPhase::Running => c.behavior.memory_bytes,
                        _ => None,
                    },
                }
            })
            .collect())
    }

    async fn logs(&self, handle: &ContainerHandle) -> Result<String, OrchestratorError> {
        let mut state = self.state.lock().await;
        state.take_failure(FakeOp::Logs)?;

        state
            .containers
            .iter()
            .find(|c| &c.handle == handle)
            .map(|c| c.behavior.log.clone())
            .ok_or_else(|| OrchestratorError::NotFound(handle.to_string()))
    }

    async fn terminate(&self, label: &Label) -> Result<(), OrchestratorError> {
        let mut state = self.state.lock().await;
        *state.terminations.entry(label.clone()).or_default() += 1;
        state.take_failure(FakeOp::Terminate)?;

        state.containers.retain(|c| &c.label != label);
        Ok(())
    }

    async fn remove(&self, label: &Label) -> Result<(), OrchestratorError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.containers.retain(|c| {
            &c.label != label
                || !matches!(
                    c.phase(now),
                    ContainerPhase::Exited { .. } | ContainerPhase::OomKilled
                )
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PersistentVolume;

    fn spec(image: &str) -> LaunchSpec {
        LaunchSpec {
            image: image.to_string(),
            shell: "/bin/sh".into(),
            commands: vec!["true".into()],
            working_dir: None,
            memory_limit_bytes: None,
            volume: Some(PersistentVolume {
                name: "data".into(),
                mount_path: "/data".into(),
            }),
            time_limit: Duration::from_secs(5),
            script_path: None,
            initial_file_path: None,
            user: "tester".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn phases_follow_the_script() {
        let fake = FakeOrchestrator::new();
        fake.script(
            "slow",
            FakeBehavior::exits_after(Duration::from_secs(3), 1, "bye")
                .with_startup(Duration::from_secs(1), Duration::from_secs(2)),
        )
        .await;
        let label = Label::new("app", "task-1");
        fake.launch(&spec("slow"), &label).await.unwrap();
        assert_eq!(fake.launched_spec(&label).await, Some(spec("slow")));

        let phase = |v: Vec<ContainerState>| v[0].phase;
        assert_eq!(phase(fake.list(&label).await.unwrap()), ContainerPhase::Accepted);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(phase(fake.list(&label).await.unwrap()), ContainerPhase::Placed);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(phase(fake.list(&label).await.unwrap()), ContainerPhase::Running);
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(
            phase(fake.list(&label).await.unwrap()),
            ContainerPhase::Exited { code: 1 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_is_counted_and_clears_containers() {
        let fake = FakeOrchestrator::new();
        let label = Label::new("app", "task-2");
        let handle = fake.launch(&spec("alpine"), &label).await.unwrap();

        fake.terminate(&label).await.unwrap();
        fake.terminate(&label).await.unwrap();
        assert_eq!(fake.terminate_calls(&label).await, 2);
        assert!(fake.list(&label).await.unwrap().is_empty());
        assert_eq!(
            fake.logs(&handle).await,
            Err(OrchestratorError::NotFound(handle.to_string()))
        );
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let fake = FakeOrchestrator::new();
        fake.fail_times(FakeOp::Launch, 2).await;
        let label = Label::new("app", "task-3");
        assert!(fake.launch(&spec("alpine"), &label).await.is_err());
        assert!(fake.launch(&spec("alpine"), &label).await.is_err());
        assert!(fake.launch(&spec("alpine"), &label).await.is_ok());
    }

    #[tokio::test]
    async fn rejected_images_are_not_transient() {
        let fake = FakeOrchestrator::new();
        fake.script(
            "broken",
            FakeBehavior {
                reject: true,
                ..FakeBehavior::default()
            },
        )
        .await;
        let err = fake
            .launch(&spec("broken"), &Label::new("app", "task-4"))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
