//! Engine - スケジューリングとライフサイクル管理の入口
//!
//! # ライフサイクル
//! - `Starting`: 構築直後。スケジュール要求は `NotReady` で拒否
//! - `Reconciling`: `start()` 中。registry の非終端行を orchestrator の実状態と突き合わせる
//! - `Ready`: 受付可能
//! - `ShuttingDown`: `shutdown()` 以降
//!
//! 状態は `watch` チャネルで公開するので、呼び出し側は `wait_ready()` で待てます。

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use super::builder::EngineBuilder;
use super::cancellation::{self, Orphan};
use super::config::{EngineConfig, LIVE_LOG_PLACEHOLDER};
use super::context::EngineContext;
use super::retry::retry;
use super::scheduler;
use super::status::StatusCounts;
use crate::domain::{
    EngineError, InstanceId, NewSettings, SettingsPatch, TaskInstance, TaskSettings, TaskStatus,
    TemplateId, TransitionError, UserId,
};
use crate::ports::{
    Clock, DeletionRequest, IdGenerator, Orchestrator, SettingsStore, TaskRegistry,
};

/// Readiness of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Starting,
    Reconciling,
    Ready,
    ShuttingDown,
}

/// Where a returned log came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogSource {
    /// Fetched from the running container.
    Live,
    /// Snapshot stored in the registry.
    Persisted,
    /// Live fetch failed and nothing was persisted yet.
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLog {
    pub text: String,
    pub source: LogSource,
}

/// Task scheduling and lifecycle engine. Clones share the same engine.
#[derive(Clone)]
pub struct Engine {
    ctx: Arc<EngineContext>,
    state: Arc<watch::Sender<EngineState>>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub(crate) fn new(
        registry: Arc<dyn TaskRegistry>,
        settings: Arc<dyn SettingsStore>,
        orchestrator: Arc<dyn Orchestrator>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        config: EngineConfig,
    ) -> Self {
        let ctx = EngineContext::new(registry, settings, orchestrator, clock, ids, config);
        let (state, _) = watch::channel(EngineState::Starting);
        Self {
            ctx: Arc::new(ctx),
            state: Arc::new(state),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    // ========================================
    // Readiness
    // ========================================

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == EngineState::Ready
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    /// Resolves once the engine is ready. Returns false if it shuts down first.
    pub async fn wait_ready(&self) -> bool {
        let mut rx = self.state.subscribe();
        match rx
            .wait_for(|s| matches!(s, EngineState::Ready | EngineState::ShuttingDown))
            .await
        {
            Ok(state) => *state == EngineState::Ready,
            Err(_) => false,
        }
    }

    fn ensure_ready(&self) -> Result<(), EngineError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(EngineError::NotReady)
        }
    }

    /// Reconciles registry rows against the orchestrator, then accepts work.
    ///
    /// Fails with `OrchestratorUnavailable` when the orchestrator cannot be reached;
    /// the engine stays in `Starting` and `start()` may be called again.
    ///
    /// DELETING rows are handed to cancellation, SCHEDULED rows without a container
    /// are launched, and every other non-terminal row gets a monitor.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), EngineError> {
        let moved = self.state.send_if_modified(|state| {
            if *state == EngineState::Starting {
                *state = EngineState::Reconciling;
                true
            } else {
                false
            }
        });
        if !moved {
            warn!(state = ?self.state(), "start called twice; ignored");
            return Ok(());
        }

        // orchestrator に届かないうちは突き合わせができないので Starting に戻す
        let probe = self.ctx.label_for("reconcile");
        if let Err(err) = retry(&self.ctx.config.retry, "list", || {
            self.ctx.orchestrator.list(&probe)
        })
        .await
        {
            self.state.send_replace(EngineState::Starting);
            warn!(error = %err, "orchestrator unreachable; reconciliation aborted");
            return Err(err.into());
        }

        let rows = self.ctx.registry.list_non_terminal().await;
        info!(rows = rows.len(), "reconciling registry");
        join_all(rows.iter().map(|row| scheduler::adopt(&self.ctx, row))).await;

        self.state.send_replace(EngineState::Ready);
        info!("engine ready");
        Ok(())
    }

    /// Stops every monitor and waits for in-flight cancellations.
    pub async fn shutdown(&self) {
        self.state.send_replace(EngineState::ShuttingDown);
        self.ctx.shutdown.cancel();
        self.ctx.tracker.close();
        self.ctx.tracker.wait().await;
        info!("engine stopped");
    }

    // ========================================
    // Scheduling
    // ========================================

    /// (Re)schedules a template.
    ///
    /// Never duplicates running instances: it publishes the template's probe cadence
    /// to live monitors and launches rows that have no container yet.
    /// Returns the template's active instances.
    #[instrument(skip(self))]
    pub async fn schedule_task_settings(
        &self,
        settings_id: TemplateId,
    ) -> Result<Vec<InstanceId>, EngineError> {
        self.ensure_ready()?;
        let settings = self.get_settings(settings_id).await?;
        Ok(scheduler::reconcile_template(&self.ctx, &settings).await)
    }

    /// Runs the template for `user`: admits against the sharing quota and schedules
    /// `replica` instances.
    pub async fn submit(
        &self,
        settings_id: TemplateId,
        user: &UserId,
    ) -> Result<Vec<InstanceId>, EngineError> {
        self.ensure_ready()?;
        scheduler::submit(&self.ctx, settings_id, user).await
    }

    // ========================================
    // Templates
    // ========================================

    /// Refused with `NotReady` until `start()` has reconciled the registry.
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create_settings(&self, request: NewSettings) -> Result<TaskSettings, EngineError> {
        self.ensure_ready()?;
        let id = self.ctx.ids.generate_template_id();
        let settings = TaskSettings::new(id, request, self.ctx.clock.now())?;
        self.ctx.settings.insert(settings.clone()).await?;
        scheduler::reconcile_template(&self.ctx, &settings).await;
        info!(template = %settings.id, "task settings created");
        Ok(settings)
    }

    /// Partial update. A changed `ttl_interval` reschedules the template.
    /// Refused with `NotReady` like every other scheduling call.
    #[instrument(skip(self, patch))]
    pub async fn update_settings(
        &self,
        id: TemplateId,
        patch: SettingsPatch,
    ) -> Result<TaskSettings, EngineError> {
        self.ensure_ready()?;
        let (settings, effect) = self.ctx.settings.update(id, &patch).await?;
        if effect.ttl_changed {
            info!(ttl_interval = settings.ttl_interval, "ttl changed; rescheduling");
            scheduler::reconcile_template(&self.ctx, &settings).await;
        }
        Ok(settings)
    }

    /// Refused while any instance still references the template.
    #[instrument(skip(self))]
    pub async fn delete_settings(&self, id: TemplateId) -> Result<TaskSettings, EngineError> {
        let _catalog = self.ctx.catalog.lock().await;
        let referencing = self.ctx.registry.list_by_settings(id).await.len();
        if referencing > 0 {
            return Err(EngineError::Protected(referencing));
        }
        let removed = self.ctx.settings.remove(id).await?;
        self.ctx.forget_cadence(id).await;
        info!("task settings deleted");
        Ok(removed)
    }

    pub async fn get_settings(&self, id: TemplateId) -> Result<TaskSettings, EngineError> {
        self.ctx
            .settings
            .get(id)
            .await
            .ok_or_else(|| EngineError::not_found("task settings", id))
    }

    pub async fn list_settings(&self) -> Vec<TaskSettings> {
        self.ctx.settings.list().await
    }

    // ========================================
    // Instances (read path)
    // ========================================

    pub async fn get_task(&self, id: InstanceId) -> Result<TaskInstance, EngineError> {
        self.ctx
            .registry
            .get(id)
            .await
            .ok_or_else(|| EngineError::not_found("task", id))
    }

    pub async fn list_tasks_for_user(&self, user: &UserId) -> Vec<TaskInstance> {
        self.ctx.registry.list_by_user(user).await
    }

    pub async fn list_tasks(&self) -> Vec<TaskInstance> {
        self.ctx.registry.list_all().await
    }

    /// Log of an instance.
    ///
    /// RUNNING instances are read live from the container. When the container is
    /// already gone the stored log is returned; when the orchestrator errors or
    /// times out, a placeholder.
    pub async fn task_log(&self, id: InstanceId) -> Result<TaskLog, EngineError> {
        let row = self.get_task(id).await?;
        let persisted = TaskLog {
            text: row.log.unwrap_or_default(),
            source: LogSource::Persisted,
        };
        if row.status != TaskStatus::Running {
            return Ok(persisted);
        }

        Ok(match self.live_log(id).await {
            Ok(Some(text)) => TaskLog {
                text,
                source: LogSource::Live,
            },
            Ok(None) => persisted,
            Err(reason) => {
                warn!(instance = %id, %reason, "live log unavailable");
                TaskLog {
                    text: LIVE_LOG_PLACEHOLDER.to_string(),
                    source: LogSource::Placeholder,
                }
            }
        })
    }

    /// `Ok(None)` when no container carries the instance label.
    async fn live_log(&self, id: InstanceId) -> Result<Option<String>, String> {
        let label = self.ctx.label(id);
        let timeout = self.ctx.config.probe_timeout;
        let orchestrator = &self.ctx.orchestrator;

        let containers = tokio::time::timeout(timeout, orchestrator.list(&label))
            .await
            .map_err(|_| "list timed out".to_string())?
            .map_err(|err| err.to_string())?;
        let Some(container) = containers.first() else {
            return Ok(None);
        };
        tokio::time::timeout(timeout, orchestrator.logs(&container.handle))
            .await
            .map_err(|_| "logs timed out".to_string())?
            .map(Some)
            .map_err(|err| err.to_string())
    }

    /// Marks the instance DELETING and starts cancellation. Idempotent.
    #[instrument(skip(self))]
    pub async fn request_deletion(&self, id: InstanceId) -> Result<DeletionRequest, EngineError> {
        let request = self
            .ctx
            .registry
            .request_deletion(id)
            .await
            .map_err(|err| match err {
                TransitionError::NotFound(id) => EngineError::not_found("task", id),
                other => EngineError::InvariantViolation(other),
            })?;
        info!(?request, "deletion requested");
        cancellation::spawn(&self.ctx, id).await;
        Ok(request)
    }

    // ========================================
    // Observability
    // ========================================

    pub async fn status_counts(&self, settings_id: Option<TemplateId>) -> StatusCounts {
        let rows = match settings_id {
            Some(id) => self.ctx.registry.list_by_settings(id).await,
            None => self.ctx.registry.list_all().await,
        };
        StatusCounts::from_rows(&rows)
    }

    /// Containers whose rows were force-removed after terminate kept failing.
    pub async fn orphans(&self) -> Vec<Orphan> {
        self.ctx.orphans().await
    }

    pub async fn active_monitors(&self) -> usize {
        self.ctx.monitors.active_count().await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use ulid::Ulid;

    use super::*;
    use crate::domain::ContainerConfig;
    use crate::impls::fake_orchestrator::{FakeBehavior, FakeOp};
    use crate::impls::{FakeOrchestrator, InMemoryRegistry, InMemorySettingsStore};
    use crate::ports::Label;

    pub(crate) fn template(name: &str, image: &str, time_limit: u64, ttl: u64) -> NewSettings {
        NewSettings {
            name: name.to_string(),
            description: String::new(),
            container_config: ContainerConfig::new(image),
            time_limit,
            replica: 1,
            ttl_interval: ttl,
            max_sharing_users: 1,
        }
    }

    pub(crate) struct Harness {
        pub engine: Engine,
        pub fake: FakeOrchestrator,
        pub registry: InMemoryRegistry,
        pub settings: InMemorySettingsStore,
    }

    impl Harness {
        pub fn new() -> Self {
            let fake = FakeOrchestrator::new();
            let registry = InMemoryRegistry::new();
            let settings = InMemorySettingsStore::new();
            let engine = Engine::builder()
                .registry(registry.clone())
                .settings_store(settings.clone())
                .orchestrator(fake.clone())
                .build()
                .unwrap();
            Self {
                engine,
                fake,
                registry,
                settings,
            }
        }

        pub async fn ready() -> Self {
            let h = Self::new();
            h.engine.start().await.unwrap();
            h
        }

        pub async fn create(&self, request: NewSettings) -> TaskSettings {
            self.engine.create_settings(request).await.unwrap()
        }

        /// Stores a template directly, as a previous run would have left it.
        pub async fn seed(&self, request: NewSettings) -> TaskSettings {
            let settings =
                TaskSettings::new(TemplateId::from_ulid(Ulid::new()), request, Utc::now()).unwrap();
            self.settings.insert(settings.clone()).await.unwrap();
            settings
        }

        pub async fn status(&self, id: InstanceId) -> TaskStatus {
            self.engine.get_task(id).await.unwrap().status
        }

        pub fn label(&self, id: InstanceId) -> Label {
            Label::for_instance(&self.engine.config().label_key, id)
        }
    }

    fn instance(tpl: &TaskSettings, user: &str, status: TaskStatus) -> TaskInstance {
        let user = UserId::new(user);
        let spec = tpl.launch_spec(&user).unwrap();
        let mut row = TaskInstance::scheduled(
            InstanceId::from_ulid(Ulid::new()),
            user,
            tpl.id,
            spec,
            Utc::now(),
        );
        row.status = status;
        if status == TaskStatus::Running {
            row.started_at = Some(row.create_time);
        }
        row
    }

    #[tokio::test]
    async fn scheduling_waits_for_readiness() {
        let h = Harness::new();
        let tpl = h.seed(template("early", "alpine", 5, 1)).await;

        assert_eq!(h.engine.state(), EngineState::Starting);
        assert!(matches!(
            h.engine.submit(tpl.id, &"alice".into()).await,
            Err(EngineError::NotReady)
        ));
        assert!(matches!(
            h.engine.schedule_task_settings(tpl.id).await,
            Err(EngineError::NotReady)
        ));

        let waiter = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.wait_ready().await })
        };
        h.engine.start().await.unwrap();
        assert!(waiter.await.unwrap());
        assert!(h.engine.is_ready());
        h.engine.submit(tpl.id, &"alice".into()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn template_edits_wait_for_readiness() {
        let h = Harness::new();
        let tpl = h.seed(template("pending", "alpine", 60, 1)).await;
        let row = instance(&tpl, "a", TaskStatus::Scheduled);
        h.registry.restore(vec![row.clone()]).await;

        let patch = SettingsPatch {
            ttl_interval: Some(3),
            ..Default::default()
        };
        assert!(matches!(
            h.engine.update_settings(tpl.id, patch.clone()).await,
            Err(EngineError::NotReady)
        ));
        assert!(matches!(
            h.engine
                .create_settings(template("other", "alpine", 60, 1))
                .await,
            Err(EngineError::NotReady)
        ));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.fake.launch_calls(&h.label(row.id)).await, 0);
        assert_eq!(h.status(row.id).await, TaskStatus::Scheduled);
        assert_eq!(h.engine.get_settings(tpl.id).await.unwrap().ttl_interval, 1);
        assert_eq!(h.engine.list_settings().await.len(), 1);

        h.engine.shutdown().await;
        assert!(matches!(
            h.engine.update_settings(tpl.id, patch).await,
            Err(EngineError::NotReady)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn start_fails_while_the_orchestrator_is_unreachable() {
        let h = Harness::new();
        h.fake.fail_times(FakeOp::List, 100).await;

        assert!(matches!(
            h.engine.start().await,
            Err(EngineError::OrchestratorUnavailable(_))
        ));
        assert_eq!(h.engine.state(), EngineState::Starting);

        h.fake.fail_times(FakeOp::List, 0).await;
        h.engine.start().await.unwrap();
        assert!(h.engine.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn replicas_finish_within_the_time_limit() {
        let h = Harness::ready().await;
        h.fake
            .script("fast", FakeBehavior::exits_after(Duration::from_secs(2), 0, "ok"))
            .await;
        let mut request = template("replicas", "fast", 5, 1);
        request.replica = 3;
        let tpl = h.create(request).await;

        let ids = h.engine.submit(tpl.id, &"a".into()).await.unwrap();
        assert_eq!(ids.len(), 3);
        for &id in &ids {
            assert_eq!(h.status(id).await, TaskStatus::Scheduled);
        }

        tokio::time::sleep(Duration::from_secs(6)).await;
        for &id in &ids {
            assert_eq!(h.status(id).await, TaskStatus::Succeeded);
        }
        assert_eq!(h.engine.status_counts(Some(tpl.id)).await.succeeded, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn time_limit_is_enforced_once() {
        let h = Harness::ready().await;
        h.fake
            .script("forever", FakeBehavior::runs_forever("partial output"))
            .await;
        let mut request = template("tle", "forever", 5, 1);
        request.replica = 3;
        let tpl = h.create(request).await;
        let ids = h.engine.submit(tpl.id, &"a".into()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(4500)).await;
        for &id in &ids {
            assert_eq!(h.status(id).await, TaskStatus::Running);
        }

        tokio::time::sleep(Duration::from_secs(3)).await;
        for &id in &ids {
            let row = h.engine.get_task(id).await.unwrap();
            assert_eq!(row.status, TaskStatus::Tle);
            assert_eq!(row.log.as_deref(), Some("partial output"));
            assert_eq!(h.fake.terminate_calls(&h.label(id)).await, 1);
        }

        // 終端状態からは動かない
        tokio::time::sleep(Duration::from_secs(10)).await;
        for &id in &ids {
            assert_eq!(h.status(id).await, TaskStatus::Tle);
            assert_eq!(h.fake.terminate_calls(&h.label(id)).await, 1);
        }
        assert_eq!(h.engine.active_monitors().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn second_user_waits_for_the_first_to_finish() {
        let h = Harness::ready().await;
        h.fake
            .script("job", FakeBehavior::exits_after(Duration::from_secs(3), 0, ""))
            .await;
        let tpl = h.create(template("exclusive", "job", 10, 1)).await;

        let a = h.engine.submit(tpl.id, &"a".into()).await.unwrap()[0];
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(h.status(a).await, TaskStatus::Running);

        let denied = h.engine.submit(tpl.id, &"b".into()).await;
        assert!(matches!(denied, Err(EngineError::AdmissionDenied { .. })));
        // 保持者本人は再入できる
        h.engine.submit(tpl.id, &"a".into()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(h.status(a).await, TaskStatus::Succeeded);
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.engine.submit(tpl.id, &"b".into()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_new_users_respect_the_quota() {
        let h = Harness::ready().await;
        h.fake
            .script("shared", FakeBehavior::runs_forever(""))
            .await;
        let mut request = template("shared", "shared", 60, 1);
        request.max_sharing_users = 2;
        let tpl = h.create(request).await;

        let attempts = (0..5).map(|n| {
            let engine = h.engine.clone();
            let user = UserId::new(format!("user-{n}"));
            tokio::spawn(async move { engine.submit(tpl.id, &user).await })
        });
        let results = join_all(attempts).await;
        let admitted = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(_))))
            .count();
        assert_eq!(admitted, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn live_log_prefers_the_container_and_falls_back() {
        let h = Harness::ready().await;
        h.fake
            .script("chatty", FakeBehavior::runs_forever("line 1\nline 2"))
            .await;
        let tpl = h.create(template("chatty", "chatty", 60, 1)).await;
        let id = h.engine.submit(tpl.id, &"a".into()).await.unwrap()[0];
        tokio::time::sleep(Duration::from_millis(500)).await;

        let live = h.engine.task_log(id).await.unwrap();
        assert_eq!(live.source, LogSource::Live);
        assert_eq!(live.text, "line 1\nline 2");

        h.fake.fail_times(FakeOp::Logs, 1).await;
        let fallback = h.engine.task_log(id).await.unwrap();
        assert_eq!(fallback.source, LogSource::Placeholder);
        assert_eq!(fallback.text, LIVE_LOG_PLACEHOLDER);
    }

    #[tokio::test]
    async fn vanished_container_serves_the_stored_log() {
        let h = Harness::new();
        let tpl = h.seed(template("vanished", "alpine", 60, 1)).await;
        let mut row = instance(&tpl, "a", TaskStatus::Running);
        row.log = Some("checkpoint".into());
        h.registry.restore(vec![row.clone()]).await;

        assert_eq!(
            h.engine.task_log(row.id).await.unwrap(),
            TaskLog {
                text: "checkpoint".into(),
                source: LogSource::Persisted,
            }
        );

        h.fake.fail_times(FakeOp::List, 1).await;
        let unreachable = h.engine.task_log(row.id).await.unwrap();
        assert_eq!(unreachable.source, LogSource::Placeholder);
    }

    #[tokio::test(start_paused = true)]
    async fn containers_receive_the_owner_and_paths() {
        let h = Harness::ready().await;
        let mut request = template("env", "alpine", 60, 1);
        request.container_config.commands = vec!["echo $CLOUD_SCHEDULER_USER".into()];
        request.container_config.task_script_path = Some("scripts/".into());
        request.container_config.task_initial_file_path = Some("initial/".into());
        let tpl = h.create(request).await;
        let id = h.engine.submit(tpl.id, &"carol".into()).await.unwrap()[0];
        tokio::time::sleep(Duration::from_millis(100)).await;

        let spec = h.fake.launched_spec(&h.label(id)).await.unwrap();
        assert_eq!(spec.user, UserId::new("carol"));
        assert_eq!(
            spec.env(),
            vec![
                "CLOUD_SCHEDULER_USER=carol",
                "TASK_SCRIPT_PATH=scripts/",
                "TASK_INITIAL_FILE_PATH=initial/"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn finished_instances_serve_the_persisted_log() {
        let h = Harness::ready().await;
        h.fake
            .script("done", FakeBehavior::exits_after(Duration::from_secs(1), 0, "result=42"))
            .await;
        let tpl = h.create(template("done", "done", 60, 1)).await;
        let id = h.engine.submit(tpl.id, &"a".into()).await.unwrap()[0];
        tokio::time::sleep(Duration::from_secs(3)).await;

        let log = h.engine.task_log(id).await.unwrap();
        assert_eq!(log.source, LogSource::Persisted);
        assert_eq!(log.text, "result=42");
    }

    #[tokio::test(start_paused = true)]
    async fn launch_failure_marks_the_instance_failed() {
        let h = Harness::ready().await;
        h.fake.fail_times(FakeOp::Launch, 100).await;
        let tpl = h.create(template("nolaunch", "alpine", 60, 1)).await;
        let id = h.engine.submit(tpl.id, &"a".into()).await.unwrap()[0];

        tokio::time::sleep(Duration::from_secs(5)).await;
        let row = h.engine.get_task(id).await.unwrap();
        assert_eq!(row.status, TaskStatus::Failed);
        assert!(row.log.unwrap().starts_with("failed to launch container"));

        // 失敗した行は quota を占有しない
        h.fake.fail_times(FakeOp::Launch, 0).await;
        h.engine.submit(tpl.id, &"b".into()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn start_adopts_rows_left_by_a_previous_run() {
        let h = Harness::new();
        h.fake
            .script("resume", FakeBehavior::exits_after(Duration::from_secs(2), 0, "resumed"))
            .await;
        let tpl = h.seed(template("resume", "resume", 60, 1)).await;

        // SCHEDULED のまま起動されていない行
        let orphaned = instance(&tpl, "a", TaskStatus::Scheduled);
        // 既にコンテナが動いている行
        let running = instance(&tpl, "a", TaskStatus::Running);
        h.fake
            .launch(&running.launch_spec, &h.label(running.id))
            .await
            .unwrap();
        // 削除要求が残っている行
        let deleting = instance(&tpl, "a", TaskStatus::Deleting);

        h.registry
            .restore(vec![orphaned.clone(), running.clone(), deleting.clone()])
            .await;
        h.engine.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(h.status(orphaned.id).await, TaskStatus::Succeeded);
        assert_eq!(h.status(running.id).await, TaskStatus::Succeeded);
        assert!(h.engine.get_task(deleting.id).await.is_err());
        assert_eq!(h.fake.launch_calls(&h.label(orphaned.id)).await, 1);
        assert_eq!(h.fake.launch_calls(&h.label(running.id)).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_never_duplicates_instances() {
        let h = Harness::ready().await;
        h.fake
            .script("svc", FakeBehavior::runs_forever(""))
            .await;
        let tpl = h.create(template("svc", "svc", 60, 1)).await;
        let id = h.engine.submit(tpl.id, &"a".into()).await.unwrap()[0];
        tokio::time::sleep(Duration::from_millis(500)).await;

        let active = h.engine.schedule_task_settings(tpl.id).await.unwrap();
        assert_eq!(active, vec![id]);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.fake.launch_calls(&h.label(id)).await, 1);
        assert_eq!(h.engine.list_tasks().await.len(), 1);
        assert_eq!(h.engine.active_monitors().await, 1);
    }

    #[tokio::test]
    async fn referenced_templates_are_protected() {
        let h = Harness::ready().await;
        let tpl = h.create(template("protected", "alpine", 60, 1)).await;
        h.engine.submit(tpl.id, &"a".into()).await.unwrap();

        assert!(matches!(
            h.engine.delete_settings(tpl.id).await,
            Err(EngineError::Protected(1))
        ));

        let unused = h.create(template("unused", "alpine", 60, 1)).await;
        h.engine.delete_settings(unused.id).await.unwrap();
        assert!(matches!(
            h.engine.get_settings(unused.id).await,
            Err(EngineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn template_rules_are_enforced() {
        let h = Harness::ready().await;
        let mut request = template("clamped", "alpine", 60, 0);
        request.replica = 1;
        assert_eq!(h.create(request).await.ttl_interval, 1);

        assert!(matches!(
            h.engine
                .create_settings(template("clamped", "alpine", 60, 1))
                .await,
            Err(EngineError::DuplicateName(_))
        ));

        let mut zero = template("zero", "alpine", 60, 1);
        zero.replica = 0;
        assert!(matches!(
            h.engine.create_settings(zero).await,
            Err(EngineError::InvalidSettings(_))
        ));
    }

    #[tokio::test]
    async fn users_only_see_their_own_tasks() {
        let h = Harness::ready().await;
        let mut request = template("many", "alpine", 60, 1);
        request.max_sharing_users = 2;
        let tpl = h.create(request).await;
        for _ in 0..3 {
            h.engine.submit(tpl.id, &"a".into()).await.unwrap();
        }
        h.engine.submit(tpl.id, &"b".into()).await.unwrap();

        assert_eq!(h.engine.list_tasks_for_user(&"a".into()).await.len(), 3);
        assert_eq!(h.engine.list_tasks_for_user(&"b".into()).await.len(), 1);
        assert_eq!(h.engine.list_tasks().await.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_monitors() {
        let h = Harness::ready().await;
        h.fake
            .script("daemon", FakeBehavior::runs_forever(""))
            .await;
        let tpl = h.create(template("daemon", "daemon", 600, 1)).await;
        h.engine.submit(tpl.id, &"a".into()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.engine.active_monitors().await, 1);

        h.engine.shutdown().await;
        assert_eq!(h.engine.state(), EngineState::ShuttingDown);
        assert_eq!(h.engine.active_monitors().await, 0);
        assert!(!h.engine.wait_ready().await);
    }
}
