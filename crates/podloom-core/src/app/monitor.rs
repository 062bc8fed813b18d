//! Lifecycle Monitor - インスタンスごとの制御ループ
//!
//! 1 インスタンスにつき 1 本の supervised task が、テンプレートの `ttl_interval`
//! ごとに orchestrator を probe し、観測したフェーズに応じて registry の行を
//! compare-and-set で進めます。
//!
//! # 遷移
//! - SCHEDULED → WAITING → PENDING → RUNNING（前方へのスキップは許す）
//! - RUNNING → SUCCEEDED / FAILED（終了コード）
//! - RUNNING → TLE（経過時間 >= time_limit。probe の成否に関係なく判定）/ MLE（使用量 >= 上限、または OOM kill）
//! - probe が `max_probe_failures` 回連続で失敗 → FAILED
//!
//! ログは最初の終端遷移と同じ compare-and-set で 1 回だけ保存します。
//! DELETING を観測したら cancellation に引き渡して抜けます。
//! compare-and-set に負けた場合（cancellation が先に行を動かした等）は何もせずに抜けます。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::cancellation;
use super::context::EngineContext;
use super::retry::retry;
use super::scheduler;
use crate::domain::{
    InstanceId, LaunchSpec, TaskInstance, TaskStatus, TransitionError, TransitionUpdate,
};
use crate::ports::{ContainerHandle, ContainerPhase, ContainerState, Label, OrchestratorError};

/// What a monitor does before its first probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Start {
    /// Freshly scheduled row: launch the container.
    Launch,
    /// Recovered SCHEDULED row: launch only if no container carries its label.
    LaunchIfMissing,
    /// Container already exists.
    Observe,
}

enum Step {
    Continue,
    Done,
}

/// Spawns the monitor of `id` unless one is already running.
pub(crate) async fn spawn(ctx: &Arc<EngineContext>, id: InstanceId, start: Start) -> bool {
    let Some(row) = ctx.registry.get(id).await else {
        return false;
    };
    if !row.status.is_active() {
        return false;
    }
    let cadence = ctx.cadence_for(row.settings_id).await;
    let monitor = Monitor::new(Arc::clone(ctx), &row, cadence);
    ctx.monitors.spawn_unique(id, monitor.run(start)).await
}

struct Monitor {
    ctx: Arc<EngineContext>,
    id: InstanceId,
    label: Label,
    spec: LaunchSpec,
    cadence: watch::Receiver<Duration>,
    cadence_open: bool,
    /// When the row entered RUNNING, on the tokio clock.
    started: Option<Instant>,
    probe_failures: u32,
}

impl Monitor {
    fn new(ctx: Arc<EngineContext>, row: &TaskInstance, cadence: watch::Receiver<Duration>) -> Self {
        // 再起動後に RUNNING の行を引き継いだ場合は、記録済みの開始時刻から経過分を差し引く
        let started = match (row.status, row.started_at) {
            (TaskStatus::Running, Some(at)) => {
                let ran = (ctx.clock.now() - at).to_std().unwrap_or_default();
                Some(Instant::now().checked_sub(ran).unwrap_or_else(Instant::now))
            }
            (TaskStatus::Running, None) => Some(Instant::now()),
            _ => None,
        };
        Self {
            label: ctx.label(row.id),
            ctx,
            id: row.id,
            spec: row.launch_spec.clone(),
            cadence,
            cadence_open: true,
            started,
            probe_failures: 0,
        }
    }

    #[instrument(name = "monitor", skip(self), fields(instance = %self.id))]
    async fn run(mut self, start: Start) {
        if !self.prepare(start).await {
            return;
        }
        loop {
            if let Step::Done = self.tick().await {
                break;
            }
            if !self.wait().await {
                debug!("monitor stopped by shutdown");
                break;
            }
        }
    }

    async fn prepare(&mut self, start: Start) -> bool {
        let launch = match start {
            Start::Launch => true,
            Start::Observe => false,
            Start::LaunchIfMissing => {
                let ctx = &self.ctx;
                let label = &self.label;
                matches!(
                    retry(&ctx.config.retry, "list", || ctx.orchestrator.list(label)).await,
                    Ok(containers) if containers.is_empty()
                )
            }
        };
        if launch {
            return scheduler::launch(&self.ctx, self.id, &self.spec).await;
        }
        true
    }

    /// Sleeps until the next probe. Returns false on shutdown.
    async fn wait(&mut self) -> bool {
        loop {
            let interval = *self.cadence.borrow();
            let wait = match self.started {
                Some(started) => {
                    let left = (started + self.spec.time_limit)
                        .saturating_duration_since(Instant::now());
                    // 期限切れ後は通常の間隔に戻す
                    if left.is_zero() {
                        interval
                    } else {
                        interval.min(left)
                    }
                }
                None => interval,
            };
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => return false,
                _ = tokio::time::sleep(wait) => return true,
                changed = self.cadence.changed(), if self.cadence_open => {
                    match changed {
                        Ok(()) => debug!(interval = ?*self.cadence.borrow(), "probe cadence changed"),
                        Err(_) => self.cadence_open = false,
                    }
                }
            }
        }
    }

    async fn tick(&mut self) -> Step {
        let Some(row) = self.ctx.registry.get(self.id).await else {
            return Step::Done;
        };
        match row.status {
            TaskStatus::Deleting => {
                debug!("deletion observed; handing off");
                cancellation::spawn(&self.ctx, self.id).await;
                return Step::Done;
            }
            status if status.is_terminal() => return Step::Done,
            _ => {}
        }
        if row.status == TaskStatus::Running && self.past_deadline() {
            return self.enforce_deadline().await;
        }

        let probe =
            tokio::time::timeout(self.ctx.config.probe_timeout, self.ctx.orchestrator.list(&self.label))
                .await;
        let containers = match probe {
            Ok(Ok(containers)) if !containers.is_empty() => containers,
            Ok(Ok(_)) => return self.probe_failed(row.status, "no container found").await,
            Ok(Err(err)) => return self.probe_failed(row.status, &err.to_string()).await,
            Err(_) => {
                return self
                    .probe_failed(row.status, &OrchestratorError::Timeout.to_string())
                    .await;
            }
        };
        self.probe_failures = 0;

        let container = containers
            .iter()
            .find(|c| c.phase != ContainerPhase::Unknown)
            .unwrap_or(&containers[0]);
        self.observe(row.status, container).await
    }

    async fn observe(&mut self, status: TaskStatus, container: &ContainerState) -> Step {
        match container.phase {
            ContainerPhase::Exited { code } => self.finish(status, &container.handle, code).await,
            ContainerPhase::OomKilled => {
                if self.ensure_running(status).await.is_none() {
                    return Step::Done;
                }
                self.enforce(
                    TaskStatus::Mle,
                    Some(&container.handle),
                    "container was killed for exceeding its memory limit",
                )
                .await
            }
            ContainerPhase::Unknown => Step::Continue,
            phase => {
                let mut status = status;
                if let Some(target) = phase.launch_status()
                    && status.can_transition(target)
                {
                    match self.advance(status, target).await {
                        Some(next) => status = next,
                        None => return Step::Done,
                    }
                }
                if status == TaskStatus::Running {
                    return self.check_limits(container).await;
                }
                Step::Continue
            }
        }
    }

    async fn check_limits(&mut self, container: &ContainerState) -> Step {
        if let (Some(limit), Some(used)) = (self.spec.memory_limit_bytes, container.memory_bytes)
            && used >= limit
        {
            let reason = format!("memory usage {used} bytes reached limit of {limit} bytes");
            return self.enforce(TaskStatus::Mle, Some(&container.handle), &reason).await;
        }
        if self.past_deadline() {
            return self.enforce_deadline().await;
        }
        Step::Continue
    }

    fn past_deadline(&self) -> bool {
        self.started
            .is_some_and(|started| started.elapsed() >= self.spec.time_limit)
    }

    /// TLE from the local start time. The container is looked up only for its partial log.
    async fn enforce_deadline(&mut self) -> Step {
        let reason = format!(
            "time limit of {}s exceeded",
            self.spec.time_limit.as_secs()
        );
        let handle = match tokio::time::timeout(
            self.ctx.config.probe_timeout,
            self.ctx.orchestrator.list(&self.label),
        )
        .await
        {
            Ok(Ok(containers)) => containers.into_iter().next().map(|c| c.handle),
            _ => None,
        };
        self.enforce(TaskStatus::Tle, handle.as_ref(), &reason).await
    }

    /// CAS `from -> to`. Returns the new status, or None when the monitor should stop.
    async fn advance(&mut self, from: TaskStatus, to: TaskStatus) -> Option<TaskStatus> {
        let update = if to == TaskStatus::Running {
            TransitionUpdate::started(self.ctx.clock.now())
        } else {
            TransitionUpdate::none()
        };
        match self.ctx.registry.transition(self.id, from, to, update).await {
            Ok(_) => {
                info!(from = %from, to = %to, "status changed");
                if to == TaskStatus::Running {
                    self.started = Some(Instant::now());
                }
                Some(to)
            }
            Err(err) => {
                self.lost(err).await;
                None
            }
        }
    }

    async fn ensure_running(&mut self, status: TaskStatus) -> Option<TaskStatus> {
        if status == TaskStatus::Running {
            return Some(status);
        }
        self.advance(status, TaskStatus::Running).await
    }

    /// Container exited on its own.
    async fn finish(&mut self, status: TaskStatus, handle: &ContainerHandle, code: i64) -> Step {
        if self.ensure_running(status).await.is_none() {
            return Step::Done;
        }
        let log = self.fetch_log(handle).await.unwrap_or_default();
        let to = if code == 0 {
            TaskStatus::Succeeded
        } else {
            TaskStatus::Failed
        };
        match self
            .ctx
            .registry
            .transition(
                self.id,
                TaskStatus::Running,
                to,
                TransitionUpdate::finished(Some(code), log),
            )
            .await
        {
            Ok(_) => {
                info!(status = %to, exit_code = code, "instance finished");
                if self.ctx.config.remove_finished_containers {
                    let ctx = &self.ctx;
                    let label = &self.label;
                    if let Err(err) =
                        retry(&ctx.config.retry, "remove", || ctx.orchestrator.remove(label)).await
                    {
                        warn!(error = %err, "could not remove finished container");
                    }
                }
            }
            Err(err) => self.lost(err).await,
        }
        Step::Done
    }

    /// Limit breach: persist the partial log, then terminate once.
    async fn enforce(
        &mut self,
        to: TaskStatus,
        handle: Option<&ContainerHandle>,
        reason: &str,
    ) -> Step {
        let log = match handle {
            Some(handle) => self.fetch_log(handle).await,
            None => None,
        }
        .unwrap_or_else(|| reason.to_string());
        match self
            .ctx
            .registry
            .transition(
                self.id,
                TaskStatus::Running,
                to,
                TransitionUpdate::finished(None, log),
            )
            .await
        {
            Ok(_) => {
                info!(status = %to, reason, "limit exceeded");
                self.terminate().await;
            }
            Err(err) => self.lost(err).await,
        }
        Step::Done
    }

    async fn probe_failed(&mut self, status: TaskStatus, reason: &str) -> Step {
        self.probe_failures += 1;
        let max = self.ctx.config.max_probe_failures.max(1);
        warn!(failures = self.probe_failures, max, reason, "health probe failed");
        if self.probe_failures < max {
            return Step::Continue;
        }

        let log = format!(
            "health probe failed {} times: {reason}",
            self.probe_failures
        );
        match self
            .ctx
            .registry
            .transition(
                self.id,
                status,
                TaskStatus::Failed,
                TransitionUpdate::finished(None, log),
            )
            .await
        {
            Ok(_) => {
                error!(from = %status, "probe budget exhausted; instance failed");
                self.terminate().await;
            }
            Err(err) => self.lost(err).await,
        }
        Step::Done
    }

    async fn terminate(&self) {
        let ctx = &self.ctx;
        let label = &self.label;
        if let Err(err) =
            retry(&ctx.config.retry, "terminate", || ctx.orchestrator.terminate(label)).await
        {
            warn!(error = %err, label = %label, "could not terminate container");
        }
    }

    async fn fetch_log(&self, handle: &ContainerHandle) -> Option<String> {
        let ctx = &self.ctx;
        match retry(&ctx.config.retry, "logs", || ctx.orchestrator.logs(handle)).await {
            Ok(log) => Some(log),
            Err(err) => {
                warn!(error = %err, container = %handle, "could not fetch container log");
                None
            }
        }
    }

    /// A rejected CAS: someone else moved the row first.
    async fn lost(&self, err: TransitionError) {
        match err {
            TransitionError::Conflict {
                actual: TaskStatus::Deleting,
                ..
            } => {
                debug!("deletion won the race; handing off");
                cancellation::spawn(&self.ctx, self.id).await;
            }
            TransitionError::Conflict { expected, actual, .. } => {
                debug!(%expected, %actual, "row moved on; monitor exits");
            }
            TransitionError::Invalid { from, to, .. } => {
                warn!(%from, %to, "invariant violation: transition ignored");
            }
            TransitionError::NotFound(_) => debug!("row removed; monitor exits"),
        }
    }
}
