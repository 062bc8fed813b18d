//! Cancellation Handler - DELETING になった行の後始末
//!
//! 1. 取れるならログを保存（teardown 中は `task_log` から読め、孤児になった場合は `Orphan` に残る）
//! 2. label でコンテナを terminate（backoff 付きリトライ）
//! 3. `list(label)` が空になるのを猶予時間まで待つ
//! 4. 行を削除
//!
//! terminate がリトライ上限まで失敗した場合も行は削除し、孤児コンテナとして
//! `Orphan` に記録して warn を出します。既に終端状態の行は片付けだけ行います。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::context::EngineContext;
use super::retry::retry;
use crate::domain::{InstanceId, TaskStatus};
use crate::ports::Label;

/// Container that may still be running after its row was force-removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Orphan {
    pub instance: InstanceId,
    pub label: Label,
    pub reason: String,
    pub detected_at: DateTime<Utc>,
    /// Log captured before terminate was attempted.
    pub last_log: Option<String>,
}

/// Starts cancellation of `id` unless it is already in flight.
pub(crate) async fn spawn(ctx: &Arc<EngineContext>, id: InstanceId) -> bool {
    ctx.cancellations
        .spawn_unique(id, cancel(Arc::clone(ctx), id))
        .await
}

#[instrument(name = "cancel", skip(ctx), fields(instance = %id))]
async fn cancel(ctx: Arc<EngineContext>, id: InstanceId) {
    let Some(row) = ctx.registry.get(id).await else {
        debug!("already removed");
        return;
    };
    let label = ctx.label(id);

    if row.is_terminal() {
        // 終端遷移が先に確定していた: 残ったコンテナを片付けて行を消すだけ
        if let Err(err) =
            retry(&ctx.config.retry, "remove", || ctx.orchestrator.remove(&label)).await
        {
            warn!(error = %err, label = %label, "could not remove finished container");
        }
        ctx.registry.remove(id).await;
        info!(status = %row.status, "finished instance removed");
        return;
    }
    if row.status != TaskStatus::Deleting {
        debug!(status = %row.status, "deletion not requested; nothing to do");
        return;
    }

    let last_log = capture_log(&ctx, id, &label).await;

    match retry(&ctx.config.retry, "terminate", || {
        ctx.orchestrator.terminate(&label)
    })
    .await
    {
        Ok(()) => {
            if !confirm_teardown(&ctx, &label).await {
                warn!(
                    grace = ?ctx.config.teardown_grace,
                    label = %label,
                    "teardown not confirmed within grace period; removing row"
                );
            }
        }
        Err(err) => {
            warn!(
                error = %err,
                label = %label,
                orphan = true,
                "terminate failed; row force-removed, container may be orphaned"
            );
            ctx.record_orphan(Orphan {
                instance: id,
                label: label.clone(),
                reason: err.to_string(),
                detected_at: ctx.clock.now(),
                last_log: last_log.clone(),
            })
            .await;
        }
    }

    ctx.registry.remove(id).await;
    info!(
        captured_log_bytes = last_log.as_ref().map(String::len),
        "instance removed"
    );
}

/// Stores the container log on the row and returns it.
async fn capture_log(ctx: &Arc<EngineContext>, id: InstanceId, label: &Label) -> Option<String> {
    let containers = match retry(&ctx.config.retry, "list", || ctx.orchestrator.list(label)).await
    {
        Ok(containers) => containers,
        Err(err) => {
            debug!(error = %err, "no log captured");
            return None;
        }
    };
    let container = containers.first()?;
    match retry(&ctx.config.retry, "logs", || {
        ctx.orchestrator.logs(&container.handle)
    })
    .await
    {
        Ok(log) => {
            ctx.registry.record_final_log(id, log.clone()).await;
            Some(log)
        }
        Err(err) => {
            debug!(error = %err, "no log captured");
            None
        }
    }
}

/// Waits until no container carries `label`, bounded by the teardown grace period.
async fn confirm_teardown(ctx: &Arc<EngineContext>, label: &Label) -> bool {
    tokio::time::timeout(ctx.config.teardown_grace, async {
        loop {
            match ctx.orchestrator.list(label).await {
                Ok(containers) if containers.is_empty() => return,
                Ok(_) => {}
                Err(err) => debug!(error = %err, "teardown confirmation probe failed"),
            }
            tokio::time::sleep(ctx.config.confirm_poll).await;
        }
    })
    .await
    .is_ok()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::app::LogSource;
    use crate::app::engine::tests::{Harness, template};
    use crate::domain::{EngineError, TaskStatus};
    use crate::impls::fake_orchestrator::{FakeBehavior, FakeOp};
    use crate::ports::DeletionRequest;

    #[tokio::test(start_paused = true)]
    async fn deleting_twice_terminates_once_and_removes_the_row() {
        let h = Harness::ready().await;
        h.fake
            .script("server", FakeBehavior::runs_forever("serving"))
            .await;
        let tpl = h.create(template("server", "server", 60, 1)).await;
        let id = h.engine.submit(tpl.id, &"alice".into()).await.unwrap()[0];
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(h.status(id).await, TaskStatus::Running);

        let first = h.engine.request_deletion(id).await.unwrap();
        let second = h.engine.request_deletion(id).await.unwrap();
        assert_eq!(
            first,
            DeletionRequest::Marked {
                previous: TaskStatus::Running
            }
        );
        assert_eq!(second, DeletionRequest::AlreadyDeleting);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(matches!(
            h.engine.get_task(id).await,
            Err(EngineError::NotFound { .. })
        ));
        assert_eq!(h.fake.terminate_calls(&h.label(id)).await, 1);
        assert_eq!(h.fake.container_count().await, 0);

        // 削除済みの行への再要求は NotFound
        assert!(matches!(
            h.engine.request_deletion(id).await,
            Err(EngineError::NotFound { .. })
        ));
        assert_eq!(h.fake.terminate_calls(&h.label(id)).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deleting_a_finished_instance_only_cleans_up() {
        let h = Harness::ready().await;
        h.fake
            .script("quick", FakeBehavior::exits_after(Duration::from_secs(1), 0, "done"))
            .await;
        let tpl = h.create(template("quick", "quick", 60, 1)).await;
        let id = h.engine.submit(tpl.id, &"alice".into()).await.unwrap()[0];
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(h.status(id).await, TaskStatus::Succeeded);

        let request = h.engine.request_deletion(id).await.unwrap();
        assert_eq!(
            request,
            DeletionRequest::Terminal {
                status: TaskStatus::Succeeded
            }
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(h.engine.get_task(id).await.is_err());
        assert_eq!(h.fake.terminate_calls(&h.label(id)).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_orchestrator_leaves_an_orphan_record() {
        let h = Harness::ready().await;
        h.fake
            .script("stuck", FakeBehavior::runs_forever("last words"))
            .await;
        let tpl = h.create(template("stuck", "stuck", 60, 1)).await;
        let id = h.engine.submit(tpl.id, &"alice".into()).await.unwrap()[0];
        tokio::time::sleep(Duration::from_millis(500)).await;

        h.fake.fail_times(FakeOp::Terminate, 100).await;
        h.engine.request_deletion(id).await.unwrap();

        // terminate のリトライ中も保存済みログは読める
        tokio::time::sleep(Duration::from_millis(100)).await;
        let during = h.engine.task_log(id).await.unwrap();
        assert_eq!(during.text, "last words");
        assert_eq!(during.source, LogSource::Persisted);

        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(h.engine.get_task(id).await.is_err());
        let orphans = h.engine.orphans().await;
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].instance, id);
        assert_eq!(orphans[0].label, h.label(id));
        assert_eq!(orphans[0].last_log.as_deref(), Some("last words"));
        assert_eq!(
            h.fake.terminate_calls(&h.label(id)).await,
            h.engine.config().retry.max_attempts
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deletion_before_launch_completes_is_not_lost() {
        let h = Harness::ready().await;
        h.fake
            .script(
                "late",
                FakeBehavior::runs_forever("").with_startup(Duration::from_secs(2), Duration::from_secs(3)),
            )
            .await;
        let tpl = h.create(template("late", "late", 60, 1)).await;
        let id = h.engine.submit(tpl.id, &"alice".into()).await.unwrap()[0];

        h.engine.request_deletion(id).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(h.engine.get_task(id).await.is_err());
        assert_eq!(h.fake.container_count().await, 0);
    }
}
