//! Scheduler - テンプレートを起動要求に変換する
//!
//! # 流れ
//! 1. 受付判定（sharing quota）と `replica` 行の挿入を registry で原子的に行う
//! 2. 各行ごとに monitor を起動し、monitor の最初のステップでコンテナを launch する
//!
//! 同じテンプレートに対する再スケジュール（`reconcile_template`）は既存インスタンスを
//! 複製せず、probe 間隔の更新と未起動行の launch だけを行います。

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error, info, instrument, warn};

use super::cancellation;
use super::context::EngineContext;
use super::monitor::{self, Start};
use super::retry::retry;
use crate::domain::{
    EngineError, InstanceId, LaunchSpec, TaskInstance, TaskSettings, TaskStatus, TemplateId,
    TransitionError, TransitionUpdate, UserId,
};

/// Admits `user` to the template and schedules `replica` instances.
#[instrument(skip(ctx), fields(template = %settings_id, user = %user))]
pub(crate) async fn submit(
    ctx: &Arc<EngineContext>,
    settings_id: TemplateId,
    user: &UserId,
) -> Result<Vec<InstanceId>, EngineError> {
    let ids = {
        let _catalog = ctx.catalog.lock().await;
        let settings = ctx
            .settings
            .get(settings_id)
            .await
            .ok_or_else(|| EngineError::not_found("task settings", settings_id))?;
        settings.validate()?;
        let spec = settings.launch_spec(user)?;

        let now = ctx.clock.now();
        let rows = (0..settings.replica)
            .map(|_| {
                TaskInstance::scheduled(
                    ctx.ids.generate_instance_id(),
                    user.clone(),
                    settings.id,
                    spec.clone(),
                    now,
                )
            })
            .collect();

        match ctx.registry.admit_and_insert(&settings, user, rows).await {
            Ok(ids) => ids,
            Err(err @ EngineError::AdmissionDenied { .. }) => {
                info!(error = %err, "admission denied");
                return Err(err);
            }
            Err(err) => return Err(err),
        }
    };

    for &id in &ids {
        monitor::spawn(ctx, id, Start::Launch).await;
    }
    info!(instances = ids.len(), "instances scheduled");
    Ok(ids)
}

/// Launches the container of a SCHEDULED row. On exhausted retries the row becomes FAILED.
pub(crate) async fn launch(ctx: &Arc<EngineContext>, id: InstanceId, spec: &LaunchSpec) -> bool {
    match ctx.registry.get(id).await.map(|row| row.status) {
        Some(TaskStatus::Scheduled) => {}
        Some(TaskStatus::Deleting) => {
            cancellation::spawn(ctx, id).await;
            return false;
        }
        _ => return false,
    }

    let label = ctx.label(id);
    let launched = retry(&ctx.config.retry, "launch", || {
        ctx.orchestrator.launch(spec, &label)
    })
    .await;

    match launched {
        Ok(handle) => {
            debug!(instance = %id, container = %handle, label = %label, "container launched");
            match ctx.registry.get(id).await.map(|row| row.status) {
                Some(TaskStatus::Deleting) | None => {
                    // 起動中に削除された: cancellation が見逃したかもしれないので自分で止める
                    debug!(instance = %id, "deleted while launching; tearing down");
                    if let Err(err) = retry(&ctx.config.retry, "terminate", || {
                        ctx.orchestrator.terminate(&label)
                    })
                    .await
                    {
                        warn!(instance = %id, error = %err, "could not tear down container");
                    }
                    false
                }
                _ => true,
            }
        }
        Err(err) => {
            error!(instance = %id, error = %err, "container launch failed");
            let log = format!("failed to launch container: {err}");
            match ctx
                .registry
                .transition(
                    id,
                    TaskStatus::Scheduled,
                    TaskStatus::Failed,
                    TransitionUpdate::finished(None, log),
                )
                .await
            {
                Ok(_) => {}
                Err(TransitionError::Conflict {
                    actual: TaskStatus::Deleting,
                    ..
                }) => {
                    cancellation::spawn(ctx, id).await;
                }
                Err(err) => warn!(instance = %id, error = %err, "could not record launch failure"),
            }
            false
        }
    }
}

/// Picks up a registry row that has no live task attached to it.
pub(crate) async fn adopt(ctx: &Arc<EngineContext>, row: &TaskInstance) {
    match row.status {
        TaskStatus::Deleting => {
            cancellation::spawn(ctx, row.id).await;
        }
        status if status.is_terminal() => {}
        TaskStatus::Scheduled => {
            monitor::spawn(ctx, row.id, Start::LaunchIfMissing).await;
        }
        _ => {
            monitor::spawn(ctx, row.id, Start::Observe).await;
        }
    }
}

/// Reschedules a template: publishes its probe cadence and adopts unattended rows.
///
/// Returns the template's active instances.
#[instrument(skip(ctx, settings), fields(template = %settings.id))]
pub(crate) async fn reconcile_template(
    ctx: &Arc<EngineContext>,
    settings: &TaskSettings,
) -> Vec<InstanceId> {
    ctx.set_cadence(settings).await;

    let rows: Vec<TaskInstance> = ctx
        .registry
        .list_by_settings(settings.id)
        .await
        .into_iter()
        .filter(|row| !row.is_terminal())
        .collect();
    join_all(rows.iter().map(|row| adopt(ctx, row))).await;

    let active: Vec<InstanceId> = rows
        .iter()
        .filter(|row| row.status.is_active())
        .map(|row| row.id)
        .collect();
    debug!(
        active = active.len(),
        ttl_interval = settings.ttl_interval,
        "template rescheduled"
    );
    active
}
