//! Shared state of a running engine.
//!
//! scheduler / monitor / cancellation はすべて `Arc<EngineContext>` を受け取ります。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::cancellation::Orphan;
use super::config::EngineConfig;
use super::supervisor::Supervisor;
use crate::domain::{InstanceId, TaskSettings, TemplateId};
use crate::ports::{Clock, IdGenerator, Label, Orchestrator, SettingsStore, TaskRegistry};

/// Probe cadence used when a template can no longer be read.
const FALLBACK_CADENCE: Duration = Duration::from_secs(1);

pub(crate) struct EngineContext {
    pub(crate) registry: Arc<dyn TaskRegistry>,
    pub(crate) settings: Arc<dyn SettingsStore>,
    pub(crate) orchestrator: Arc<dyn Orchestrator>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) config: EngineConfig,
    pub(crate) monitors: Supervisor,
    pub(crate) cancellations: Supervisor,
    pub(crate) tracker: TaskTracker,
    pub(crate) shutdown: CancellationToken,
    /// Serializes admission against template deletion.
    pub(crate) catalog: Mutex<()>,
    /// Per-template probe interval; monitors hold the receivers.
    cadences: Mutex<HashMap<TemplateId, watch::Sender<Duration>>>,
    orphans: Mutex<Vec<Orphan>>,
}

impl EngineContext {
    pub(crate) fn new(
        registry: Arc<dyn TaskRegistry>,
        settings: Arc<dyn SettingsStore>,
        orchestrator: Arc<dyn Orchestrator>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        config: EngineConfig,
    ) -> Self {
        let tracker = TaskTracker::new();
        Self {
            registry,
            settings,
            orchestrator,
            clock,
            ids,
            config,
            monitors: Supervisor::new("monitor", tracker.clone()),
            cancellations: Supervisor::new("cancellation", tracker.clone()),
            tracker,
            shutdown: CancellationToken::new(),
            catalog: Mutex::new(()),
            cadences: Mutex::new(HashMap::new()),
            orphans: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn label(&self, id: InstanceId) -> Label {
        Label::for_instance(&self.config.label_key, id)
    }

    pub(crate) fn label_for(&self, value: &str) -> Label {
        Label::new(&self.config.label_key, value)
    }

    /// Subscribes to the probe cadence of a template.
    pub(crate) async fn cadence_for(&self, settings_id: TemplateId) -> watch::Receiver<Duration> {
        let mut cadences = self.cadences.lock().await;
        if let Some(tx) = cadences.get(&settings_id) {
            return tx.subscribe();
        }
        let interval = self
            .settings
            .get(settings_id)
            .await
            .map(|s| s.probe_interval())
            .unwrap_or(FALLBACK_CADENCE);
        let (tx, rx) = watch::channel(interval);
        cadences.insert(settings_id, tx);
        rx
    }

    /// Publishes the template's current `ttl_interval` to its monitors.
    pub(crate) async fn set_cadence(&self, settings: &TaskSettings) {
        let interval = settings.probe_interval();
        let mut cadences = self.cadences.lock().await;
        match cadences.get(&settings.id) {
            Some(tx) => {
                tx.send_if_modified(|current| {
                    let changed = *current != interval;
                    *current = interval;
                    changed
                });
            }
            None => {
                cadences.insert(settings.id, watch::channel(interval).0);
            }
        }
    }

    pub(crate) async fn forget_cadence(&self, settings_id: TemplateId) {
        self.cadences.lock().await.remove(&settings_id);
    }

    pub(crate) async fn record_orphan(&self, orphan: Orphan) {
        self.orphans.lock().await.push(orphan);
    }

    pub(crate) async fn orphans(&self) -> Vec<Orphan> {
        self.orphans.lock().await.clone()
    }
}
