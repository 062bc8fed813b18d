//! EngineBuilder - エンジンの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - registry / settings store / orchestrator は必須
//! - 足りないポートは build() 時にまとめて BuildError で返す
//! - clock / id generator は省略すると SystemClock / UlidGenerator を使う

use std::sync::Arc;

use super::config::EngineConfig;
use super::engine::Engine;
use crate::ports::{
    Clock, IdGenerator, Orchestrator, SettingsStore, SystemClock, TaskRegistry, UlidGenerator,
};

/// # 使用例
/// ```ignore
/// let engine = EngineBuilder::new()
///     .registry(InMemoryRegistry::new())
///     .settings_store(InMemorySettingsStore::new())
///     .orchestrator(FakeOrchestrator::new())
///     .build()?;
/// engine.start().await?;
/// ```
#[derive(Default)]
pub struct EngineBuilder {
    registry: Option<Arc<dyn TaskRegistry>>,
    settings: Option<Arc<dyn SettingsStore>>,
    orchestrator: Option<Arc<dyn Orchestrator>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    config: EngineConfig,
}

/// BuildError はエンジン構築時のエラー
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("Missing ports: {0:?}. These must be provided before build().")]
    MissingPorts(Vec<&'static str>),
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(mut self, registry: impl TaskRegistry + 'static) -> Self {
        self.registry = Some(Arc::new(registry));
        self
    }

    pub fn settings_store(mut self, store: impl SettingsStore + 'static) -> Self {
        self.settings = Some(Arc::new(store));
        self
    }

    pub fn orchestrator(mut self, orchestrator: impl Orchestrator + 'static) -> Self {
        self.orchestrator = Some(Arc::new(orchestrator));
        self
    }

    pub fn shared_orchestrator(mut self, orchestrator: Arc<dyn Orchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Some(Arc::new(ids));
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Engine, BuildError> {
        let mut missing = Vec::new();
        if self.registry.is_none() {
            missing.push("registry");
        }
        if self.settings.is_none() {
            missing.push("settings_store");
        }
        if self.orchestrator.is_none() {
            missing.push("orchestrator");
        }
        let (Some(registry), Some(settings), Some(orchestrator)) =
            (self.registry, self.settings, self.orchestrator)
        else {
            return Err(BuildError::MissingPorts(missing));
        };

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));
        Ok(Engine::new(
            registry,
            settings,
            orchestrator,
            clock,
            ids,
            self.config,
        ))
    }
}
