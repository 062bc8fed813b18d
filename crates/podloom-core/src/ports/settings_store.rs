//! SettingsStore port - テンプレートの保存先

use async_trait::async_trait;

use crate::domain::{EngineError, PatchEffect, SettingsPatch, TaskSettings, TemplateId};

#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Fails with `DuplicateName` when another template already uses the name.
    async fn insert(&self, settings: TaskSettings) -> Result<(), EngineError>;

    async fn get(&self, id: TemplateId) -> Option<TaskSettings>;

    async fn list(&self) -> Vec<TaskSettings>;

    async fn update(
        &self,
        id: TemplateId,
        patch: &SettingsPatch,
    ) -> Result<(TaskSettings, PatchEffect), EngineError>;

    async fn remove(&self, id: TemplateId) -> Result<TaskSettings, EngineError>;
}
