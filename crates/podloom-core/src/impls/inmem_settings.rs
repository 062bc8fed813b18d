//! In-memory SettingsStore implementation.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{EngineError, PatchEffect, SettingsPatch, TaskSettings, TemplateId};
use crate::ports::SettingsStore;

#[derive(Clone, Default)]
pub struct InMemorySettingsStore {
    templates: Arc<Mutex<BTreeMap<TemplateId, TaskSettings>>>,
}

impl InMemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn name_taken(
    templates: &BTreeMap<TemplateId, TaskSettings>,
    name: &str,
    except: Option<TemplateId>,
) -> bool {
    templates
        .values()
        .any(|t| t.name == name && Some(t.id) != except)
}

#[async_trait]
impl SettingsStore for InMemorySettingsStore {
    async fn insert(&self, settings: TaskSettings) -> Result<(), EngineError> {
        let mut templates = self.templates.lock().await;
        if name_taken(&templates, &settings.name, None) {
            return Err(EngineError::DuplicateName(settings.name));
        }
        templates.insert(settings.id, settings);
        Ok(())
    }

    async fn get(&self, id: TemplateId) -> Option<TaskSettings> {
        self.templates.lock().await.get(&id).cloned()
    }

    async fn list(&self) -> Vec<TaskSettings> {
        self.templates.lock().await.values().cloned().collect()
    }

    async fn update(
        &self,
        id: TemplateId,
        patch: &SettingsPatch,
    ) -> Result<(TaskSettings, PatchEffect), EngineError> {
        let mut templates = self.templates.lock().await;
        if let Some(name) = &patch.name
            && name_taken(&templates, name, Some(id))
        {
            return Err(EngineError::DuplicateName(name.clone()));
        }
        let settings = templates
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found("task settings", id))?;
        let effect = patch.apply(settings)?;
        Ok((settings.clone(), effect))
    }

    async fn remove(&self, id: TemplateId) -> Result<TaskSettings, EngineError> {
        self.templates
            .lock()
            .await
            .remove(&id)
            .ok_or_else(|| EngineError::not_found("task settings", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::settings::fixtures::new_settings;
    use chrono::Utc;
    use ulid::Ulid;

    fn settings(name: &str) -> TaskSettings {
        TaskSettings::new(
            TemplateId::from_ulid(Ulid::new()),
            new_settings(name, "alpine"),
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn names_are_unique() {
        let store = InMemorySettingsStore::new();
        store.insert(settings("judge")).await.unwrap();
        let err = store.insert(settings("judge")).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateName(name) if name == "judge"));
    }

    #[tokio::test]
    async fn rename_to_existing_name_is_rejected() {
        let store = InMemorySettingsStore::new();
        let a = settings("a");
        let a_id = a.id;
        store.insert(a).await.unwrap();
        store.insert(settings("b")).await.unwrap();

        let patch = SettingsPatch {
            name: Some("b".into()),
            ..Default::default()
        };
        assert!(matches!(
            store.update(a_id, &patch).await,
            Err(EngineError::DuplicateName(_))
        ));

        // 自分自身の名前への変更は許す
        let patch = SettingsPatch {
            name: Some("a".into()),
            ..Default::default()
        };
        store.update(a_id, &patch).await.unwrap();
    }

    #[tokio::test]
    async fn missing_template_is_not_found() {
        let store = InMemorySettingsStore::new();
        let id = TemplateId::from_ulid(Ulid::new());
        assert!(matches!(
            store.remove(id).await,
            Err(EngineError::NotFound { resource: "task settings", .. })
        ));
    }
}
