//! Task template (TaskSettings) and the launch spec derived from it.
//!
//! # 不変条件
//! - `name` は一意（SettingsStore 側で保証）
//! - `ttl_interval >= 1`（1 未満は 1 に丸める）
//! - `replica >= 1`（0 は拒否）
//! - `time_limit >= 1`
//!
//! インスタンスは作成時に `LaunchSpec` をコピーして持つので、
//! テンプレートを後から編集しても起動済みインスタンスには影響しません。

use byte_unit::Byte;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use super::ids::{TemplateId, UserId};

pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Validation failure for a template or a patch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("name must not be empty")]
    EmptyName,

    #[error("container image must not be empty")]
    EmptyImage,

    #[error("replica must be >= 1 (got {0})")]
    InvalidReplica(u32),

    #[error("time_limit must be >= 1 second")]
    InvalidTimeLimit,

    #[error("invalid memory limit {0:?}")]
    InvalidMemoryLimit(String),
}

/// Persistent volume mounted into every container of the template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentVolume {
    pub name: String,
    pub mount_path: String,
}

/// Container part of a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub image: String,
    #[serde(default)]
    pub persistent_volume: Option<PersistentVolume>,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub commands: Vec<String>,
    /// Human readable size such as `"128M"` or `"1Gi"`.
    #[serde(default)]
    pub memory_limit: Option<String>,
    #[serde(default)]
    pub working_path: Option<String>,
    #[serde(default)]
    pub task_script_path: Option<String>,
    #[serde(default)]
    pub task_initial_file_path: Option<String>,
}

fn default_shell() -> String {
    DEFAULT_SHELL.to_string()
}

impl ContainerConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            persistent_volume: None,
            shell: default_shell(),
            commands: Vec::new(),
            memory_limit: None,
            working_path: None,
            task_script_path: None,
            task_initial_file_path: None,
        }
    }

    /// Memory limit in bytes, if one is configured.
    pub fn memory_limit_bytes(&self) -> Result<Option<u64>, SettingsError> {
        let Some(raw) = self.memory_limit.as_deref() else {
            return Ok(None);
        };
        let byte = Byte::parse_str(raw.trim(), true)
            .map_err(|_| SettingsError::InvalidMemoryLimit(raw.to_string()))?;
        match byte.as_u64() {
            0 => Err(SettingsError::InvalidMemoryLimit(raw.to_string())),
            bytes => Ok(Some(bytes)),
        }
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.image.trim().is_empty() {
            return Err(SettingsError::EmptyImage);
        }
        self.memory_limit_bytes()?;
        Ok(())
    }
}

/// Creation request for a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSettings {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub container_config: ContainerConfig,
    pub time_limit: u64,
    #[serde(default = "one")]
    pub replica: u32,
    #[serde(default = "one_u64")]
    pub ttl_interval: u64,
    #[serde(default = "one")]
    pub max_sharing_users: u32,
}

fn one() -> u32 {
    1
}

fn one_u64() -> u64 {
    1
}

/// Task template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSettings {
    pub id: TemplateId,
    pub name: String,
    pub description: String,
    pub container_config: ContainerConfig,
    /// Seconds an instance may stay RUNNING.
    pub time_limit: u64,
    /// Containers launched per scheduling event.
    pub replica: u32,
    /// Seconds between health probes.
    pub ttl_interval: u64,
    /// Distinct users that may hold non-terminal instances at once.
    pub max_sharing_users: u32,
    pub create_time: DateTime<Utc>,
}

impl TaskSettings {
    pub fn new(
        id: TemplateId,
        request: NewSettings,
        create_time: DateTime<Utc>,
    ) -> Result<Self, SettingsError> {
        let settings = Self {
            id,
            name: request.name,
            description: request.description,
            container_config: request.container_config,
            time_limit: request.time_limit,
            replica: request.replica,
            ttl_interval: request.ttl_interval.max(1),
            max_sharing_users: request.max_sharing_users,
            create_time,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.name.trim().is_empty() {
            return Err(SettingsError::EmptyName);
        }
        if self.replica < 1 {
            return Err(SettingsError::InvalidReplica(self.replica));
        }
        if self.time_limit < 1 {
            return Err(SettingsError::InvalidTimeLimit);
        }
        self.container_config.validate()
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.ttl_interval.max(1))
    }

    /// Snapshot handed to the orchestrator for one instance owned by `user`.
    pub fn launch_spec(&self, user: &UserId) -> Result<LaunchSpec, SettingsError> {
        let config = &self.container_config;
        Ok(LaunchSpec {
            image: config.image.clone(),
            shell: config.shell.clone(),
            commands: config.commands.clone(),
            working_dir: config.working_path.clone(),
            memory_limit_bytes: config.memory_limit_bytes()?,
            volume: config.persistent_volume.clone(),
            time_limit: Duration::from_secs(self.time_limit),
            script_path: config.task_script_path.clone(),
            initial_file_path: config.task_initial_file_path.clone(),
            user: user.clone(),
        })
    }
}

/// Partial update of a template. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub container_config: Option<ContainerConfig>,
    pub time_limit: Option<u64>,
    pub replica: Option<u32>,
    pub ttl_interval: Option<u64>,
    pub max_sharing_users: Option<u32>,
}

/// What changed after applying a patch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchEffect {
    pub ttl_changed: bool,
}

impl SettingsPatch {
    /// Applies the patch to a copy and validates the result before committing.
    pub fn apply(&self, settings: &mut TaskSettings) -> Result<PatchEffect, SettingsError> {
        let mut next = settings.clone();
        if let Some(name) = &self.name {
            next.name = name.clone();
        }
        if let Some(description) = &self.description {
            next.description = description.clone();
        }
        if let Some(config) = &self.container_config {
            next.container_config = config.clone();
        }
        if let Some(time_limit) = self.time_limit {
            next.time_limit = time_limit;
        }
        if let Some(replica) = self.replica {
            next.replica = replica;
        }
        if let Some(ttl) = self.ttl_interval {
            next.ttl_interval = ttl.max(1);
        }
        if let Some(max) = self.max_sharing_users {
            next.max_sharing_users = max;
        }
        next.validate()?;

        let effect = PatchEffect {
            ttl_changed: next.ttl_interval != settings.ttl_interval,
        };
        *settings = next;
        Ok(effect)
    }
}

/// Everything the orchestrator needs to start one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub image: String,
    pub shell: String,
    pub commands: Vec<String>,
    pub working_dir: Option<String>,
    pub memory_limit_bytes: Option<u64>,
    pub volume: Option<PersistentVolume>,
    pub time_limit: Duration,
    pub script_path: Option<String>,
    pub initial_file_path: Option<String>,
    /// Owner of the instance, exported as `CLOUD_SCHEDULER_USER`.
    pub user: UserId,
}

pub const ENV_USER: &str = "CLOUD_SCHEDULER_USER";
pub const ENV_SCRIPT_PATH: &str = "TASK_SCRIPT_PATH";
pub const ENV_INITIAL_FILE_PATH: &str = "TASK_INITIAL_FILE_PATH";

impl LaunchSpec {
    /// `KEY=value` pairs for the container environment. Unset paths are omitted.
    pub fn env(&self) -> Vec<String> {
        let mut env = vec![format!("{ENV_USER}={}", self.user)];
        if let Some(path) = &self.script_path {
            env.push(format!("{ENV_SCRIPT_PATH}={path}"));
        }
        if let Some(path) = &self.initial_file_path {
            env.push(format!("{ENV_INITIAL_FILE_PATH}={path}"));
        }
        env
    }

    /// `[shell, "-c", "cmd1 && cmd2"]`
    pub fn command_line(&self) -> Vec<String> {
        if self.commands.is_empty() {
            return Vec::new();
        }
        vec![
            self.shell.clone(),
            "-c".to_string(),
            self.commands.join(" && "),
        ]
    }
}
