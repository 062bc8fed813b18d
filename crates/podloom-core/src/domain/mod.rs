//! Domain - ドメインモデル
//!
//! - **ids**: TemplateId / InstanceId / UserId
//! - **settings**: TaskSettings（テンプレート）と LaunchSpec
//! - **status**: TaskStatus と遷移表
//! - **task**: TaskInstance（registry の行）
//! - **errors**: EngineError / TransitionError

pub mod errors;
pub mod ids;
pub mod settings;
pub mod status;
pub mod task;

pub use self::errors::{EngineError, TransitionError};
pub use self::ids::{Id, IdMarker, InstanceId, TemplateId, UserId};
pub use self::settings::{
    ContainerConfig, LaunchSpec, NewSettings, PatchEffect, PersistentVolume, SettingsError,
    SettingsPatch, TaskSettings,
};
pub use self::status::TaskStatus;
pub use self::task::{TaskInstance, TransitionUpdate};
