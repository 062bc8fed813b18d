//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」です。エンジンはここの trait だけに依存し、
//! 実装（in-memory, Docker）は impls に置きます。
//!
//! # 設計原則
//! - TaskRegistry がインスタンス状態の正本
//! - Orchestrator は label で引くだけの薄い契約（リトライは app 側）

pub mod clock;
pub mod id_generator;
pub mod orchestrator;
pub mod registry;
pub mod settings_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::orchestrator::{
    ContainerHandle, ContainerPhase, ContainerState, Label, Orchestrator, OrchestratorError,
};
pub use self::registry::{DeletionRequest, TaskRegistry};
pub use self::settings_store::SettingsStore;
