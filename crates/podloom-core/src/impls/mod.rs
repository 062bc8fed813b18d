//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryRegistry** / **InMemorySettingsStore**: プロセス内の正本（開発・テスト用）
//! - **FakeOrchestrator**: 仮想時間で動くスクリプト式 orchestrator
//! - **DockerOrchestrator**: bollard 経由の Docker 実装（`docker` feature）

#[cfg(feature = "docker")]
pub mod docker;
pub mod fake_orchestrator;
pub mod inmem_registry;
pub mod inmem_settings;

#[cfg(feature = "docker")]
pub use self::docker::DockerOrchestrator;
pub use self::fake_orchestrator::{FakeBehavior, FakeOp, FakeOrchestrator};
pub use self::inmem_registry::InMemoryRegistry;
pub use self::inmem_settings::InMemorySettingsStore;
