//! podloom-core
//!
//! Task templates in, container lifecycles out.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, settings, status, task, errors）
//! - **ports**: 抽象化レイヤー（TaskRegistry, SettingsStore, Orchestrator, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（Engine, scheduler, monitor, cancellation）
//! - **impls**: 実装（in-memory の正本、FakeOrchestrator、Docker）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;

pub use app::{Engine, EngineBuilder, EngineConfig, EngineState};
