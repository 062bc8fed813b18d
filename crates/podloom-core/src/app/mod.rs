//! App - アプリケーション層
//!
//! ports を組み合わせてスケジューリングとライフサイクル管理を実装します。
//!
//! # 主要コンポーネント
//! - **EngineBuilder**: エンジンの構築とワイヤリング
//! - **Engine**: 公開 API（テンプレート CRUD、submit、削除、ログ、集計）
//! - **scheduler**: 受付判定とインスタンスの起動
//! - **monitor**: インスタンスごとの probe ループ
//! - **cancellation**: DELETING 行の後始末
//! - **supervisor**: バックグラウンドタスクの重複排除と panic の記録

pub mod builder;
pub mod cancellation;
pub mod config;
mod context;
pub mod engine;
mod monitor;
pub mod retry;
mod scheduler;
pub mod status;
mod supervisor;

pub use self::builder::{BuildError, EngineBuilder};
pub use self::cancellation::Orphan;
pub use self::config::{ConfigError, EngineConfig, LIVE_LOG_PLACEHOLDER};
pub use self::engine::{Engine, EngineState, LogSource, TaskLog};
pub use self::retry::RetryPolicy;
pub use self::status::StatusCounts;
