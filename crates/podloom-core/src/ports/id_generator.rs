//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use crate::domain::ids::{InstanceId, TemplateId};
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator はテンプレートとインスタンスの ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（各 monitor task から共有される）
pub trait IdGenerator: Send + Sync {
    fn generate_template_id(&self) -> TemplateId;

    fn generate_instance_id(&self) -> InstanceId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// timestamp 部分は Clock から取るので、FixedClock を渡せば決定的になります。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_template_id(&self) -> TemplateId {
        TemplateId::from(self.next_ulid())
    }

    fn generate_instance_id(&self) -> InstanceId {
        InstanceId::from(self.next_ulid())
    }
}
