//! 积分账本一致性核心
//!
//! 用户完成成就获得积分，用积分兑换奖励。服务以多个无状态副本运行，
//! 唯一的共享可变状态是存储中每个用户的余额记录。
//!
//! ## 核心保证
//!
//! - **守恒**：余额等于已应用入账之和减去已应用扣减之和
//! - **非负**：扣减不会让余额低于 0
//! - **恰好一次**：同一成就、同一兑换请求的重放不会重复变更余额
//!
//! ## 模块结构
//!
//! - `store`: 键值存储能力接口与内存 / Redis 实现
//! - `models`: 领域模型与键生成
//! - `ledger`: 乐观并发的积分账本
//! - `service`: 成就入账与奖励兑换服务
//! - `context`: 调用上下文（截止时间与取消）
//! - `error`: 错误类型定义

pub mod context;
pub mod error;
pub mod ledger;
pub mod models;
pub mod service;
pub mod store;

pub use context::CallContext;
pub use error::{PointsError, Result};
pub use ledger::{LedgerOutcome, PointLedger};
pub use models::*;
pub use service::{
    AchievementService, CompletionOutcome, RedemptionOutcome, RewardCatalog, RewardService,
    StoreRewardCatalog,
};
pub use store::{KvStore, MemoryStore, RecordKey, RedisStore, StoreError, Versioned};
