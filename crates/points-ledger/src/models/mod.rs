//! 积分核心领域模型
//!
//! 三类独立键控的持久化记录（积分余额、成就记录、兑换记录），
//! 以及只读的奖励目录条目和积分流水。

pub mod achievement;
pub mod balance;
pub mod keys;
pub mod reward;

pub use achievement::{AchievementRecord, AchievementStatus};
pub use balance::{AppliedOperation, OperationKind, PointBalance, PointsHistoryEntry};
pub use keys::{IdempotencyKey, validate_id};
pub use reward::{RedemptionRecord, RewardCatalogEntry};
