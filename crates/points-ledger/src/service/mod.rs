//! 业务服务层
//!
//! 成就入账与奖励兑换都建立在 [`crate::ledger::PointLedger`] 的幂等操作之上。

mod achievement_service;
mod catalog;
mod reward_service;

pub use achievement_service::{AchievementService, CompletionOutcome};
pub use catalog::{RewardCatalog, StoreRewardCatalog};
pub use reward_service::{RedemptionOutcome, RewardService};
