//! 奖励目录与兑换记录

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 奖励目录条目
///
/// 对积分核心只读，由外部运营系统维护
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardCatalogEntry {
    pub reward_id: String,
    /// 兑换所需积分
    pub cost: u64,
    /// 库存（None 表示不限量）
    #[serde(default)]
    pub stock: Option<u64>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl RewardCatalogEntry {
    pub fn new(reward_id: impl Into<String>, cost: u64) -> Self {
        Self {
            reward_id: reward_id.into(),
            cost,
            stock: None,
            active: true,
        }
    }

    pub fn with_stock(mut self, stock: u64) -> Self {
        self.stock = Some(stock);
        self
    }

    /// 检查是否有库存
    pub fn has_stock(&self) -> bool {
        match self.stock {
            Some(remaining) => remaining > 0,
            None => true, // 不限量
        }
    }

    /// 检查是否可兑换（上线且有库存）
    pub fn is_redeemable(&self) -> bool {
        self.active && self.has_stock()
    }
}

/// 兑换记录
///
/// 每个成功的兑换请求恰好一条，以 (user_id, request_id) 为键
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionRecord {
    pub user_id: String,
    pub request_id: String,
    pub reward_id: String,
    pub points_spent: u64,
    /// 扣减后的余额，重放时原样返回
    pub balance_after: u64,
    pub redeemed_at: DateTime<Utc>,
}
