//! 积分余额记录
//!
//! 每个用户一条，首次入账时创建，只由账本修改，永不删除。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::keys::IdempotencyKey;

/// 账本操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    /// 入账（成就奖励）
    Credit,
    /// 扣减（奖励兑换）
    Debit,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credit => "credit",
            Self::Debit => "debit",
        }
    }
}

/// 已应用到余额上的操作
///
/// 保存在余额记录的最近操作窗口中，用于识别重放
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedOperation {
    pub idempotency_key: String,
    pub kind: OperationKind,
    pub amount: u64,
    pub balance_after: u64,
    pub sequence: u64,
    pub applied_at: DateTime<Utc>,
}

/// 用户积分余额
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointBalance {
    pub user_id: String,
    pub balance: u64,
    /// 每应用一次操作加一
    pub sequence: u64,
    /// 最近已应用的操作，按 sequence 升序，超出窗口的最旧项被移除
    #[serde(default)]
    pub recent_operations: Vec<AppliedOperation>,
    pub updated_at: DateTime<Utc>,
}

impl PointBalance {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            balance: 0,
            sequence: 0,
            recent_operations: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// 查找窗口内已应用的同幂等键操作
    pub fn find_applied(&self, key: &IdempotencyKey) -> Option<&AppliedOperation> {
        self.recent_operations
            .iter()
            .rev()
            .find(|op| op.idempotency_key == key.as_str())
    }

    /// 是否有更早的操作已移出窗口
    pub fn has_evicted(&self) -> bool {
        self.sequence > self.recent_operations.len() as u64
    }

    /// 再应用一次操作时将被移出窗口的最旧操作
    pub fn evicted_on_next(&self, window: usize) -> &[AppliedOperation] {
        let overflow = (self.recent_operations.len() + 1).saturating_sub(window);
        &self.recent_operations[..overflow.min(self.recent_operations.len())]
    }

    /// 计算应用一次操作后的新余额记录
    ///
    /// 返回 None 表示扣减超过余额或入账溢出，调用方负责区分两种情况
    pub fn apply(
        &self,
        kind: OperationKind,
        amount: u64,
        key: &IdempotencyKey,
        window: usize,
    ) -> Option<(PointBalance, AppliedOperation)> {
        let balance_after = match kind {
            OperationKind::Credit => self.balance.checked_add(amount)?,
            OperationKind::Debit => self.balance.checked_sub(amount)?,
        };

        let now = Utc::now();
        let applied = AppliedOperation {
            idempotency_key: key.as_str().to_string(),
            kind,
            amount,
            balance_after,
            sequence: self.sequence + 1,
            applied_at: now,
        };

        let mut recent_operations = self.recent_operations.clone();
        recent_operations.push(applied.clone());
        if recent_operations.len() > window {
            let overflow = recent_operations.len() - window;
            recent_operations.drain(..overflow);
        }

        let next = PointBalance {
            user_id: self.user_id.clone(),
            balance: balance_after,
            sequence: applied.sequence,
            recent_operations,
            updated_at: now,
        };
        Some((next, applied))
    }
}

/// 积分流水
///
/// 只追加，最终可查询，不与余额实时对账
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointsHistoryEntry {
    pub user_id: String,
    pub idempotency_key: String,
    pub kind: OperationKind,
    pub amount: u64,
    pub balance_after: u64,
    pub sequence: u64,
    pub recorded_at: DateTime<Utc>,
}

impl PointsHistoryEntry {
    pub fn from_applied(user_id: &str, applied: &AppliedOperation) -> Self {
        Self {
            user_id: user_id.to_string(),
            idempotency_key: applied.idempotency_key.clone(),
            kind: applied.kind,
            amount: applied.amount,
            balance_after: applied.balance_after,
            sequence: applied.sequence,
            recorded_at: applied.applied_at,
        }
    }
}
