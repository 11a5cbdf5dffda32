//! 记录键与幂等键
//!
//! 所有分区名集中在这里生成，避免各服务各自拼接字符串。

use sha2::{Digest, Sha256};

use crate::error::{PointsError, Result};
use crate::store::RecordKey;

const MAX_ID_LEN: usize = 128;

/// 目录分区（只读，由外部运营系统维护）
pub const CATALOG_PARTITION: &str = "catalog";

pub fn balance_partition(user_id: &str) -> String {
    format!("balance#{}", user_id)
}

pub fn achievement_partition(user_id: &str) -> String {
    format!("achievement#{}", user_id)
}

pub fn redemption_partition(user_id: &str) -> String {
    format!("redemption#{}", user_id)
}

pub fn history_partition(user_id: &str) -> String {
    format!("history#{}", user_id)
}

/// 移出最近操作窗口的幂等键
pub fn applied_partition(user_id: &str) -> String {
    format!("applied#{}", user_id)
}

impl RecordKey {
    pub fn balance(user_id: &str) -> Self {
        Self::new(balance_partition(user_id), "current")
    }

    pub fn achievement(user_id: &str, achievement_id: &str) -> Self {
        Self::new(achievement_partition(user_id), achievement_id)
    }

    pub fn redemption(user_id: &str, request_id: &str) -> Self {
        Self::new(redemption_partition(user_id), request_id)
    }

    pub fn reward(reward_id: &str) -> Self {
        Self::new(CATALOG_PARTITION, reward_id)
    }

    /// 流水按序号补零排序，同一次应用的重放落在同一个键上
    pub fn history_entry(user_id: &str, sequence: u64) -> Self {
        Self::new(history_partition(user_id), format!("{:020}", sequence))
    }

    pub fn applied_marker(user_id: &str, idempotency_key: &str) -> Self {
        Self::new(applied_partition(user_id), idempotency_key)
    }
}

/// 账本幂等键
///
/// 成就与兑换使用不同前缀，两类键不会在同一个窗口里互相遮蔽
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// 由 (user_id, achievement_id) 确定性派生
    pub fn achievement(user_id: &str, achievement_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(user_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(achievement_id.as_bytes());
        Self(format!("achievement:{:x}", hasher.finalize()))
    }

    pub fn redemption(request_id: &str) -> Self {
        Self(format!("redeem:{}", request_id))
    }

    /// 外部调用方（如对账任务）自带的幂等键
    pub fn raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 校验调用边界传入的标识符
///
/// 标识符会成为存储键的一部分，只允许字母数字和 `-_.@`
pub fn validate_id(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(PointsError::Validation(format!("{} 不能为空", field)));
    }
    if value.len() > MAX_ID_LEN {
        return Err(PointsError::Validation(format!(
            "{} 长度超过 {}",
            field, MAX_ID_LEN
        )));
    }
    if let Some(c) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@')))
    {
        return Err(PointsError::Validation(format!(
            "{} 包含非法字符 {:?}",
            field, c
        )));
    }
    Ok(())
}
