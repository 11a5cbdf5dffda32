//! 成就记录
//!
//! 每个 (user_id, achievement_id) 至多一条。状态机：Pending -> Credited（终态）。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::keys::IdempotencyKey;

/// 成就记录状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AchievementStatus {
    /// 已登记，积分可能尚未入账
    #[default]
    Pending,
    /// 积分已入账
    Credited,
}

/// 成就完成记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AchievementRecord {
    pub user_id: String,
    pub achievement_id: String,
    pub points: u64,
    pub status: AchievementStatus,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credited_at: Option<DateTime<Utc>>,
}

impl AchievementRecord {
    pub fn pending(user_id: &str, achievement_id: &str, points: u64) -> Self {
        Self {
            user_id: user_id.to_string(),
            achievement_id: achievement_id.to_string(),
            points,
            status: AchievementStatus::Pending,
            idempotency_key: IdempotencyKey::achievement(user_id, achievement_id)
                .as_str()
                .to_string(),
            created_at: Utc::now(),
            credited_at: None,
        }
    }

    pub fn is_credited(&self) -> bool {
        self.status == AchievementStatus::Credited
    }

    /// Pending -> Credited
    pub fn into_credited(self) -> Self {
        Self {
            status: AchievementStatus::Credited,
            credited_at: Some(Utc::now()),
            ..self
        }
    }
}
