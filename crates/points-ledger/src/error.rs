//! 积分核心错误类型
//!
//! 区分三类错误：业务拒绝（不重试）、瞬时故障（调用方可整体重放）、内部错误

use thiserror::Error;

use crate::store::StoreError;

/// 积分核心错误类型
#[derive(Debug, Error)]
pub enum PointsError {
    // === 业务错误 ===
    #[error("积分余额不足: user_id={user_id}, 需要 {required}, 可用 {available}")]
    InsufficientBalance {
        user_id: String,
        required: u64,
        available: u64,
    },

    #[error("奖励不存在: {0}")]
    RewardNotFound(String),

    #[error("奖励不可兑换（已下线或库存为零）: {0}")]
    RewardUnavailable(String),

    #[error("参数校验失败: {0}")]
    Validation(String),

    // === 瞬时错误 ===
    #[error("并发冲突重试次数耗尽: user_id={user_id}, attempts={attempts}")]
    RetryExhausted { user_id: String, attempts: u32 },

    #[error("存储不可用: {0}")]
    StoreUnavailable(String),

    #[error("调用已取消或超时")]
    Cancelled,

    // === 系统错误 ===
    #[error("存储返回了意外结果: {0}")]
    Store(StoreError),

    #[error("JSON 序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 积分核心 Result 类型别名
pub type Result<T> = std::result::Result<T, PointsError>;

impl From<StoreError> for PointsError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(message) => Self::StoreUnavailable(message),
            other => Self::Store(other),
        }
    }
}

impl PointsError {
    /// 检查是否为可重试的错误
    ///
    /// 调用方可以用相同的幂等键重放整个请求
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. } | Self::StoreUnavailable(_))
    }

    /// 检查是否为业务错误（终态拒绝，重试不会改变结果）
    pub fn is_business_error(&self) -> bool {
        matches!(
            self,
            Self::InsufficientBalance { .. }
                | Self::RewardNotFound(_)
                | Self::RewardUnavailable(_)
                | Self::Validation(_)
        )
    }

    /// 获取错误码（用于 API / CLI 输出）
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            Self::RewardNotFound(_) => "REWARD_NOT_FOUND",
            Self::RewardUnavailable(_) => "REWARD_UNAVAILABLE",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::Cancelled => "CANCELLED",
            Self::Store(_) => "STORE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}
