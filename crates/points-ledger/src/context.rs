//! 调用上下文
//!
//! 携带截止时间与取消标记。重试循环在发出下一次存储调用前检查上下文，
//! 已发出的条件写入允许完成，取消只会阻止后续重试。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{PointsError, Result};

/// 调用上下文
///
/// 克隆后共享同一个取消标记
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl CallContext {
    /// 无截止时间的上下文
    pub fn background() -> Self {
        Self::default()
    }

    /// 从现在起 timeout 后到期的上下文
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// 已取消或已过截止时间
    pub fn is_done(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// 在下一次存储调用前检查
    pub fn check(&self) -> Result<()> {
        if self.is_done() {
            Err(PointsError::Cancelled)
        } else {
            Ok(())
        }
    }
}
