//! 奖励兑换服务
//!
//! ## 兑换流程
//!
//! 1. 已有兑换记录 -> 直接返回（重放）
//! 2. 查询奖励目录，不存在返回 `RewardNotFound`
//! 3. 以 `redeem:{request_id}` 为幂等键扣减积分
//! 4. 条件写入兑换记录，已存在视为成功
//!
//! 扣减自身的幂等性保证不会重复扣分，兑换记录只是持久化凭证，不参与正确性判断。

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::TryStreamExt;
use tracing::{info, instrument, warn};

use points_shared::observability::metrics::record_redemption;

use crate::context::CallContext;
use crate::error::{PointsError, Result};
use crate::ledger::PointLedger;
use crate::models::keys::{redemption_partition, validate_id};
use crate::models::{IdempotencyKey, RedemptionRecord};
use crate::service::catalog::RewardCatalog;
use crate::store::{KvStore, RecordKey, StoreError, StoredRecord};

/// 兑换结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedemptionOutcome {
    pub record: RedemptionRecord,
    /// 是否为已完成请求的重放
    pub replayed: bool,
}

/// 奖励兑换服务
pub struct RewardService<S, C>
where
    S: KvStore,
    C: RewardCatalog,
{
    store: Arc<S>,
    ledger: Arc<PointLedger<S>>,
    catalog: Arc<C>,
}

impl<S, C> RewardService<S, C>
where
    S: KvStore,
    C: RewardCatalog,
{
    pub fn new(store: Arc<S>, ledger: Arc<PointLedger<S>>, catalog: Arc<C>) -> Self {
        Self {
            store,
            ledger,
            catalog,
        }
    }

    /// 兑换奖励
    ///
    /// 同一 request_id 的重复调用返回首次兑换的记录，不会重复扣分
    #[instrument(skip(self, ctx), fields(user_id = %user_id, reward_id = %reward_id, request_id = %request_id))]
    pub async fn redeem(
        &self,
        ctx: &CallContext,
        user_id: &str,
        reward_id: &str,
        request_id: &str,
    ) -> Result<RedemptionOutcome> {
        let start = Instant::now();
        let result = self.execute_redemption(ctx, user_id, reward_id, request_id).await;

        let outcome_label = match &result {
            Ok(outcome) if outcome.replayed => "replayed".to_string(),
            Ok(_) => "redeemed".to_string(),
            Err(err) => err.error_code().to_ascii_lowercase(),
        };
        record_redemption(&outcome_label, start.elapsed().as_secs_f64());
        result
    }

    /// 查询用户兑换历史，最新的在前
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn list_redemption_history(&self, user_id: &str) -> Result<Vec<RedemptionRecord>> {
        let records: Vec<StoredRecord> = self
            .store
            .query_partition(&redemption_partition(user_id))
            .await?
            .try_collect()
            .await?;

        let mut history = records
            .into_iter()
            .map(|record| record.decode::<RedemptionRecord>().map(|v| v.value))
            .collect::<serde_json::Result<Vec<_>>>()?;
        history.sort_by(|a, b| {
            b.redeemed_at
                .cmp(&a.redeemed_at)
                .then_with(|| b.request_id.cmp(&a.request_id))
        });
        Ok(history)
    }

    // ==================== 私有方法 ====================

    async fn execute_redemption(
        &self,
        ctx: &CallContext,
        user_id: &str,
        reward_id: &str,
        request_id: &str,
    ) -> Result<RedemptionOutcome> {
        validate_id("user_id", user_id)?;
        validate_id("reward_id", reward_id)?;
        validate_id("request_id", request_id)?;

        let record_key = RecordKey::redemption(user_id, request_id);

        // 1. 重放检查
        ctx.check()?;
        if let Some(record) = self.find_record(&record_key).await? {
            if record.reward_id != reward_id {
                warn!(
                    recorded_reward_id = %record.reward_id,
                    "request_id 被不同奖励重用，返回首次兑换的记录"
                );
            }
            info!("兑换请求已完成，返回已有记录");
            return Ok(RedemptionOutcome {
                record,
                replayed: true,
            });
        }

        // 2. 目录查询
        ctx.check()?;
        let entry = self
            .catalog
            .get_reward(reward_id)
            .await?
            .ok_or_else(|| PointsError::RewardNotFound(reward_id.to_string()))?;

        let idempotency_key = IdempotencyKey::redemption(request_id);
        if !entry.is_redeemable() {
            // 此前的尝试已扣减但未落记录时，继续完成兑换
            ctx.check()?;
            if self
                .ledger
                .find_applied(user_id, &idempotency_key)
                .await?
                .is_none()
            {
                return Err(PointsError::RewardUnavailable(reward_id.to_string()));
            }
            info!("奖励已不可兑换，但本请求的扣减已生效，继续完成兑换");
        }

        // 3. 扣减
        let outcome = self
            .ledger
            .debit(ctx, user_id, entry.cost, &idempotency_key)
            .await?;

        // 4. 兑换记录（扣减已落地，不再检查取消）
        // 重放时目录价格可能已变，花费以账本实际扣减的数额为准
        let record = RedemptionRecord {
            user_id: user_id.to_string(),
            request_id: request_id.to_string(),
            reward_id: reward_id.to_string(),
            points_spent: outcome.amount,
            balance_after: outcome.balance,
            redeemed_at: Utc::now(),
        };

        match self
            .store
            .put_if_absent(&record_key, serde_json::to_value(&record)?)
            .await
        {
            Ok(_) => {
                info!(
                    points_spent = record.points_spent,
                    balance_after = record.balance_after,
                    "奖励兑换成功"
                );
                Ok(RedemptionOutcome {
                    record,
                    replayed: outcome.replayed,
                })
            }
            Err(StoreError::AlreadyExists { .. }) => {
                // 并发的相同请求先写入了记录
                let record = self.find_record(&record_key).await?.ok_or_else(|| {
                    PointsError::Internal(format!("兑换记录已存在但不可读: {}", record_key))
                })?;
                Ok(RedemptionOutcome {
                    record,
                    replayed: true,
                })
            }
            Err(err) => {
                warn!(error = %err, "扣减已生效但兑换记录写入失败，可用相同 request_id 重放");
                Err(err.into())
            }
        }
    }

    async fn find_record(&self, key: &RecordKey) -> Result<Option<RedemptionRecord>> {
        Ok(self
            .store
            .get(key)
            .await?
            .map(|found| found.decode::<RedemptionRecord>())
            .transpose()?
            .map(|found| found.value))
    }
}
