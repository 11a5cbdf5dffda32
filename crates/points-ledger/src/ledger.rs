//! 积分账本
//!
//! 负责用户积分余额的全部变更语义。
//!
//! ## 并发控制策略
//!
//! - 不持有任何锁：读取余额与版本号，计算新余额，按读到的版本号条件更新
//! - 版本冲突时重新读取并整体重算，重试次数有上限，两次尝试之间随机退避
//! - 余额记录内嵌最近已应用操作的窗口，同一幂等键的重放直接返回已记录的结果
//! - 操作移出窗口前先落一条 `applied#{user}` 标记，窗口未命中时再查标记
//! - 每次存储调用前检查调用上下文，已发出的条件写入允许完成
//!
//! 正确性只依赖存储的单行原子性，因此服务可以以多个无状态副本运行。

use std::sync::Arc;

use futures::TryStreamExt;
use tracing::{debug, info, instrument, warn};

use points_shared::config::LedgerConfig;
use points_shared::observability::metrics::{
    record_ledger_operation, record_retry_exhausted, record_version_conflict,
};
use points_shared::retry::RetryPolicy;

use crate::context::CallContext;
use crate::error::{PointsError, Result};
use crate::models::keys::history_partition;
use crate::models::{
    AppliedOperation, IdempotencyKey, OperationKind, PointBalance, PointsHistoryEntry,
};
use crate::store::{KvStore, RecordKey, StoreError, StoredRecord, Versioned};

/// 一次账本操作的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerOutcome {
    /// 该操作应用后的余额（重放时为首次应用时记录的值）
    pub balance: u64,
    /// 实际应用的积分数（重放时为首次应用的值）
    pub amount: u64,
    /// 读取时刻的当前余额
    pub current_balance: u64,
    /// 该操作在用户账本上的序号
    pub sequence: u64,
    /// 是否为已应用操作的重放
    pub replayed: bool,
}

/// 积分账本
pub struct PointLedger<S>
where
    S: KvStore,
{
    store: Arc<S>,
    policy: RetryPolicy,
    window: usize,
}

impl<S> PointLedger<S>
where
    S: KvStore,
{
    pub fn new(store: Arc<S>, config: &LedgerConfig) -> Self {
        Self {
            store,
            policy: config.retry_policy(),
            window: config.idempotency_window.max(1),
        }
    }

    /// 入账
    ///
    /// 余额记录不存在时先创建。同一幂等键的重放不会重复入账。
    #[instrument(skip(self, ctx, key), fields(key = %key))]
    pub async fn credit(
        &self,
        ctx: &CallContext,
        user_id: &str,
        amount: u64,
        key: &IdempotencyKey,
    ) -> Result<LedgerOutcome> {
        self.apply(ctx, user_id, OperationKind::Credit, amount, key)
            .await
    }

    /// 扣减
    ///
    /// 余额不足立即返回 `InsufficientBalance`，不写入也不重试。
    /// 同一幂等键的重放返回首次扣减后记录的余额。
    #[instrument(skip(self, ctx, key), fields(key = %key))]
    pub async fn debit(
        &self,
        ctx: &CallContext,
        user_id: &str,
        amount: u64,
        key: &IdempotencyKey,
    ) -> Result<LedgerOutcome> {
        self.apply(ctx, user_id, OperationKind::Debit, amount, key)
            .await
    }

    /// 查询当前余额，未知用户返回 0 且不创建记录
    pub async fn get_balance(&self, user_id: &str) -> Result<u64> {
        Ok(self
            .store
            .get(&RecordKey::balance(user_id))
            .await?
            .map(|found| found.decode::<PointBalance>())
            .transpose()?
            .map_or(0, |found| found.value.balance))
    }

    /// 查询幂等键是否已应用（窗口内或已移出窗口）
    pub async fn find_applied(
        &self,
        user_id: &str,
        key: &IdempotencyKey,
    ) -> Result<Option<AppliedOperation>> {
        let Some(found) = self.store.get(&RecordKey::balance(user_id)).await? else {
            return Ok(None);
        };
        let balance = found.decode::<PointBalance>()?.value;
        if let Some(applied) = balance.find_applied(key) {
            return Ok(Some(applied.clone()));
        }
        if !balance.has_evicted() {
            return Ok(None);
        }
        self.find_marker(user_id, key).await
    }

    /// 查询积分流水，按序号升序
    ///
    /// 流水最终一致，可能暂时落后于余额
    pub async fn list_history(&self, user_id: &str) -> Result<Vec<PointsHistoryEntry>> {
        let records: Vec<StoredRecord> = self
            .store
            .query_partition(&history_partition(user_id))
            .await?
            .try_collect()
            .await?;

        let mut entries = records
            .into_iter()
            .map(|record| record.decode::<PointsHistoryEntry>().map(|v| v.value))
            .collect::<serde_json::Result<Vec<_>>>()?;
        entries.sort_by_key(|entry| entry.sequence);
        Ok(entries)
    }

    // ==================== 私有方法 ====================

    /// 读取-计算-条件更新循环
    async fn apply(
        &self,
        ctx: &CallContext,
        user_id: &str,
        kind: OperationKind,
        amount: u64,
        key: &IdempotencyKey,
    ) -> Result<LedgerOutcome> {
        let record_key = RecordKey::balance(user_id);
        let max_attempts = self.policy.max_retries + 1;
        // 扣减不为不存在的用户创建余额记录，零额扣减除外（需要落下幂等标记）
        let create_if_missing = kind == OperationKind::Credit || amount == 0;

        for attempt in 0..max_attempts {
            let Some(current) = self.load(ctx, user_id, create_if_missing).await? else {
                record_ledger_operation(kind.as_str(), "insufficient");
                return Err(PointsError::InsufficientBalance {
                    user_id: user_id.to_string(),
                    required: amount,
                    available: 0,
                });
            };

            let mut applied = current.value.find_applied(key).cloned();
            if applied.is_none() && current.value.has_evicted() {
                ctx.check()?;
                applied = self.find_marker(user_id, key).await?;
            }
            if let Some(applied) = applied {
                return Ok(self
                    .replay(user_id, kind, amount, key, &applied, current.value.balance)
                    .await);
            }

            let Some((next, applied)) = current.value.apply(kind, amount, key, self.window) else {
                return Err(match kind {
                    OperationKind::Debit => {
                        record_ledger_operation(kind.as_str(), "insufficient");
                        PointsError::InsufficientBalance {
                            user_id: user_id.to_string(),
                            required: amount,
                            available: current.value.balance,
                        }
                    }
                    OperationKind::Credit => PointsError::Validation(format!(
                        "入账后余额溢出: user_id={}, balance={}, amount={}",
                        user_id, current.value.balance, amount
                    )),
                });
            };

            self.persist_evicted(ctx, user_id, current.value.evicted_on_next(self.window))
                .await?;

            ctx.check()?;
            match self
                .store
                .update_if_version(&record_key, serde_json::to_value(&next)?, current.version)
                .await
            {
                Ok(_) => {
                    record_ledger_operation(kind.as_str(), "applied");
                    info!(
                        user_id = %user_id,
                        op = kind.as_str(),
                        amount,
                        balance_after = applied.balance_after,
                        sequence = applied.sequence,
                        attempt,
                        "账本操作已应用"
                    );
                    self.append_history(user_id, &applied).await;
                    return Ok(LedgerOutcome {
                        balance: applied.balance_after,
                        amount: applied.amount,
                        current_balance: applied.balance_after,
                        sequence: applied.sequence,
                        replayed: false,
                    });
                }
                Err(StoreError::VersionConflict { .. }) => {
                    record_version_conflict(kind.as_str());
                    if attempt + 1 < max_attempts {
                        let delay = self.policy.jittered_delay(attempt);
                        debug!(
                            user_id = %user_id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "余额版本冲突，退避后重试"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(err) => {
                    record_ledger_operation(kind.as_str(), "error");
                    return Err(err.into());
                }
            }
        }

        record_retry_exhausted(kind.as_str());
        warn!(
            user_id = %user_id,
            op = kind.as_str(),
            attempts = max_attempts,
            "版本冲突重试次数耗尽"
        );
        Err(PointsError::RetryExhausted {
            user_id: user_id.to_string(),
            attempts: max_attempts,
        })
    }

    /// 返回已应用操作的记录结果，不修改余额
    async fn replay(
        &self,
        user_id: &str,
        kind: OperationKind,
        amount: u64,
        key: &IdempotencyKey,
        applied: &AppliedOperation,
        current_balance: u64,
    ) -> LedgerOutcome {
        if applied.kind != kind || applied.amount != amount {
            warn!(
                user_id = %user_id,
                key = %key,
                recorded_kind = applied.kind.as_str(),
                recorded_amount = applied.amount,
                "幂等键被不同参数重用，返回首次应用的结果"
            );
        }
        debug!(user_id = %user_id, key = %key, sequence = applied.sequence, "重放已应用的操作");
        record_ledger_operation(kind.as_str(), "replayed");
        self.append_history(user_id, applied).await;
        LedgerOutcome {
            balance: applied.balance_after,
            amount: applied.amount,
            current_balance,
            sequence: applied.sequence,
            replayed: true,
        }
    }

    /// 为即将移出窗口的操作写入标记
    ///
    /// 标记必须先于余额更新落地，任何失败都中止本次尝试
    async fn persist_evicted(
        &self,
        ctx: &CallContext,
        user_id: &str,
        evicted: &[AppliedOperation],
    ) -> Result<()> {
        for applied in evicted {
            ctx.check()?;
            let key = RecordKey::applied_marker(user_id, &applied.idempotency_key);
            match self
                .store
                .put_if_absent(&key, serde_json::to_value(applied)?)
                .await
            {
                Ok(_) | Err(StoreError::AlreadyExists { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn find_marker(
        &self,
        user_id: &str,
        key: &IdempotencyKey,
    ) -> Result<Option<AppliedOperation>> {
        Ok(self
            .store
            .get(&RecordKey::applied_marker(user_id, key.as_str()))
            .await?
            .map(|found| found.decode::<AppliedOperation>())
            .transpose()?
            .map(|found| found.value))
    }

    /// 读取余额记录，按需以余额 0 创建
    ///
    /// 并发创建时 `AlreadyExists` 属于良性竞争，重新读取即可
    async fn load(
        &self,
        ctx: &CallContext,
        user_id: &str,
        create_if_missing: bool,
    ) -> Result<Option<Versioned<PointBalance>>> {
        let key = RecordKey::balance(user_id);

        ctx.check()?;
        if let Some(found) = self.store.get(&key).await? {
            return Ok(Some(found.decode()?));
        }
        if !create_if_missing {
            return Ok(None);
        }

        ctx.check()?;
        let initial = PointBalance::new(user_id);
        match self
            .store
            .put_if_absent(&key, serde_json::to_value(&initial)?)
            .await
        {
            Ok(version) => Ok(Some(Versioned {
                value: initial,
                version,
            })),
            Err(StoreError::AlreadyExists { .. }) => {
                debug!(user_id = %user_id, "余额记录已被并发创建，重新读取");
                ctx.check()?;
                let found = self.store.get(&key).await?.ok_or_else(|| {
                    PointsError::Internal(format!("余额记录创建后不可读: user_id={}", user_id))
                })?;
                Ok(Some(found.decode()?))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// 追加积分流水（尽力而为）
    ///
    /// 写入失败只记录日志，重放同一操作时会再次尝试补写
    async fn append_history(&self, user_id: &str, applied: &AppliedOperation) {
        let entry = PointsHistoryEntry::from_applied(user_id, applied);
        let value = match serde_json::to_value(&entry) {
            Ok(value) => value,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "积分流水序列化失败");
                return;
            }
        };

        match self
            .store
            .put_if_absent(&RecordKey::history_entry(user_id, applied.sequence), value)
            .await
        {
            Ok(_) | Err(StoreError::AlreadyExists { .. }) => {}
            Err(e) => {
                warn!(
                    user_id = %user_id,
                    sequence = applied.sequence,
                    error = %e,
                    "积分流水写入失败，等待重放补写"
                );
            }
        }
    }
}
