//! 成就服务
//!
//! 成就完成后为用户入账积分，保证每个 (user_id, achievement_id) 恰好入账一次。
//!
//! ## 完成流程
//!
//! 1. 条件写入 Pending 记录；已存在时读取：Credited 直接返回，Pending 继续
//! 2. 以派生幂等键调用账本入账（重放安全）
//! 3. 条件更新记录为 Credited；输给并发的相同完成时结果仍为 Credited
//!
//! 第 1 步与第 3 步之间崩溃会留下 Pending 记录，由 [`AchievementService::resume_pending`]
//! 重新驱动第 2、3 步。

use std::sync::Arc;

use futures::TryStreamExt;
use tracing::{info, instrument, warn};

use points_shared::observability::metrics::record_achievement_completion;

use crate::context::CallContext;
use crate::error::{PointsError, Result};
use crate::ledger::PointLedger;
use crate::models::keys::{achievement_partition, validate_id};
use crate::models::{AchievementRecord, IdempotencyKey};
use crate::store::{KvStore, RecordKey, StoreError, StoredRecord, Versioned};

/// 成就完成结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// 本次调用（或并发的相同调用）完成了入账
    Credited {
        record: AchievementRecord,
        balance: u64,
    },
    /// 此前已入账，本次为无操作
    AlreadyCompleted { record: AchievementRecord },
}

impl CompletionOutcome {
    pub fn record(&self) -> &AchievementRecord {
        match self {
            Self::Credited { record, .. } | Self::AlreadyCompleted { record } => record,
        }
    }
}

/// 成就服务
pub struct AchievementService<S>
where
    S: KvStore,
{
    store: Arc<S>,
    ledger: Arc<PointLedger<S>>,
}

impl<S> AchievementService<S>
where
    S: KvStore,
{
    pub fn new(store: Arc<S>, ledger: Arc<PointLedger<S>>) -> Self {
        Self { store, ledger }
    }

    /// 完成成就并入账积分
    ///
    /// 恢复 Pending 记录时以记录中保存的积分值为准
    #[instrument(skip(self, ctx), fields(user_id = %user_id, achievement_id = %achievement_id))]
    pub async fn complete_achievement(
        &self,
        ctx: &CallContext,
        user_id: &str,
        achievement_id: &str,
        points: u64,
    ) -> Result<CompletionOutcome> {
        validate_id("user_id", user_id)?;
        validate_id("achievement_id", achievement_id)?;

        let key = RecordKey::achievement(user_id, achievement_id);
        let pending = AchievementRecord::pending(user_id, achievement_id, points);

        ctx.check()?;
        let current = match self
            .store
            .put_if_absent(&key, serde_json::to_value(&pending)?)
            .await
        {
            Ok(version) => Versioned {
                value: pending,
                version,
            },
            Err(StoreError::AlreadyExists { .. }) => {
                let existing = self.load(ctx, &key).await?;
                if existing.value.is_credited() {
                    info!("成就已入账，跳过");
                    record_achievement_completion("already_completed");
                    return Ok(CompletionOutcome::AlreadyCompleted {
                        record: existing.value,
                    });
                }
                if existing.value.points != points {
                    warn!(
                        stored_points = existing.value.points,
                        requested_points = points,
                        "恢复 Pending 成就时积分值不一致，以已登记的值为准"
                    );
                }
                info!("发现未完成的 Pending 记录，继续入账");
                existing
            }
            Err(err) => return Err(err.into()),
        };

        self.credit_and_mark(ctx, current).await
    }

    /// 查询单个成就记录
    pub async fn get_achievement(
        &self,
        user_id: &str,
        achievement_id: &str,
    ) -> Result<Option<AchievementRecord>> {
        Ok(self
            .store
            .get(&RecordKey::achievement(user_id, achievement_id))
            .await?
            .map(|found| found.decode::<AchievementRecord>())
            .transpose()?
            .map(|found| found.value))
    }

    /// 列出用户的全部成就记录，按 achievement_id 排序
    pub async fn list_achievements(&self, user_id: &str) -> Result<Vec<AchievementRecord>> {
        Ok(self
            .scan(user_id)
            .await?
            .into_iter()
            .map(|found| found.value)
            .collect())
    }

    /// 重新驱动用户所有 Pending 记录的入账与状态更新
    ///
    /// 供外部对账任务调用。遇到错误立即返回，已完成的部分不会回滚，整体重放安全。
    #[instrument(skip(self, ctx), fields(user_id = %user_id))]
    pub async fn resume_pending(
        &self,
        ctx: &CallContext,
        user_id: &str,
    ) -> Result<Vec<CompletionOutcome>> {
        ctx.check()?;
        let pending: Vec<_> = self
            .scan(user_id)
            .await?
            .into_iter()
            .filter(|found| !found.value.is_credited())
            .collect();

        if pending.is_empty() {
            return Ok(Vec::new());
        }
        info!(count = pending.len(), "开始恢复 Pending 成就");

        let mut outcomes = Vec::with_capacity(pending.len());
        for record in pending {
            outcomes.push(self.credit_and_mark(ctx, record).await?);
        }
        Ok(outcomes)
    }

    // ==================== 私有方法 ====================

    /// 第 2、3 步：入账并标记为 Credited
    async fn credit_and_mark(
        &self,
        ctx: &CallContext,
        current: Versioned<AchievementRecord>,
    ) -> Result<CompletionOutcome> {
        let Versioned {
            value: record,
            version,
        } = current;
        let idempotency_key = IdempotencyKey::achievement(&record.user_id, &record.achievement_id);

        let outcome = match self
            .ledger
            .credit(ctx, &record.user_id, record.points, &idempotency_key)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                record_achievement_completion("failed");
                return Err(err);
            }
        };

        // 入账已落地，状态更新不再检查取消，未完成时由恢复流程补齐
        let key = RecordKey::achievement(&record.user_id, &record.achievement_id);
        let credited = record.into_credited();
        let record = match self
            .store
            .update_if_version(&key, serde_json::to_value(&credited)?, version)
            .await
        {
            Ok(_) => credited,
            Err(StoreError::VersionConflict { .. }) => {
                // 唯一的状态迁移是 Pending -> Credited，版本前进说明已被并发标记
                let latest = self.read(&key).await?;
                if !latest.value.is_credited() {
                    return Err(PointsError::Internal(format!(
                        "成就记录版本前进但仍为 Pending: {}",
                        key
                    )));
                }
                latest.value
            }
            Err(err) => return Err(err.into()),
        };

        info!(
            user_id = %record.user_id,
            achievement_id = %record.achievement_id,
            points = record.points,
            balance = outcome.current_balance,
            replayed = outcome.replayed,
            "成就积分已入账"
        );
        record_achievement_completion("credited");
        Ok(CompletionOutcome::Credited {
            record,
            balance: outcome.current_balance,
        })
    }

    async fn load(
        &self,
        ctx: &CallContext,
        key: &RecordKey,
    ) -> Result<Versioned<AchievementRecord>> {
        ctx.check()?;
        self.read(key).await
    }

    /// 不检查调用上下文的读取，用于入账落地之后
    async fn read(&self, key: &RecordKey) -> Result<Versioned<AchievementRecord>> {
        let found = self.store.get(key).await?.ok_or_else(|| {
            PointsError::Internal(format!("成就记录已存在但不可读: {}", key))
        })?;
        Ok(found.decode()?)
    }

    async fn scan(&self, user_id: &str) -> Result<Vec<Versioned<AchievementRecord>>> {
        let records: Vec<StoredRecord> = self
            .store
            .query_partition(&achievement_partition(user_id))
            .await?
            .try_collect()
            .await?;

        Ok(records
            .into_iter()
            .map(StoredRecord::decode::<AchievementRecord>)
            .collect::<serde_json::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AchievementStatus;
    use crate::store::{MemoryStore, RecordStream, StoreResult};
    use async_trait::async_trait;
    use points_shared::config::LedgerConfig;
    use serde_json::Value;

    /// 标记 Credited 时让并发的完成者抢先一步，并在同一时刻取消调用
    struct RacingStore {
        inner: MemoryStore,
        ctx: CallContext,
    }

    #[async_trait]
    impl KvStore for RacingStore {
        async fn get(&self, key: &RecordKey) -> StoreResult<Option<Versioned<Value>>> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &RecordKey, value: Value) -> StoreResult<u64> {
            self.inner.put(key, value).await
        }

        async fn put_if_absent(&self, key: &RecordKey, value: Value) -> StoreResult<u64> {
            self.inner.put_if_absent(key, value).await
        }

        async fn update_if_version(
            &self,
            key: &RecordKey,
            value: Value,
            expected_version: u64,
        ) -> StoreResult<u64> {
            if !key.partition.starts_with("achievement#") {
                return self.inner.update_if_version(key, value, expected_version).await;
            }
            let credited = serde_json::from_value::<AchievementRecord>(value)
                .unwrap()
                .into_credited();
            self.inner
                .update_if_version(key, serde_json::to_value(&credited).unwrap(), expected_version)
                .await?;
            self.ctx.cancel();
            Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
            })
        }

        async fn query_partition(&self, partition: &str) -> StoreResult<RecordStream> {
            self.inner.query_partition(partition).await
        }
    }

    type Fixture = (
        AchievementService<MemoryStore>,
        Arc<PointLedger<MemoryStore>>,
        Arc<MemoryStore>,
    );

    fn setup() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let config = LedgerConfig {
            backoff_base_ms: 1,
            backoff_cap_ms: 5,
            ..LedgerConfig::default()
        };
        let ledger = Arc::new(PointLedger::new(store.clone(), &config));
        (
            AchievementService::new(store.clone(), ledger.clone()),
            ledger,
            store,
        )
    }

    #[tokio::test]
    async fn test_complete_achievement_credits_once() {
        let (service, ledger, _) = setup();
        let ctx = CallContext::background();

        let first = service
            .complete_achievement(&ctx, "u1", "first-login", 50)
            .await
            .unwrap();
        assert!(matches!(first, CompletionOutcome::Credited { balance: 50, .. }));
        assert_eq!(first.record().status, AchievementStatus::Credited);
        assert!(first.record().credited_at.is_some());

        let second = service
            .complete_achievement(&ctx, "u1", "first-login", 50)
            .await
            .unwrap();
        assert!(matches!(second, CompletionOutcome::AlreadyCompleted { .. }));
        assert_eq!(ledger.get_balance("u1").await.unwrap(), 50);
    }

    #[tokio::test]
    async fn test_pending_record_is_resumed_with_stored_points() {
        let (service, ledger, store) = setup();
        let ctx = CallContext::background();

        // 模拟第 1 步之后崩溃
        let pending = AchievementRecord::pending("u1", "streak-7", 70);
        store
            .put_if_absent(
                &RecordKey::achievement("u1", "streak-7"),
                serde_json::to_value(&pending).unwrap(),
            )
            .await
            .unwrap();

        let outcome = service
            .complete_achievement(&ctx, "u1", "streak-7", 999)
            .await
            .unwrap();
        assert!(matches!(outcome, CompletionOutcome::Credited { balance: 70, .. }));
        assert_eq!(ledger.get_balance("u1").await.unwrap(), 70);
    }

    #[tokio::test]
    async fn test_crash_after_credit_does_not_double_credit() {
        let (service, ledger, store) = setup();
        let ctx = CallContext::background();

        // 模拟第 2 步之后崩溃：积分已入账，记录仍为 Pending
        let pending = AchievementRecord::pending("u1", "first-login", 50);
        store
            .put_if_absent(
                &RecordKey::achievement("u1", "first-login"),
                serde_json::to_value(&pending).unwrap(),
            )
            .await
            .unwrap();
        ledger
            .credit(
                &ctx,
                "u1",
                50,
                &IdempotencyKey::achievement("u1", "first-login"),
            )
            .await
            .unwrap();

        let outcomes = service.resume_pending(&ctx, "u1").await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(ledger.get_balance("u1").await.unwrap(), 50);

        let record = service
            .get_achievement("u1", "first-login")
            .await
            .unwrap()
            .unwrap();
        assert!(record.is_credited());
        assert!(service.resume_pending(&ctx, "u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lost_credited_race_survives_cancellation() {
        let ctx = CallContext::background();
        let store = Arc::new(RacingStore {
            inner: MemoryStore::new(),
            ctx: ctx.clone(),
        });
        let ledger = Arc::new(PointLedger::new(store.clone(), &LedgerConfig::default()));
        let service = AchievementService::new(store, ledger.clone());

        let outcome = service
            .complete_achievement(&ctx, "u1", "first-login", 50)
            .await
            .unwrap();
        assert!(ctx.is_done());
        assert!(matches!(outcome, CompletionOutcome::Credited { balance: 50, .. }));
        assert!(outcome.record().is_credited());
        assert_eq!(ledger.get_balance("u1").await.unwrap(), 50);
    }

    #[tokio::test]
    async fn test_resume_after_key_left_window_does_not_double_credit() {
        let store = Arc::new(MemoryStore::new());
        let config = LedgerConfig {
            idempotency_window: 2,
            backoff_base_ms: 1,
            backoff_cap_ms: 5,
            ..LedgerConfig::default()
        };
        let ledger = Arc::new(PointLedger::new(store.clone(), &config));
        let service = AchievementService::new(store.clone(), ledger.clone());
        let ctx = CallContext::background();

        // 第 2 步之后崩溃，随后的入账把该幂等键挤出窗口
        let pending = AchievementRecord::pending("u1", "a1", 50);
        store
            .put_if_absent(
                &RecordKey::achievement("u1", "a1"),
                serde_json::to_value(&pending).unwrap(),
            )
            .await
            .unwrap();
        ledger
            .credit(&ctx, "u1", 50, &IdempotencyKey::achievement("u1", "a1"))
            .await
            .unwrap();
        for i in 0..2 {
            ledger
                .credit(&ctx, "u1", 1, &IdempotencyKey::raw(format!("bonus-{}", i)))
                .await
                .unwrap();
        }

        let outcomes = service.resume_pending(&ctx, "u1").await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].record().is_credited());
        assert_eq!(ledger.get_balance("u1").await.unwrap(), 52);
    }

    #[tokio::test]
    async fn test_list_achievements() {
        let (service, _, _) = setup();
        let ctx = CallContext::background();
        for id in ["b-badge", "a-badge"] {
            service
                .complete_achievement(&ctx, "u1", id, 10)
                .await
                .unwrap();
        }

        let ids: Vec<_> = service
            .list_achievements("u1")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.achievement_id)
            .collect();
        assert_eq!(ids, vec!["a-badge", "b-badge"]);
        assert!(service.list_achievements("u2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_ids_are_rejected() {
        let (service, _, store) = setup();
        let err = service
            .complete_achievement(&CallContext::background(), "u#1", "a", 10)
            .await
            .unwrap_err();
        assert!(matches!(err, PointsError::Validation(_)));
        assert!(store.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_identical_completions() {
        let (service, ledger, _) = setup();
        let service = Arc::new(service);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move {
                    service
                        .complete_achievement(&CallContext::background(), "u1", "first-login", 50)
                        .await
                })
            })
            .collect();

        for handle in handles {
            let outcome = handle.await.unwrap().unwrap();
            assert!(outcome.record().points == 50);
        }
        assert_eq!(ledger.get_balance("u1").await.unwrap(), 50);
        assert!(
            service
                .get_achievement("u1", "first-login")
                .await
                .unwrap()
                .unwrap()
                .is_credited()
        );
    }
}
