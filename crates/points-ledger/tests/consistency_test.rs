//! 积分一致性集成测试
//!
//! 基于内存存储验证并发与重放下的守恒、非负与恰好一次语义（无需外部依赖）

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use points_ledger::store::{RecordStream, StoreResult};
use points_ledger::{
    AchievementService, CallContext, CompletionOutcome, IdempotencyKey, KvStore, MemoryStore,
    PointLedger, PointsError, RecordKey, RewardCatalogEntry, RewardService, StoreError,
    StoreRewardCatalog, Versioned,
};
use points_shared::config::LedgerConfig;

// ==================== 测试环境 ====================

/// 高争用场景下放宽重试次数，缩短退避
fn contention_config() -> LedgerConfig {
    LedgerConfig {
        max_retries: 50,
        backoff_base_ms: 1,
        backoff_cap_ms: 10,
        idempotency_window: 128,
    }
}

struct TestEnv<S: KvStore> {
    store: Arc<S>,
    ledger: Arc<PointLedger<S>>,
    achievements: Arc<AchievementService<S>>,
    rewards: Arc<RewardService<S, StoreRewardCatalog<S>>>,
    catalog: Arc<StoreRewardCatalog<S>>,
}

impl<S: KvStore> TestEnv<S> {
    fn new(store: Arc<S>) -> Self {
        Self::with_config(store, &contention_config())
    }

    fn with_config(store: Arc<S>, config: &LedgerConfig) -> Self {
        let ledger = Arc::new(PointLedger::new(store.clone(), config));
        let catalog = Arc::new(StoreRewardCatalog::new(store.clone()));
        Self {
            achievements: Arc::new(AchievementService::new(store.clone(), ledger.clone())),
            rewards: Arc::new(RewardService::new(
                store.clone(),
                ledger.clone(),
                catalog.clone(),
            )),
            store,
            ledger,
            catalog,
        }
    }

    async fn seed_reward(&self, reward_id: &str, cost: u64) {
        self.catalog
            .upsert_reward(&RewardCatalogEntry::new(reward_id, cost))
            .await
            .unwrap();
    }

    async fn fund(&self, user_id: &str, amount: u64) {
        self.ledger
            .credit(
                &CallContext::background(),
                user_id,
                amount,
                &IdempotencyKey::raw(format!("fund-{}", user_id)),
            )
            .await
            .unwrap();
    }
}

fn memory_env() -> TestEnv<MemoryStore> {
    TestEnv::new(Arc::new(MemoryStore::new()))
}

/// 在第一次写兑换记录时模拟网络超时的存储包装
struct FlakyRedemptionStore {
    inner: MemoryStore,
    failures_left: AtomicUsize,
}

impl FlakyRedemptionStore {
    fn new(failures: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures_left: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl KvStore for FlakyRedemptionStore {
    async fn get(&self, key: &RecordKey) -> StoreResult<Option<Versioned<Value>>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &RecordKey, value: Value) -> StoreResult<u64> {
        self.inner.put(key, value).await
    }

    async fn put_if_absent(&self, key: &RecordKey, value: Value) -> StoreResult<u64> {
        if key.partition.starts_with("redemption#")
            && self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(StoreError::Unavailable("request timed out".to_string()));
        }
        self.inner.put_if_absent(key, value).await
    }

    async fn update_if_version(
        &self,
        key: &RecordKey,
        value: Value,
        expected_version: u64,
    ) -> StoreResult<u64> {
        self.inner.update_if_version(key, value, expected_version).await
    }

    async fn query_partition(&self, partition: &str) -> StoreResult<RecordStream> {
        self.inner.query_partition(partition).await
    }
}

// ==================== 场景测试 ====================

/// 余额 100，奖励 80，两个不同请求并发兑换：恰好一个成功
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_redemptions_only_one_succeeds() {
    let env = memory_env();
    env.seed_reward("mug", 80).await;
    env.fund("u1", 100).await;

    let handles: Vec<_> = ["req-a", "req-b"]
        .into_iter()
        .map(|request_id| {
            let rewards = env.rewards.clone();
            tokio::spawn(async move {
                rewards
                    .redeem(&CallContext::background(), "u1", "mug", request_id)
                    .await
            })
        })
        .collect();

    let mut succeeded = 0;
    let mut insufficient = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(outcome) => {
                succeeded += 1;
                assert_eq!(outcome.record.balance_after, 20);
            }
            Err(PointsError::InsufficientBalance { available, .. }) => {
                insufficient += 1;
                assert_eq!(available, 20);
            }
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    assert_eq!(succeeded, 1);
    assert_eq!(insufficient, 1);
    assert_eq!(env.ledger.get_balance("u1").await.unwrap(), 20);
    assert_eq!(env.rewards.list_redemption_history("u1").await.unwrap().len(), 1);
}

/// 同一成就并发完成两次：余额只增加 50，只有一条 Credited 记录
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_achievement_completion_credits_once() {
    let env = memory_env();

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let achievements = env.achievements.clone();
            tokio::spawn(async move {
                achievements
                    .complete_achievement(&CallContext::background(), "u1", "first-login", 50)
                    .await
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(env.ledger.get_balance("u1").await.unwrap(), 50);
    let records = env.achievements.list_achievements("u1").await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].is_credited());
}

/// 网络超时后以相同 request_id 重试：只扣减一次，返回同一条兑换记录
#[tokio::test]
async fn test_redeem_retry_after_timeout_debits_once() {
    let env = TestEnv::new(Arc::new(FlakyRedemptionStore::new(1)));
    env.seed_reward("mug", 80).await;
    env.fund("u1", 100).await;
    let ctx = CallContext::background();

    let err = env
        .rewards
        .redeem(&ctx, "u1", "mug", "req-1")
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(env.ledger.get_balance("u1").await.unwrap(), 20);

    let retried = env.rewards.redeem(&ctx, "u1", "mug", "req-1").await.unwrap();
    assert_eq!(retried.record.balance_after, 20);
    assert_eq!(env.ledger.get_balance("u1").await.unwrap(), 20);

    let again = env.rewards.redeem(&ctx, "u1", "mug", "req-1").await.unwrap();
    assert!(again.replayed);
    assert_eq!(again.record, retried.record);
    assert_eq!(env.ledger.get_balance("u1").await.unwrap(), 20);
    assert_eq!(
        env.rewards.list_redemption_history("u1").await.unwrap().len(),
        1
    );
    assert!(!env.store.inner.is_empty());
}

/// 扣减后崩溃，幂等键随后被挤出窗口：重试仍只扣减一次，花费按实际扣减记录
#[tokio::test]
async fn test_redeem_retry_after_key_left_window_debits_once() {
    let env = TestEnv::with_config(
        Arc::new(MemoryStore::new()),
        &LedgerConfig {
            idempotency_window: 2,
            ..contention_config()
        },
    );
    env.seed_reward("mug", 80).await;
    env.fund("u1", 100).await;
    let ctx = CallContext::background();

    env.ledger
        .debit(&ctx, "u1", 80, &IdempotencyKey::redemption("req-1"))
        .await
        .unwrap();
    for i in 0..2 {
        env.ledger
            .credit(&ctx, "u1", 5, &IdempotencyKey::raw(format!("bonus-{}", i)))
            .await
            .unwrap();
    }
    env.seed_reward("mug", 60).await;

    let outcome = env.rewards.redeem(&ctx, "u1", "mug", "req-1").await.unwrap();
    assert!(outcome.replayed);
    assert_eq!(outcome.record.points_spent, 80);
    assert_eq!(outcome.record.balance_after, 20);
    assert_eq!(env.ledger.get_balance("u1").await.unwrap(), 30);
}

// ==================== 性质测试 ====================

/// 任意次数（顺序与并发）完成同一成就，余额只变化一次
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_idempotent_award_under_load() {
    let env = memory_env();

    for _ in 0..3 {
        env.achievements
            .complete_achievement(&CallContext::background(), "u1", "streak-7", 50)
            .await
            .unwrap();
    }

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let achievements = env.achievements.clone();
            tokio::spawn(async move {
                achievements
                    .complete_achievement(&CallContext::background(), "u1", "streak-7", 50)
                    .await
            })
        })
        .collect();

    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert!(matches!(outcome, CompletionOutcome::AlreadyCompleted { .. }));
    }
    assert_eq!(env.ledger.get_balance("u1").await.unwrap(), 50);
}

/// 并发兑换下余额不为负，成功兑换数不超过余额可支付数
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_non_negativity_under_concurrent_redemptions() {
    let env = memory_env();
    env.seed_reward("sticker", 30).await;
    env.fund("u1", 100).await;

    let handles: Vec<_> = (0..12)
        .map(|i| {
            let rewards = env.rewards.clone();
            tokio::spawn(async move {
                rewards
                    .redeem(
                        &CallContext::background(),
                        "u1",
                        "sticker",
                        &format!("req-{}", i),
                    )
                    .await
            })
        })
        .collect();

    let mut succeeded = 0u64;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(PointsError::InsufficientBalance { .. }) => {}
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    // 100 / 30 = 3
    assert_eq!(succeeded, 3);
    assert_eq!(env.ledger.get_balance("u1").await.unwrap(), 10);
}

/// 静止后：余额 = 已入账成就积分之和 - 已记录兑换花费之和
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_conservation_at_quiescence() {
    let env = memory_env();
    env.seed_reward("mug", 40).await;

    let mut handles = Vec::new();
    for i in 0..10 {
        let achievements = env.achievements.clone();
        handles.push(tokio::spawn(async move {
            achievements
                .complete_achievement(
                    &CallContext::background(),
                    "u1",
                    &format!("achievement-{}", i % 5),
                    (i % 5 + 1) as u64 * 10,
                )
                .await
                .map(|_| ())
        }));
    }
    for i in 0..6 {
        let rewards = env.rewards.clone();
        handles.push(tokio::spawn(async move {
            rewards
                .redeem(&CallContext::background(), "u1", "mug", &format!("req-{}", i))
                .await
                .map(|_| ())
        }));
    }

    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) | Err(PointsError::InsufficientBalance { .. }) => {}
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    let credited: u64 = env
        .achievements
        .list_achievements("u1")
        .await
        .unwrap()
        .iter()
        .filter(|r| r.is_credited())
        .map(|r| r.points)
        .sum();
    let spent: u64 = env
        .rewards
        .list_redemption_history("u1")
        .await
        .unwrap()
        .iter()
        .map(|r| r.points_spent)
        .sum();

    // 5 个不同成就：10 + 20 + 30 + 40 + 50
    assert_eq!(credited, 150);
    assert_eq!(env.ledger.get_balance("u1").await.unwrap(), credited - spent);

    // 流水与余额一致
    let history = env.ledger.list_history("u1").await.unwrap();
    assert_eq!(
        history.last().map(|entry| entry.balance_after),
        Some(credited - spent)
    );
}

/// 相同 request_id 的并发兑换只产生一条记录、一次扣减
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_exactly_once_redemption() {
    let env = memory_env();
    env.seed_reward("mug", 80).await;
    env.fund("u1", 500).await;

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let rewards = env.rewards.clone();
            tokio::spawn(async move {
                rewards
                    .redeem(&CallContext::background(), "u1", "mug", "req-same")
                    .await
            })
        })
        .collect();

    let mut records = Vec::new();
    for handle in handles {
        records.push(handle.await.unwrap().unwrap().record);
    }

    assert!(records.iter().all(|r| r.balance_after == 420));
    assert_eq!(env.ledger.get_balance("u1").await.unwrap(), 420);
    assert_eq!(
        env.rewards.list_redemption_history("u1").await.unwrap().len(),
        1
    );
}

/// 不同用户互不影响
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_users_are_independent() {
    let env = memory_env();
    env.seed_reward("mug", 80).await;

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let achievements = env.achievements.clone();
            let rewards = env.rewards.clone();
            tokio::spawn(async move {
                let user_id = format!("user-{}", i);
                let ctx = CallContext::background();
                achievements
                    .complete_achievement(&ctx, &user_id, "first-login", 100)
                    .await?;
                rewards.redeem(&ctx, &user_id, "mug", "req-1").await
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    for i in 0..8 {
        assert_eq!(
            env.ledger
                .get_balance(&format!("user-{}", i))
                .await
                .unwrap(),
            20
        );
    }
}

/// 已取消的调用不会产生任何写入
#[tokio::test]
async fn test_cancelled_call_leaves_no_trace() {
    let env = memory_env();
    env.seed_reward("mug", 80).await;
    env.fund("u1", 100).await;

    let ctx = CallContext::background();
    ctx.cancel();

    let err = env
        .rewards
        .redeem(&ctx, "u1", "mug", "req-1")
        .await
        .unwrap_err();
    assert!(matches!(err, PointsError::Cancelled));
    assert_eq!(env.ledger.get_balance("u1").await.unwrap(), 100);
    assert!(
        env.rewards
            .list_redemption_history("u1")
            .await
            .unwrap()
            .is_empty()
    );
}
