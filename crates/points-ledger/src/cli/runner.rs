//! 命令执行器
//!
//! 装配 Redis 存储、账本与服务，执行单个子命令并输出 JSON 结果。
//! 两个变更操作都是幂等的，瞬时错误时整体重放请求是安全的。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use tracing::info;

use points_ledger::{
    AchievementService, CallContext, CompletionOutcome, PointLedger, PointsError, RedisStore,
    RewardCatalogEntry, RewardService, StoreRewardCatalog,
};
use points_shared::config::AppConfig;
use points_shared::retry::{RetryPolicy, retry_with_policy};

use super::commands::Commands;

type Catalog = StoreRewardCatalog<RedisStore>;

/// 命令执行器
pub struct CommandRunner {
    ledger: Arc<PointLedger<RedisStore>>,
    achievements: AchievementService<RedisStore>,
    rewards: RewardService<RedisStore, Catalog>,
    catalog: Arc<Catalog>,
    request_policy: RetryPolicy,
    timeout: Duration,
}

impl CommandRunner {
    /// 连接 Redis 并装配服务
    pub async fn connect(
        config: &AppConfig,
        timeout: Duration,
        request_retries: u32,
    ) -> Result<Self> {
        let store = Arc::new(RedisStore::new(&config.redis)?);
        store.health_check().await?;
        info!(key_prefix = %config.redis.key_prefix, "Redis connection established");

        let ledger = Arc::new(PointLedger::new(store.clone(), &config.ledger));
        let catalog = Arc::new(StoreRewardCatalog::new(store.clone()));

        Ok(Self {
            achievements: AchievementService::new(store.clone(), ledger.clone()),
            rewards: RewardService::new(store, ledger.clone(), catalog.clone()),
            ledger,
            catalog,
            request_policy: RetryPolicy {
                max_retries: request_retries,
                initial_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(2),
                ..RetryPolicy::default()
            },
            timeout,
        })
    }

    pub async fn run(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Complete {
                user_id,
                achievement_id,
                points,
            } => {
                let (achievements, user_id, achievement_id) =
                    (&self.achievements, user_id.as_str(), achievement_id.as_str());
                let outcome = self
                    .with_request_retry("complete_achievement", |ctx| async move {
                        achievements
                            .complete_achievement(&ctx, user_id, achievement_id, points)
                            .await
                    })
                    .await?;
                let body = match outcome {
                    CompletionOutcome::Credited { record, balance } => {
                        json!({ "status": "credited", "record": record, "balance": balance })
                    }
                    CompletionOutcome::AlreadyCompleted { record } => {
                        json!({ "status": "already_completed", "record": record })
                    }
                };
                print_json(&body)
            }
            Commands::Redeem {
                user_id,
                reward_id,
                request_id,
            } => {
                let request_id = request_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let (rewards, user_id, reward_id, request_id) = (
                    &self.rewards,
                    user_id.as_str(),
                    reward_id.as_str(),
                    request_id.as_str(),
                );
                let outcome = self
                    .with_request_retry("redeem", |ctx| async move {
                        rewards.redeem(&ctx, user_id, reward_id, request_id).await
                    })
                    .await?;
                print_json(&json!({ "replayed": outcome.replayed, "record": outcome.record }))
            }
            Commands::Balance { user_id } => {
                let balance = self.ledger.get_balance(&user_id).await?;
                print_json(&json!({ "userId": user_id, "balance": balance }))
            }
            Commands::History { user_id } => {
                print_json(&self.rewards.list_redemption_history(&user_id).await?)
            }
            Commands::PointsHistory { user_id } => {
                print_json(&self.ledger.list_history(&user_id).await?)
            }
            Commands::Achievements { user_id } => {
                print_json(&self.achievements.list_achievements(&user_id).await?)
            }
            Commands::Resume { user_id } => {
                let (achievements, user_id) = (&self.achievements, user_id.as_str());
                let outcomes = self
                    .with_request_retry("resume_pending", |ctx| async move {
                        achievements.resume_pending(&ctx, user_id).await
                    })
                    .await?;
                let resumed: Vec<_> = outcomes.iter().map(CompletionOutcome::record).collect();
                print_json(&json!({ "resumed": resumed }))
            }
            Commands::SeedReward {
                reward_id,
                cost,
                stock,
                inactive,
            } => {
                points_ledger::validate_id("reward_id", &reward_id)?;
                let entry = RewardCatalogEntry {
                    reward_id,
                    cost,
                    stock,
                    active: !inactive,
                };
                let version = self.catalog.upsert_reward(&entry).await?;
                print_json(&json!({ "entry": entry, "version": version }))
            }
        }
    }

    /// 每次尝试使用新的超时上下文，瞬时错误时整体重放
    async fn with_request_retry<T, F, Fut>(&self, name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut(CallContext) -> Fut,
        Fut: Future<Output = std::result::Result<T, PointsError>>,
    {
        let timeout = self.timeout;
        let result = retry_with_policy(
            &self.request_policy,
            name,
            is_request_retryable,
            || operation(CallContext::with_timeout(timeout)),
        )
        .await?;
        Ok(result)
    }
}

/// 单次尝试超时表现为 `Cancelled`，下一次尝试有新的截止时间，可以整体重放
fn is_request_retryable(err: &PointsError) -> bool {
    err.is_retryable() || matches!(err, PointsError::Cancelled)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
