//! 奖励目录
//!
//! 积分核心只读取目录，目录条目由运营侧维护。

use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use tracing::info;

use crate::error::Result;
use crate::models::RewardCatalogEntry;
use crate::models::keys::CATALOG_PARTITION;
use crate::store::{KvStore, RecordKey, StoredRecord};

/// 奖励目录查询接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RewardCatalog: Send + Sync {
    async fn get_reward(&self, reward_id: &str) -> Result<Option<RewardCatalogEntry>>;
}

/// 基于存储 `catalog` 分区的奖励目录
pub struct StoreRewardCatalog<S>
where
    S: KvStore,
{
    store: Arc<S>,
}

impl<S> StoreRewardCatalog<S>
where
    S: KvStore,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// 列出全部目录条目，按 reward_id 排序
    pub async fn list_rewards(&self) -> Result<Vec<RewardCatalogEntry>> {
        let records: Vec<StoredRecord> = self
            .store
            .query_partition(CATALOG_PARTITION)
            .await?
            .try_collect()
            .await?;

        let mut entries = records
            .into_iter()
            .map(|record| record.decode::<RewardCatalogEntry>().map(|v| v.value))
            .collect::<serde_json::Result<Vec<_>>>()?;
        entries.sort_by(|a, b| a.reward_id.cmp(&b.reward_id));
        Ok(entries)
    }

    /// 写入目录条目（运营初始化用）
    pub async fn upsert_reward(&self, entry: &RewardCatalogEntry) -> Result<u64> {
        let version = self
            .store
            .put(
                &RecordKey::reward(&entry.reward_id),
                serde_json::to_value(entry)?,
            )
            .await?;
        info!(reward_id = %entry.reward_id, cost = entry.cost, version, "奖励目录条目已写入");
        Ok(version)
    }
}

#[async_trait]
impl<S> RewardCatalog for StoreRewardCatalog<S>
where
    S: KvStore,
{
    async fn get_reward(&self, reward_id: &str) -> Result<Option<RewardCatalogEntry>> {
        Ok(self
            .store
            .get(&RecordKey::reward(reward_id))
            .await?
            .map(|found| found.decode::<RewardCatalogEntry>())
            .transpose()?
            .map(|found| found.value))
    }
}
