//! 内存存储
//!
//! 使用 DashMap 实现的高并发内存存储，适用于测试和单进程开发环境。
//! 同一分区的条件写入在分片锁内完成，因此对单条记录是原子的。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use serde_json::Value;

use super::{KvStore, RecordKey, RecordStream, StoreError, StoreResult, StoredRecord, Versioned};

/// 内存键值存储
///
/// 外层按分区组织，分区内按排序键有序，扫描结果天然有序。
/// 克隆后共享同一份数据。
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    partitions: Arc<DashMap<String, BTreeMap<String, Versioned<Value>>>>,
}

impl MemoryStore {
    /// 创建新的内存存储实例
    pub fn new() -> Self {
        Self::default()
    }

    /// 存储中的记录总数
    pub fn len(&self) -> usize {
        self.partitions.iter().map(|p| p.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 清空所有数据
    pub fn clear(&self) {
        self.partitions.clear();
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &RecordKey) -> StoreResult<Option<Versioned<Value>>> {
        Ok(self
            .partitions
            .get(&key.partition)
            .and_then(|partition| partition.get(&key.sort).cloned()))
    }

    async fn put(&self, key: &RecordKey, value: Value) -> StoreResult<u64> {
        let mut partition = self.partitions.entry(key.partition.clone()).or_default();
        let version = partition
            .get(&key.sort)
            .map_or(1, |existing| existing.version + 1);
        partition.insert(key.sort.clone(), Versioned { value, version });
        Ok(version)
    }

    async fn put_if_absent(&self, key: &RecordKey, value: Value) -> StoreResult<u64> {
        let mut partition = self.partitions.entry(key.partition.clone()).or_default();
        if partition.contains_key(&key.sort) {
            return Err(StoreError::AlreadyExists {
                key: key.to_string(),
            });
        }
        partition.insert(key.sort.clone(), Versioned { value, version: 1 });
        Ok(1)
    }

    async fn update_if_version(
        &self,
        key: &RecordKey,
        value: Value,
        expected_version: u64,
    ) -> StoreResult<u64> {
        let not_found = || StoreError::NotFound {
            key: key.to_string(),
        };

        let mut partition = self.partitions.get_mut(&key.partition).ok_or_else(not_found)?;
        let current = partition.get_mut(&key.sort).ok_or_else(not_found)?;

        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
            });
        }

        current.value = value;
        current.version += 1;
        Ok(current.version)
    }

    async fn query_partition(&self, partition: &str) -> StoreResult<RecordStream> {
        // 先复制快照再释放分片锁，流的消费不会阻塞写入
        let records: Vec<StoredRecord> = self
            .partitions
            .get(partition)
            .map(|items| {
                items
                    .iter()
                    .map(|(sort, item)| StoredRecord {
                        key: RecordKey::new(partition, sort.clone()),
                        value: item.value.clone(),
                        version: item.version,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(futures::stream::iter(records.into_iter().map(Ok)).boxed())
    }
}
