//! 存储能力层
//!
//! 积分核心只通过 [`KvStore`] 访问存储，不假设任何跨键原子性。
//!
//! ## 能力
//!
//! - `get`：按键读取，返回值与版本号
//! - `put`：无条件写入，仅用于首次写入场景
//! - `put_if_absent`：键不存在时写入，否则 `AlreadyExists`
//! - `update_if_version`：存储版本等于期望版本时写入，否则 `VersionConflict`
//! - `query_partition`：按分区键惰性扫描记录
//!
//! 每次写入都会让记录版本单调递增，首次写入的版本为 1。

mod memory_store;
mod redis_store;

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

pub use memory_store::MemoryStore;
pub use redis_store::RedisStore;

/// 存储层错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("记录已存在: {key}")]
    AlreadyExists { key: String },

    #[error("版本冲突: {key}, expected_version={expected}")]
    VersionConflict { key: String, expected: u64 },

    #[error("记录不存在: {key}")]
    NotFound { key: String },

    #[error("存储后端不可用: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// 记录键
///
/// `partition` 决定记录归属的分区（可被 `query_partition` 扫描），
/// `sort` 在分区内唯一标识一条记录。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub partition: String,
    pub sort: String,
}

impl RecordKey {
    pub fn new(partition: impl Into<String>, sort: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort: sort.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.partition, self.sort)
    }
}

/// 带版本号的值
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

impl Versioned<Value> {
    /// 将 JSON 值解码为领域记录，版本号保持不变
    pub fn decode<T: DeserializeOwned>(self) -> serde_json::Result<Versioned<T>> {
        Ok(Versioned {
            value: serde_json::from_value(self.value)?,
            version: self.version,
        })
    }
}

/// 分区扫描返回的单条记录
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub key: RecordKey,
    pub value: Value,
    pub version: u64,
}

impl StoredRecord {
    pub fn decode<T: DeserializeOwned>(self) -> serde_json::Result<Versioned<T>> {
        Versioned {
            value: self.value,
            version: self.version,
        }
        .decode()
    }
}

/// 分区扫描的惰性记录流
pub type RecordStream = BoxStream<'static, StoreResult<StoredRecord>>;

/// 键值存储能力接口
///
/// 实现必须保证单条记录上的条件写入是原子的
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &RecordKey) -> StoreResult<Option<Versioned<Value>>>;

    /// 无条件写入，返回写入后的版本号
    async fn put(&self, key: &RecordKey, value: Value) -> StoreResult<u64>;

    /// 仅当键不存在时写入，返回版本号 1
    async fn put_if_absent(&self, key: &RecordKey, value: Value) -> StoreResult<u64>;

    /// 仅当存储版本等于 `expected_version` 时写入，返回新版本号
    async fn update_if_version(
        &self,
        key: &RecordKey,
        value: Value,
        expected_version: u64,
    ) -> StoreResult<u64>;

    async fn query_partition(&self, partition: &str) -> StoreResult<RecordStream>;
}
