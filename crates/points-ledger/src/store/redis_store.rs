//! Redis 存储
//!
//! 每条记录是一个 Redis Hash：`v` 字段为版本号，`d` 字段为 JSON 正文。
//! 每个分区维护一个有序集合索引（score 全为 0，按排序键字典序排列），
//! 条件写入通过 Lua 脚本在服务端原子执行。

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use serde_json::Value;
use tracing::{info, instrument};

use points_shared::config::RedisConfig;

use super::{KvStore, RecordKey, RecordStream, StoreError, StoreResult, StoredRecord, Versioned};

/// 键不存在时写入，同时登记分区索引
const PUT_IF_ABSENT_SCRIPT: &str = r#"
    if redis.call("EXISTS", KEYS[1]) == 1 then
        return -1
    end
    redis.call("HSET", KEYS[1], "v", 1, "d", ARGV[1])
    redis.call("ZADD", KEYS[2], 0, ARGV[2])
    return 1
"#;

/// 无条件写入，版本号在原值基础上加一
const PUT_SCRIPT: &str = r#"
    local v = redis.call("HINCRBY", KEYS[1], "v", 1)
    redis.call("HSET", KEYS[1], "d", ARGV[1])
    redis.call("ZADD", KEYS[2], 0, ARGV[2])
    return v
"#;

/// 版本号匹配时写入；-2 表示记录不存在，-1 表示版本冲突
const UPDATE_IF_VERSION_SCRIPT: &str = r#"
    local current = redis.call("HGET", KEYS[1], "v")
    if not current then
        return -2
    end
    if tonumber(current) ~= tonumber(ARGV[2]) then
        return -1
    end
    local next_version = tonumber(current) + 1
    redis.call("HSET", KEYS[1], "v", next_version, "d", ARGV[1])
    return next_version
"#;

/// Redis 键值存储
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    key_prefix: String,
    page_size: usize,
}

impl RedisStore {
    /// 创建 Redis 存储客户端
    pub fn new(config: &RedisConfig) -> StoreResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(unavailable)?;
        info!(key_prefix = %config.key_prefix, "Redis store client created");
        Ok(Self {
            client,
            key_prefix: config.key_prefix.clone(),
            page_size: config.page_size.max(1),
        })
    }

    async fn get_conn(&self) -> StoreResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)
    }

    /// 健康检查
    pub async fn health_check(&self) -> StoreResult<()> {
        let mut conn = self.get_conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(unavailable)
    }

    fn item_key(&self, key: &RecordKey) -> String {
        item_key(&self.key_prefix, &key.partition, &key.sort)
    }

    fn index_key(&self, partition: &str) -> String {
        format!("{}:idx:{}", self.key_prefix, partition)
    }
}

fn item_key(prefix: &str, partition: &str, sort: &str) -> String {
    format!("{}:rec:{}:{}", prefix, partition, sort)
}

fn unavailable(err: redis::RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn to_body(value: &Value) -> StoreResult<String> {
    serde_json::to_string(value)
        .map_err(|e| StoreError::Unavailable(format!("记录序列化失败: {}", e)))
}

fn from_body(key: &str, body: &str) -> StoreResult<Value> {
    serde_json::from_str(body)
        .map_err(|e| StoreError::Unavailable(format!("记录 {} 解析失败: {}", key, e)))
}

#[async_trait]
impl KvStore for RedisStore {
    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &RecordKey) -> StoreResult<Option<Versioned<Value>>> {
        let mut conn = self.get_conn().await?;
        let item_key = self.item_key(key);

        let (version, body): (Option<u64>, Option<String>) = redis::cmd("HMGET")
            .arg(&item_key)
            .arg("v")
            .arg("d")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        match (version, body) {
            (Some(version), Some(body)) => Ok(Some(Versioned {
                value: from_body(&item_key, &body)?,
                version,
            })),
            _ => Ok(None),
        }
    }

    #[instrument(skip(self, value), fields(key = %key))]
    async fn put(&self, key: &RecordKey, value: Value) -> StoreResult<u64> {
        let mut conn = self.get_conn().await?;

        Script::new(PUT_SCRIPT)
            .key(self.item_key(key))
            .key(self.index_key(&key.partition))
            .arg(to_body(&value)?)
            .arg(&key.sort)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)
    }

    #[instrument(skip(self, value), fields(key = %key))]
    async fn put_if_absent(&self, key: &RecordKey, value: Value) -> StoreResult<u64> {
        let mut conn = self.get_conn().await?;

        let result: i64 = Script::new(PUT_IF_ABSENT_SCRIPT)
            .key(self.item_key(key))
            .key(self.index_key(&key.partition))
            .arg(to_body(&value)?)
            .arg(&key.sort)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        if result < 0 {
            return Err(StoreError::AlreadyExists {
                key: key.to_string(),
            });
        }
        Ok(1)
    }

    #[instrument(skip(self, value), fields(key = %key))]
    async fn update_if_version(
        &self,
        key: &RecordKey,
        value: Value,
        expected_version: u64,
    ) -> StoreResult<u64> {
        let mut conn = self.get_conn().await?;

        let result: i64 = Script::new(UPDATE_IF_VERSION_SCRIPT)
            .key(self.item_key(key))
            .arg(to_body(&value)?)
            .arg(expected_version)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        match result {
            -2 => Err(StoreError::NotFound {
                key: key.to_string(),
            }),
            -1 => Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
            }),
            version => Ok(version as u64),
        }
    }

    /// 按页惰性读取分区，每页一次 ZRANGE 加一次 HMGET 管道
    async fn query_partition(&self, partition: &str) -> StoreResult<RecordStream> {
        let state = ScanState {
            conn: self.get_conn().await?,
            key_prefix: self.key_prefix.clone(),
            index_key: self.index_key(partition),
            partition: partition.to_string(),
            page_size: self.page_size,
            offset: 0,
            exhausted: false,
        };

        let stream = futures::stream::try_unfold(state, fetch_page)
            .map_ok(|page| futures::stream::iter(page.into_iter().map(Ok::<_, StoreError>)))
            .try_flatten()
            .boxed();

        Ok(stream)
    }
}

/// 分区扫描游标
struct ScanState {
    conn: MultiplexedConnection,
    key_prefix: String,
    index_key: String,
    partition: String,
    page_size: usize,
    offset: usize,
    exhausted: bool,
}

async fn fetch_page(mut state: ScanState) -> StoreResult<Option<(Vec<StoredRecord>, ScanState)>> {
    if state.exhausted {
        return Ok(None);
    }

    let stop = state.offset + state.page_size - 1;
    let sorts: Vec<String> = redis::cmd("ZRANGE")
        .arg(&state.index_key)
        .arg(state.offset)
        .arg(stop)
        .query_async(&mut state.conn)
        .await
        .map_err(unavailable)?;

    if sorts.is_empty() {
        return Ok(None);
    }
    state.exhausted = sorts.len() < state.page_size;
    state.offset += sorts.len();

    let mut pipe = redis::pipe();
    for sort in &sorts {
        pipe.cmd("HMGET")
            .arg(item_key(&state.key_prefix, &state.partition, sort))
            .arg("v")
            .arg("d");
    }
    let rows: Vec<(Option<u64>, Option<String>)> = pipe
        .query_async(&mut state.conn)
        .await
        .map_err(unavailable)?;

    let mut page = Vec::with_capacity(rows.len());
    for (sort, row) in sorts.into_iter().zip(rows) {
        // 索引先于正文可见时跳过
        if let (Some(version), Some(body)) = row {
            let key = RecordKey::new(state.partition.clone(), sort);
            page.push(StoredRecord {
                value: from_body(&key.to_string(), &body)?,
                key,
                version,
            });
        }
    }

    Ok(Some((page, state)))
}
