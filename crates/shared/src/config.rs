//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::observability::ObservabilityConfig;
use crate::retry::RetryPolicy;

/// Redis 存储配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// 所有记录键的前缀，用于多个环境共用同一 Redis 实例
    pub key_prefix: String,
    /// 分区扫描时每页读取的记录数
    pub page_size: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "points".to_string(),
            page_size: 100,
        }
    }
}

/// 积分账本配置
///
/// 控制乐观并发的重试上限和退避区间
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// 版本冲突后的最大重试次数（不含首次尝试）
    pub max_retries: u32,
    /// 首次退避的基准时长（毫秒）
    pub backoff_base_ms: u64,
    /// 退避时长上限（毫秒）
    pub backoff_cap_ms: u64,
    /// 余额记录上保留的最近已应用操作数量
    pub idempotency_window: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base_ms: 10,
            backoff_cap_ms: 200,
            idempotency_window: 128,
        }
    }
}

impl LedgerConfig {
    /// 转换为账本重试循环使用的退避策略
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_cap_ms),
            multiplier: 2.0,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub redis: RedisConfig,
    pub ledger: LedgerConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. .env 文件（仅开发环境存在时）
    /// 2. config/default.toml（默认配置）
    /// 3. config/{environment}.toml（环境特定配置）
    /// 4. config/{service_name}.toml（服务特定配置）
    /// 5. 环境变量（POINTS_ 前缀，双下划线分隔层级，如 POINTS_LEDGER__MAX_RETRIES -> ledger.max_retries）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let env = std::env::var("POINTS_ENV").unwrap_or_else(|_| "development".to_string());
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .set_default("observability.service_name", service_name)?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", service_name)))
                    .required(false),
            )
            .add_source(
                Environment::with_prefix("POINTS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.ledger.max_retries, 5);
        assert_eq!(config.ledger.idempotency_window, 128);
        assert_eq!(config.redis.key_prefix, "points");
        assert!(!config.is_production());
    }

    #[test]
    fn test_ledger_retry_policy() {
        let ledger = LedgerConfig {
            max_retries: 7,
            backoff_base_ms: 5,
            backoff_cap_ms: 50,
            idempotency_window: 16,
        };
        let policy = ledger.retry_policy();
        assert_eq!(policy.max_retries, 7);
        assert_eq!(policy.initial_delay, Duration::from_millis(5));
        assert_eq!(policy.max_delay, Duration::from_millis(50));
    }

    #[test]
    fn test_load_without_files_uses_defaults() {
        // SAFETY: 测试只读取不存在的目录，不修改其他测试依赖的变量
        unsafe {
            std::env::set_var("CONFIG_DIR", "/nonexistent-points-config");
        }

        let config = AppConfig::load("points-ledger").unwrap();
        assert_eq!(config.service_name, "points-ledger");
        assert_eq!(config.observability.service_name, "points-ledger");
        assert_eq!(config.redis.page_size, 100);

        unsafe {
            std::env::remove_var("CONFIG_DIR");
        }
    }
}
