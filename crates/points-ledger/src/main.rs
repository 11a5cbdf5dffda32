//! 积分账本命令行入口
//!
//! 配置与日志初始化后执行单个子命令。业务错误以 JSON 输出到 stderr，进程退出码为 1。

mod cli;

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use points_ledger::PointsError;
use points_shared::{config::AppConfig, observability};
use tracing::{error, info};

use cli::{Cli, CommandRunner};

const SERVICE_NAME: &str = "points-ledger";

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // 1. 统一加载配置
    let config = AppConfig::load(SERVICE_NAME).unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig::default()
    });

    // 2. 初始化日志与指标
    let obs_config = config
        .observability
        .clone()
        .with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config).await?;
    info!(environment = %config.environment, "Configuration loaded");

    // 3. 装配服务并执行命令
    let runner = CommandRunner::connect(
        &config,
        Duration::from_millis(cli.timeout_ms),
        cli.request_retries,
    )
    .await?;

    match runner.run(cli.command).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(err) => match err.downcast_ref::<PointsError>() {
            Some(points_err) => {
                error!(code = points_err.error_code(), error = %points_err, "命令执行失败");
                eprintln!(
                    "{}",
                    serde_json::json!({
                        "error": points_err.error_code(),
                        "message": points_err.to_string(),
                        "retryable": points_err.is_retryable(),
                    })
                );
                Ok(ExitCode::FAILURE)
            }
            None => Err(err),
        },
    }
}
