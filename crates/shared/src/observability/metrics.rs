//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。
//! 未安装 recorder 时所有记录函数均为空操作。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::ObservabilityConfig;

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    register_common_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

/// 注册积分核心的指标描述
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "ledger_operations_total",
        "Total number of ledger credit/debit operations by result"
    );
    metrics::describe_counter!(
        "ledger_version_conflicts_total",
        "Conditional updates rejected because the balance version advanced"
    );
    metrics::describe_counter!(
        "ledger_retry_exhausted_total",
        "Ledger operations that consumed the whole retry budget"
    );
    metrics::describe_counter!(
        "achievements_completed_total",
        "Achievement completions by result"
    );
    metrics::describe_counter!("redemptions_total", "Reward redemptions by result");
    metrics::describe_histogram!(
        "redemption_duration_seconds",
        "Reward redemption duration in seconds"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

/// 获取全局 Prometheus handle（用于自定义渲染）
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 指标记录函数
// ============================================================================

/// 记录一次账本操作
///
/// `op` 为 credit/debit，`result` 为 applied/replayed/insufficient/error
#[inline]
pub fn record_ledger_operation(op: &str, result: &str) {
    metrics::counter!(
        "ledger_operations_total",
        "op" => op.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

/// 记录一次版本冲突
#[inline]
pub fn record_version_conflict(op: &str) {
    metrics::counter!("ledger_version_conflicts_total", "op" => op.to_string()).increment(1);
}

/// 记录一次重试预算耗尽
#[inline]
pub fn record_retry_exhausted(op: &str) {
    metrics::counter!("ledger_retry_exhausted_total", "op" => op.to_string()).increment(1);
}

/// 记录成就完成
#[inline]
pub fn record_achievement_completion(result: &str) {
    metrics::counter!("achievements_completed_total", "result" => result.to_string())
        .increment(1);
}

/// 记录兑换
///
/// `result` 为 redeemed/replayed 或错误码
#[inline]
pub fn record_redemption(result: &str, duration_secs: f64) {
    metrics::counter!("redemptions_total", "result" => result.to_string()).increment(1);
    metrics::histogram!("redemption_duration_seconds").record(duration_secs);
}
