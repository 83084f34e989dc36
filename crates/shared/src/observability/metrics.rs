//! 通知链路指标
//!
//! 业务代码只调用本模块的 `record_*` 函数，指标名与标签集中在此维护。
//! 导出端点与业务端口分离。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Metrics 资源守卫
pub struct MetricsHandle {
    server_handle: tokio::task::JoinHandle<()>,
}

impl Drop for MetricsHandle {
    fn drop(&mut self) {
        self.server_handle.abort();
    }
}

/// 安装全局 recorder 并在 `port` 上提供 `/metrics` 与 `/health`
pub async fn init(service_name: &str, port: u16) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_notification_metrics(service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle { server_handle })
}

/// 注册通知链路的指标描述
fn register_notification_metrics(service_name: &str) {
    metrics::describe_counter!(
        "notifications_sent_total",
        "Total number of notifications accepted for delivery"
    );
    metrics::describe_histogram!(
        "notification_dispatch_duration_seconds",
        "Time spent dispatching a notification over its channels"
    );
    metrics::describe_counter!(
        "notification_channel_deliveries_total",
        "Per-channel delivery outcomes"
    );
    metrics::describe_counter!(
        "notification_store_failures_total",
        "Failed writes per storage leg"
    );
    metrics::describe_counter!("broker_reconnects_total", "Successful broker reconnections");
    metrics::describe_counter!(
        "notification_retry_republished_total",
        "Notifications republished by the retry sweep"
    );
    metrics::describe_counter!(
        "notifications_expired_deleted_total",
        "Expired notification records removed by the sweep"
    );
    metrics::describe_counter!(
        "in_app_dropped_total",
        "In-app copies dropped because a subscriber queue was full"
    );
    metrics::describe_gauge!(
        "worker_last_run_timestamp_seconds",
        "Unix timestamp of the last completed background worker pass"
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
    info!("指标服务监听于 {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("指标服务异常退出: {}", e);
        }
    });

    Ok(server_handle)
}

// ============================================================================
// 指标记录函数
// ============================================================================

/// 记录一条被受理的通知
#[inline]
pub fn record_notification_sent(category: &str, notification_type: &str) {
    metrics::counter!(
        "notifications_sent_total",
        "category" => category.to_string(),
        "type" => notification_type.to_string()
    )
    .increment(1);
}

/// 记录分发耗时
#[inline]
pub fn record_dispatch_duration(category: &str, duration_secs: f64) {
    metrics::histogram!(
        "notification_dispatch_duration_seconds",
        "category" => category.to_string()
    )
    .record(duration_secs);
}

/// 记录单个渠道的投递结果
#[inline]
pub fn record_channel_delivery(method: &str, outcome: &str) {
    metrics::counter!(
        "notification_channel_deliveries_total",
        "method" => method.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// 记录存储写入失败（leg: metadata / broker）
#[inline]
pub fn record_store_failure(leg: &'static str) {
    metrics::counter!("notification_store_failures_total", "leg" => leg).increment(1);
}

#[inline]
pub fn record_broker_reconnect() {
    metrics::counter!("broker_reconnects_total").increment(1);
}

#[inline]
pub fn record_retry_republished(count: u64) {
    metrics::counter!("notification_retry_republished_total").increment(count);
}

#[inline]
pub fn record_expired_deleted(count: u64) {
    metrics::counter!("notifications_expired_deleted_total").increment(count);
}

#[inline]
pub fn record_in_app_dropped() {
    metrics::counter!("in_app_dropped_total").increment(1);
}

/// 记录后台 Worker 最近一次完成的时间
#[inline]
pub fn set_worker_last_run(worker: &'static str) {
    metrics::gauge!("worker_last_run_timestamp_seconds", "worker" => worker)
        .set(chrono::Utc::now().timestamp() as f64);
}
