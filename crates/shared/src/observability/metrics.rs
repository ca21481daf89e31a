//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(service_name: &str, metrics_port: u16) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    register_common_metrics(service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

/// 注册指标描述，出现在 /metrics 端点的 HELP 注释中
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!("http_requests_total", "Total number of HTTP requests");
    metrics::describe_histogram!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds"
    );

    metrics::describe_counter!(
        "lock_acquisitions_total",
        "Lock acquisition attempts by outcome"
    );
    metrics::describe_histogram!(
        "lock_acquisition_wait_seconds",
        "Time spent waiting for a lock"
    );
    metrics::describe_counter!("lock_releases_total", "Lock releases by outcome");
    metrics::describe_counter!(
        "lock_renewals_total",
        "Lease renewal attempts by outcome"
    );

    metrics::describe_counter!(
        "leadership_transitions_total",
        "Leadership granted/revoked events"
    );
    metrics::describe_gauge!(
        "leader_is_leader",
        "1 when this instance currently holds leadership"
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

/// 获取全局 Prometheus handle
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 指标记录函数
// ============================================================================

/// 记录 HTTP 请求
#[inline]
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!(
        "http_requests_total",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status_str.clone()
    )
    .increment(1);

    metrics::histogram!(
        "http_request_duration_seconds",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status_str
    )
    .record(duration_secs);
}

/// 记录锁获取结果（acquired / timeout / cancelled / error）
#[inline]
pub fn record_lock_acquisition(outcome: &str, wait_secs: f64) {
    metrics::counter!("lock_acquisitions_total", "outcome" => outcome.to_string()).increment(1);
    metrics::histogram!("lock_acquisition_wait_seconds", "outcome" => outcome.to_string())
        .record(wait_secs);
}

/// 记录锁释放结果（released / mismatch / error）
#[inline]
pub fn record_lock_release(outcome: &str) {
    metrics::counter!("lock_releases_total", "outcome" => outcome.to_string()).increment(1);
}

/// 记录租约续期结果（renewed / lost / error）
#[inline]
pub fn record_lock_renewal(outcome: &str) {
    metrics::counter!("lock_renewals_total", "outcome" => outcome.to_string()).increment(1);
}

/// 记录选主事件并更新当前是否为 leader
#[inline]
pub fn record_leadership_transition(role: &str, event: &str, is_leader: bool) {
    metrics::counter!(
        "leadership_transitions_total",
        "role" => role.to_string(),
        "event" => event.to_string()
    )
    .increment(1);

    metrics::gauge!("leader_is_leader", "role" => role.to_string())
        .set(if is_leader { 1.0 } else { 0.0 });
}
