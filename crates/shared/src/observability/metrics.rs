//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 未安装 recorder 时所有记录函数都是空操作，测试中可以直接调用。

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

/// 消息处理结果标签
pub mod outcome {
    pub const ACKED: &str = "acked";
    pub const DEAD_LETTERED: &str = "dead_lettered";
    pub const DLQ_FAILED: &str = "dlq_failed";
    pub const ABANDONED: &str = "abandoned";
}

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

    register_stream_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

/// 注册队列相关指标的描述，出现在 /metrics 的 HELP 注释中
fn register_stream_metrics(service_name: &str) {
    metrics::describe_counter!("orders_produced_total", "Total number of orders appended");
    metrics::describe_counter!(
        "stream_messages_total",
        "Messages that reached a final outcome, labelled by outcome"
    );
    metrics::describe_counter!(
        "stream_handler_attempts_total",
        "Handler invocations, labelled by result"
    );
    metrics::describe_counter!("stream_read_errors_total", "Failed XREADGROUP calls");
    metrics::describe_counter!("stream_ack_failures_total", "Failed XACK calls");
    metrics::describe_counter!(
        "stream_dead_letter_failures_total",
        "Failed appends to the dead-letter stream"
    );
    metrics::describe_histogram!(
        "stream_message_processing_seconds",
        "Time from delivery to final outcome in seconds"
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
// 便捷的指标记录函数
// ============================================================================

/// 记录一次成功追加的订单
#[inline]
pub fn record_produced(stream: &str) {
    metrics::counter!("orders_produced_total", "stream" => stream.to_string()).increment(1);
}

/// 记录消息的最终结果（见 [`outcome`]）
#[inline]
pub fn record_message_outcome(stream: &str, outcome: &'static str) {
    metrics::counter!(
        "stream_messages_total",
        "stream" => stream.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// 记录一次处理器调用
#[inline]
pub fn record_handler_attempt(success: bool) {
    let result = if success { "ok" } else { "error" };
    metrics::counter!("stream_handler_attempts_total", "result" => result).increment(1);
}

#[inline]
pub fn record_read_error(stream: &str) {
    metrics::counter!("stream_read_errors_total", "stream" => stream.to_string()).increment(1);
}

#[inline]
pub fn record_ack_failure(stream: &str) {
    metrics::counter!("stream_ack_failures_total", "stream" => stream.to_string()).increment(1);
}

#[inline]
pub fn record_dead_letter_failure(stream: &str) {
    metrics::counter!(
        "stream_dead_letter_failures_total",
        "stream" => stream.to_string()
    )
    .increment(1);
}

/// 记录从收到消息到得出最终结果的耗时
#[inline]
pub fn record_processing_duration(stream: &str, duration_secs: f64) {
    metrics::histogram!(
        "stream_message_processing_seconds",
        "stream" => stream.to_string()
    )
    .record(duration_secs);
}
