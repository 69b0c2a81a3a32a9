//! 订单生产者
//!
//! 每个订单编码为 JSON，作为唯一的 `data` 字段追加到 stream。
//! 追加失败直接返回给调用方，生产者内部不做重试。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use order_stream_shared::error::Result;
use order_stream_shared::observability::metrics;
use order_stream_shared::order::Order;
use order_stream_shared::stream::StreamTransport;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument};

use crate::generator::OrderGenerator;

/// 订单生产者
pub struct OrderProducer {
    transport: Arc<dyn StreamTransport>,
    stream: String,
    produced: AtomicU64,
}

impl OrderProducer {
    pub fn new(transport: Arc<dyn StreamTransport>, stream: impl Into<String>) -> Self {
        Self {
            transport,
            stream: stream.into(),
            produced: AtomicU64::new(0),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// 成功追加的订单数
    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    /// 追加一个订单，返回存储分配的条目 ID
    #[instrument(skip(self, order), fields(stream = %self.stream, order_id = %order.id))]
    pub async fn produce(&self, order: &Order) -> Result<String> {
        let payload = order.encode()?;
        let id = self.transport.append(&self.stream, &payload).await?;

        self.produced.fetch_add(1, Ordering::Relaxed);
        metrics::record_produced(&self.stream);
        info!(
            message_id = %id,
            item = %order.item,
            amount = order.amount,
            "订单已发送"
        );
        Ok(id)
    }
}

/// 发送循环的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    pub sent: u64,
    pub failed: u64,
}

impl ProducerStats {
    pub fn attempted(&self) -> u64 {
        self.sent + self.failed
    }
}

/// 按固定间隔发送随机订单，直到收到 shutdown 信号或达到 `limit`
///
/// 第一个订单立即发送。单次发送失败只记录日志，循环继续。
pub async fn run_producer_loop(
    producer: &OrderProducer,
    generator: &OrderGenerator,
    interval: Duration,
    limit: Option<u64>,
    mut shutdown: watch::Receiver<bool>,
) -> ProducerStats {
    let mut stats = ProducerStats::default();
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        stream = %producer.stream(),
        interval_ms = interval.as_millis() as u64,
        limit = ?limit,
        "订单生产者已启动"
    );

    while limit.is_none_or(|limit| stats.attempted() < limit) {
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            _ = ticker.tick() => {}
        }

        let order = generator.next_order();
        match producer.produce(&order).await {
            Ok(_) => stats.sent += 1,
            Err(e) => {
                stats.failed += 1;
                error!(order_id = %order.id, error = %e, "发送订单失败");
            }
        }
    }

    info!(sent = stats.sent, failed = stats.failed, "订单生产者已停止");
    stats
}
