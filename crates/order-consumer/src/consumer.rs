//! 订单消费循环
//!
//! 每个消费者身份运行一个循环：阻塞读取 -> 逐条处理 -> 确认或转入死信。
//!
//! 单条消息的状态流转：
//! `Delivered -> Retrying(k) -> Acknowledged | DeadLettered`，
//! 死信写入成功后总会确认原消息。处理中途收到关闭信号的消息不确认，
//! 保持在本消费者的待确认列表中，重启后通过待确认恢复重新处理。

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use order_stream_shared::config::AppConfig;
use order_stream_shared::dlq::{self, DeadLetterEntry, FailureMetadata};
use order_stream_shared::error::StreamError;
use order_stream_shared::observability::metrics::{self, outcome};
use order_stream_shared::order::Order;
use order_stream_shared::retry::{RetryPolicy, retry_with_policy};
use order_stream_shared::stream::{
    GroupStatus, MIN_CONSUMER_BLOCK, ReadCursor, ReadOptions, StreamMessage, StreamTransport,
    message_count,
};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{ConsumerError, ProcessingError};
use crate::handler::OrderHandler;

// ---------------------------------------------------------------------------
// 配置
// ---------------------------------------------------------------------------

/// 消费者配置
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub stream: String,
    pub group: String,
    /// 组内的消费者身份
    pub consumer: String,
    pub batch_size: usize,
    /// 阻塞读时长，不足 [`MIN_CONSUMER_BLOCK`] 时按该值处理
    pub block: Duration,
    /// 单条消息的重试策略（总尝试次数 = max_retries + 1）
    pub retry: RetryPolicy,
    /// 建组失败时的退避策略
    pub bootstrap_retry: RetryPolicy,
    /// 读取失败后的退避策略
    pub read_backoff: RetryPolicy,
    pub recover_pending: bool,
    pub dlq_metadata: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            stream: "orders".to_string(),
            group: "order_group".to_string(),
            consumer: "consumer-1".to_string(),
            batch_size: 10,
            block: Duration::from_secs(5),
            retry: RetryPolicy::message_default(),
            bootstrap_retry: RetryPolicy {
                max_retries: 5,
                ..RetryPolicy::default()
            },
            read_backoff: RetryPolicy::read_backoff(),
            recover_pending: true,
            dlq_metadata: false,
        }
    }
}

impl ConsumerConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        let max_attempts = config.consumer.max_attempts.max(1);
        Self {
            stream: config.stream.name.clone(),
            group: config.stream.group.clone(),
            consumer: config.consumer.name.clone(),
            batch_size: config.stream.batch_size.max(1),
            block: config.stream.block(),
            retry: RetryPolicy::fixed(
                max_attempts - 1,
                Duration::from_millis(config.consumer.retry_delay_ms),
            ),
            recover_pending: config.consumer.recover_pending,
            dlq_metadata: config.stream.dlq_metadata,
            ..Self::default()
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry.max_attempts()
    }
}

// ---------------------------------------------------------------------------
// 处理结果
// ---------------------------------------------------------------------------

/// 单条消息的最终结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// 处理成功，已确认
    Acknowledged,
    /// 重试耗尽，已写入死信 stream 并确认
    DeadLettered,
    /// 死信写入失败，消息保持待确认
    DeadLetterFailed,
    /// 因关闭而中断，消息保持待确认
    Abandoned,
}

impl MessageOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Acknowledged => outcome::ACKED,
            Self::DeadLettered => outcome::DEAD_LETTERED,
            Self::DeadLetterFailed => outcome::DLQ_FAILED,
            Self::Abandoned => outcome::ABANDONED,
        }
    }
}

/// 一次读取与处理的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// 本次读取到的消息数
    pub received: usize,
    pub acknowledged: usize,
    pub dead_lettered: usize,
    pub dead_letter_failed: usize,
    pub abandoned: usize,
    /// XACK 失败的次数，这些消息保持待确认，重启后才会被恢复
    pub ack_failures: usize,
}

impl PollSummary {
    fn record(&mut self, outcome: MessageOutcome) {
        match outcome {
            MessageOutcome::Acknowledged => self.acknowledged += 1,
            MessageOutcome::DeadLettered => self.dead_lettered += 1,
            MessageOutcome::DeadLetterFailed => self.dead_letter_failed += 1,
            MessageOutcome::Abandoned => self.abandoned += 1,
        }
    }

    /// 处理后仍未确认的消息数
    pub fn left_pending(&self) -> usize {
        self.dead_letter_failed + self.abandoned + self.ack_failures
    }
}

struct Settled {
    outcome: MessageOutcome,
    ack_failed: bool,
}

impl From<MessageOutcome> for Settled {
    fn from(outcome: MessageOutcome) -> Self {
        Self {
            outcome,
            ack_failed: false,
        }
    }
}

// ---------------------------------------------------------------------------
// OrderConsumer
// ---------------------------------------------------------------------------

/// 订单消费者
///
/// 组合传输层（读取 / 确认 / 死信追加）与业务处理器，
/// 多个消费者身份可以共享同一个消费组，每条消息只会投递给其中一个。
pub struct OrderConsumer {
    transport: Arc<dyn StreamTransport>,
    handler: Arc<dyn OrderHandler>,
    config: ConsumerConfig,
    dead_letter_stream: String,
}

impl OrderConsumer {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        handler: Arc<dyn OrderHandler>,
        mut config: ConsumerConfig,
    ) -> Self {
        config.block = config.block.max(MIN_CONSUMER_BLOCK);
        let dead_letter_stream = dlq::dead_letter_stream(&config.stream);
        Self {
            transport,
            handler,
            config,
            dead_letter_stream,
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn dead_letter_stream(&self) -> &str {
        &self.dead_letter_stream
    }

    /// 幂等地创建消费组，传输故障按退避策略重试
    pub async fn bootstrap(&self) -> Result<GroupStatus, ConsumerError> {
        retry_with_policy(
            &self.config.bootstrap_retry,
            "ensure_group",
            StreamError::is_retryable,
            || {
                self.transport
                    .ensure_group(&self.config.stream, &self.config.group)
            },
        )
        .await
        .map_err(ConsumerError::Bootstrap)
    }

    /// 启动消费循环，直到收到 shutdown 信号
    ///
    /// 只有建组失败会返回错误；读取、处理、确认中的故障都在循环内消化。
    /// shutdown 的发送端被 drop 同样视为关闭。
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConsumerError> {
        let status = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => {
                info!("启动阶段收到关闭信号");
                return Ok(());
            }
            status = self.bootstrap() => status?,
        };

        info!(
            stream = %self.config.stream,
            group = %self.config.group,
            consumer = %self.config.consumer,
            group_status = ?status,
            "订单消费者已启动"
        );

        let mut cursor = if self.config.recover_pending {
            ReadCursor::Pending
        } else {
            ReadCursor::New
        };
        let mut read_failures: u32 = 0;

        while !is_shutdown(&shutdown) {
            match self.poll_once(cursor, &mut shutdown).await {
                Ok(summary) => {
                    read_failures = 0;

                    if cursor == ReadCursor::Pending
                        && (summary.received == 0 || summary.left_pending() > 0)
                    {
                        if summary.left_pending() > 0 {
                            warn!(
                                left_pending = summary.left_pending(),
                                "部分待确认消息仍未完成，留待下次启动恢复"
                            );
                        }
                        info!("待确认消息恢复完成，开始读取新消息");
                        cursor = ReadCursor::New;
                    }
                }
                Err(e) => {
                    metrics::record_read_error(&self.config.stream);
                    let delay = self.config.read_backoff.delay_for_attempt(read_failures);
                    read_failures = read_failures.saturating_add(1);
                    error!(
                        stream = %self.config.stream,
                        consumer = %self.config.consumer,
                        error = %e,
                        consecutive_failures = read_failures,
                        delay_ms = delay.as_millis() as u64,
                        "读取消息失败，退避后重试"
                    );
                    if sleep_or_shutdown(delay, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        info!(consumer = %self.config.consumer, "订单消费者已停止");
        Ok(())
    }

    /// 执行一次读取并依次处理读到的消息
    ///
    /// 阻塞读与 shutdown 竞争，收到关闭信号时返回空统计。
    /// 尚未开始处理的消息在关闭后计为 abandoned，保持待确认。
    #[instrument(
        skip(self, shutdown),
        fields(stream = %self.config.stream, consumer = %self.config.consumer)
    )]
    pub async fn poll_once(
        &self,
        cursor: ReadCursor,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<PollSummary, ConsumerError> {
        let options = ReadOptions::new(cursor, self.config.batch_size, self.config.block);
        let read = self.transport.read_group(
            &self.config.stream,
            &self.config.group,
            &self.config.consumer,
            options,
        );

        let batches = tokio::select! {
            biased;
            _ = wait_for_shutdown(shutdown) => return Ok(PollSummary::default()),
            result = read => result?,
        };

        let mut summary = PollSummary {
            received: message_count(&batches),
            ..Default::default()
        };
        if summary.received > 0 {
            debug!(count = summary.received, "读取到消息");
        }

        for message in batches.iter().flat_map(|b| b.messages.iter()) {
            let started = Instant::now();
            let settled = if is_shutdown(shutdown) {
                Settled::from(MessageOutcome::Abandoned)
            } else {
                self.process_message(message, shutdown).await
            };

            summary.record(settled.outcome);
            if settled.ack_failed {
                summary.ack_failures += 1;
            }
            metrics::record_message_outcome(&self.config.stream, settled.outcome.label());
            metrics::record_processing_duration(
                &self.config.stream,
                started.elapsed().as_secs_f64(),
            );
        }

        Ok(summary)
    }

    /// 处理单条消息：有限次尝试后确认或转入死信
    #[instrument(skip(self, message, shutdown), fields(message_id = %message.id))]
    async fn process_message(
        &self,
        message: &StreamMessage,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Settled {
        let max_attempts = self.config.max_attempts();
        let mut attempt: u32 = 0;

        let last_error = loop {
            attempt += 1;
            let err = match self.attempt(message).await {
                Ok(order) => {
                    metrics::record_handler_attempt(true);
                    debug!(order_id = %order.id, attempt, "订单处理成功");
                    return self.acknowledge(message, MessageOutcome::Acknowledged).await;
                }
                Err(e) => e,
            };
            metrics::record_handler_attempt(false);

            if err.is_permanent() || attempt >= max_attempts {
                break err;
            }

            let delay = self.config.retry.delay_for_attempt(attempt - 1);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "订单处理失败，稍后重试"
            );
            if sleep_or_shutdown(delay, shutdown).await {
                warn!(attempt, "收到关闭信号，中断处理，消息保持待确认");
                return Settled::from(MessageOutcome::Abandoned);
            }
        };

        error!(
            attempts = attempt,
            error = %last_error,
            dead_letter_stream = %self.dead_letter_stream,
            "订单处理失败，转入死信队列"
        );

        match self.dead_letter(message, attempt, &last_error).await {
            Ok(dlq_id) => {
                info!(dlq_id = %dlq_id, "已写入死信队列");
                self.acknowledge(message, MessageOutcome::DeadLettered)
                    .await
            }
            Err(e) => {
                metrics::record_dead_letter_failure(&self.config.stream);
                error!(
                    error = %e,
                    "写入死信队列失败，消息保持待确认，重启后通过待确认恢复重新处理"
                );
                Settled::from(MessageOutcome::DeadLetterFailed)
            }
        }
    }

    /// 单次尝试：解码负载并调用处理器
    async fn attempt(&self, message: &StreamMessage) -> Result<Order, ProcessingError> {
        let order = Order::decode(message.require_payload()?)?;
        self.handler.handle(&order).await?;
        Ok(order)
    }

    /// 将原始负载逐字节复制到死信 stream
    ///
    /// 原条目没有 `data` 字段时按原样复制它的全部字段。
    async fn dead_letter(
        &self,
        message: &StreamMessage,
        attempts: u32,
        last_error: &ProcessingError,
    ) -> Result<String, StreamError> {
        let metadata = self.config.dlq_metadata.then(|| FailureMetadata {
            source_stream: self.config.stream.clone(),
            source_id: message.id.clone(),
            attempts,
            error: last_error.to_string(),
            failed_at: Utc::now(),
        });

        let fields = match message.payload() {
            Some(payload) => match metadata {
                Some(metadata) => DeadLetterEntry::with_metadata(payload, metadata),
                None => DeadLetterEntry::raw(payload),
            }
            .into_fields(),
            None => {
                warn!(
                    message_id = %message.id,
                    fields = ?message.fields.keys().collect::<Vec<_>>(),
                    "原消息缺少 data 字段，按原字段写入死信"
                );
                dlq::verbatim_fields(message, metadata)
            }
        };

        self.transport
            .append_entry(&self.dead_letter_stream, fields)
            .await
    }

    async fn acknowledge(&self, message: &StreamMessage, outcome: MessageOutcome) -> Settled {
        match self
            .transport
            .ack(&self.config.stream, &self.config.group, &message.id)
            .await
        {
            Ok(0) => {
                // 消息已不在本组的待确认列表中（例如已被其他消费者认领）
                warn!(message_id = %message.id, "确认返回 0，消息可能已被确认");
                Settled::from(outcome)
            }
            Ok(_) => Settled::from(outcome),
            Err(e) => {
                metrics::record_ack_failure(&self.config.stream);
                error!(
                    message_id = %message.id,
                    error = %e,
                    "确认消息失败，消息保持待确认，重启后通过待确认恢复重新处理"
                );
                Settled {
                    outcome,
                    ack_failed: true,
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// shutdown 辅助
// ---------------------------------------------------------------------------

fn is_shutdown(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// 等待关闭信号；发送端被 drop 时立即返回
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// 休眠指定时长，期间收到关闭信号返回 true
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        _ = wait_for_shutdown(shutdown) => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
