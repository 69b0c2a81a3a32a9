//! 订单业务处理器
//!
//! 消费循环只负责投递、重试与确认，具体业务通过 [`OrderHandler`] 注入。
//! 同一次投递中处理器最多被调用 `max_attempts` 次，实现需要能承受重复调用。

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use order_stream_shared::order::Order;
use tracing::info;

/// 处理器返回的失败
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// 瞬时故障，按重试策略再次尝试
    #[error("可重试的处理失败: {0}")]
    Retryable(String),

    /// 重试也不会成功的失败，直接进入死信
    #[error("不可重试的处理失败: {0}")]
    Permanent(String),
}

/// 订单处理器接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderHandler: Send + Sync {
    async fn handle(&self, order: &Order) -> Result<(), HandlerError>;
}

/// 将异步闭包适配为处理器
///
/// ```ignore
/// let handler = FnHandler::new(|order: Order| async move {
///     if order.amount <= 0 {
///         return Err(HandlerError::Permanent("金额非法".into()));
///     }
///     Ok(())
/// });
/// ```
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> OrderHandler for FnHandler<F>
where
    F: Fn(Order) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, order: &Order) -> Result<(), HandlerError> {
        (self.f)(order.clone()).await
    }
}

/// 默认业务处理器：记录订单并模拟一段处理耗时
#[derive(Debug, Clone)]
pub struct LoggingHandler {
    work: Duration,
}

impl LoggingHandler {
    pub fn new(work: Duration) -> Self {
        Self { work }
    }
}

impl Default for LoggingHandler {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl OrderHandler for LoggingHandler {
    async fn handle(&self, order: &Order) -> Result<(), HandlerError> {
        info!(
            order_id = %order.id,
            item = %order.item,
            amount = order.amount,
            "处理订单"
        );
        tokio::time::sleep(self.work).await;
        Ok(())
    }
}
