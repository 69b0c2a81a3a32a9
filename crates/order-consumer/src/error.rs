//! 消费服务专用错误类型
//!
//! 区分进程级致命错误（建组失败）与单次读取失败，
//! 单条消息的处理失败由 [`ProcessingError`] 描述，只影响该消息的重试与死信路由。

use order_stream_shared::error::StreamError;

use crate::handler::HandlerError;

/// 消费循环错误
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    /// 在重试预算内仍无法创建消费组，进程应当退出
    #[error("消费组初始化失败: {0}")]
    Bootstrap(#[source] StreamError),

    /// 读取消息失败，由循环记录后退避重试
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// 单次处理尝试的失败原因
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    /// 负载缺失或不是合法的订单 JSON
    #[error("消息解码失败: {0}")]
    Decode(#[from] StreamError),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

impl ProcessingError {
    /// 是否应跳过剩余的重试次数
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Handler(HandlerError::Permanent(_)))
    }
}
