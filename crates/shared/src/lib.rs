//! 共享库
//!
//! 包含生产者与消费者共用的配置、错误处理、订单模型、Redis Stream 传输层、
//! 死信队列、重试策略与可观测性等基础设施代码。

pub mod config;
pub mod dlq;
pub mod error;
pub mod observability;
pub mod order;
pub mod retry;
pub mod stream;
pub mod test_utils;
