//! 订单消费服务
//!
//! 以消费组成员身份从 Redis Stream 读取订单，按固定间隔有限重试，
//! 成功后确认，重试耗尽后转入死信 stream 再确认。

pub mod consumer;
pub mod error;
pub mod handler;
