//! 订单生产服务
//!
//! 将订单编码为 JSON 追加到 Redis Stream，并提供随机订单生成器和定时发送循环。

pub mod generator;
pub mod producer;
