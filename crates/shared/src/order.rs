//! 订单消息模型
//!
//! 定义在 stream 中传递的订单负载及其编解码方式。
//! 负载以紧凑 JSON 形式写入条目的 `data` 字段，编解码必须无损往返。

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StreamError};

/// 订单事件
///
/// 创建后不可变。`id` 由生产者分配且全局唯一，
/// 重试和进入死信队列的副本都依靠它追溯到源订单。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub item: String,
    pub amount: i64,
}

impl Order {
    /// 使用随机 UUID 创建订单
    pub fn new(item: impl Into<String>, amount: i64) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), item, amount)
    }

    pub fn with_id(id: impl Into<String>, item: impl Into<String>, amount: i64) -> Self {
        Self {
            id: id.into(),
            item: item.into(),
            amount,
        }
    }

    /// 编码为写入 stream 的字节负载
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(StreamError::from)
    }

    /// 从 stream 负载解码
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| StreamError::Serialization(format!("订单负载反序列化失败: {e}")))
    }
}
