//! Redis Stream 传输层抽象
//!
//! 将有序、持久、支持多消费者的日志抽象为四个操作：幂等建组、追加、
//! 阻塞式组读取和确认。消费循环和生产者只依赖 [`StreamTransport`]，
//! 生产环境使用 [`RedisStream`]，测试使用内存实现。

mod redis_stream;

pub use self::redis_stream::RedisStream;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, StreamError};

/// 每条主 stream 条目携带的唯一字段名
pub const DATA_FIELD: &str = "data";

/// 消费循环使用的最短阻塞时长
///
/// `block` 为零表示非阻塞读取（Redis 中则省略 BLOCK 参数），消费循环必须至少阻塞这么久，
/// 否则空 stream 上会空转。
pub const MIN_CONSUMER_BLOCK: Duration = Duration::from_millis(1);

// ---------------------------------------------------------------------------
// 读取参数与结果类型
// ---------------------------------------------------------------------------

/// 建组结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Created,
    /// 消费组已存在，游标保持不变
    AlreadyExists,
}

/// 组读取的起始位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    /// 只读取从未投递给本组的新消息（`>`）
    New,
    /// 重新读取已投递给本消费者但尚未确认的消息（`0`）
    Pending,
}

impl ReadCursor {
    /// XREADGROUP 的 ID 参数
    pub fn as_id(&self) -> &'static str {
        match self {
            Self::New => ">",
            Self::Pending => "0",
        }
    }
}

/// 组读取参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    pub cursor: ReadCursor,
    pub count: usize,
    /// 无数据时的最长阻塞时间，超时返回空结果而不是错误；为零时不阻塞
    pub block: Duration,
}

impl ReadOptions {
    pub fn new(cursor: ReadCursor, count: usize, block: Duration) -> Self {
        Self {
            cursor,
            count,
            block,
        }
    }
}

/// stream 中的一条消息
///
/// `id` 由存储分配、在 stream 内单调递增，仅用于确认，不会复用。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub id: String,
    pub fields: HashMap<String, Vec<u8>>,
}

impl StreamMessage {
    /// 构造只带 `data` 字段的消息
    pub fn new(id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            fields: HashMap::from([(DATA_FIELD.to_string(), payload)]),
        }
    }

    /// 原始负载（`data` 字段）
    pub fn payload(&self) -> Option<&[u8]> {
        self.fields.get(DATA_FIELD).map(Vec::as_slice)
    }

    /// 原始负载，缺失时返回 `MissingField`
    pub fn require_payload(&self) -> Result<&[u8]> {
        self.payload().ok_or_else(|| StreamError::MissingField {
            id: self.id.clone(),
            field: DATA_FIELD.to_string(),
        })
    }

    /// 以 UTF-8 字符串读取任意字段
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .and_then(|v| std::str::from_utf8(v).ok())
    }
}

/// 一次组读取中来自同一 stream 的消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamBatch {
    pub stream: String,
    pub messages: Vec<StreamMessage>,
}

/// 统计读取结果中的消息总数
pub fn message_count(batches: &[StreamBatch]) -> usize {
    batches.iter().map(|b| b.messages.len()).sum()
}

// ---------------------------------------------------------------------------
// StreamTransport
// ---------------------------------------------------------------------------

/// 有序日志存储的统一接口
///
/// 实现必须可在生产者与多个消费者身份之间安全共享，
/// 一个身份的阻塞读不能拖住其他身份的读取。
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// 幂等地创建消费组，组锚定在 stream 起点；stream 不存在时一并创建
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<GroupStatus>;

    /// 追加一条由多个字段组成的条目，返回存储分配的 ID
    async fn append_entry(&self, stream: &str, fields: Vec<(String, Vec<u8>)>) -> Result<String>;

    /// 追加只含 `data` 字段的条目
    async fn append(&self, stream: &str, payload: &[u8]) -> Result<String> {
        self.append_entry(stream, vec![(DATA_FIELD.to_string(), payload.to_vec())])
            .await
    }

    /// 以 `consumer` 身份在 `group` 内读取消息
    ///
    /// 阻塞超时返回空 Vec，与真正的传输故障（`Err`）区分开。
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        options: ReadOptions,
    ) -> Result<Vec<StreamBatch>>;

    /// 确认消息，返回实际确认的条数；重复确认返回 0
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_cursor_ids() {
        assert_eq!(ReadCursor::New.as_id(), ">");
        assert_eq!(ReadCursor::Pending.as_id(), "0");
    }

    #[test]
    fn test_stream_message_payload() {
        let msg = StreamMessage::new("1-0", b"{\"id\":\"abc\"}".to_vec());
        assert_eq!(msg.payload(), Some(&b"{\"id\":\"abc\"}"[..]));
        assert!(msg.require_payload().is_ok());
        assert_eq!(msg.field_str(DATA_FIELD), Some("{\"id\":\"abc\"}"));
    }

    #[test]
    fn test_stream_message_missing_payload() {
        let msg = StreamMessage {
            id: "7-0".to_string(),
            fields: HashMap::from([("other".to_string(), b"x".to_vec())]),
        };

        assert!(msg.payload().is_none());
        let err = msg.require_payload().unwrap_err();
        assert_eq!(err.to_string(), "消息缺少字段: id=7-0 field=data");
    }

    #[test]
    fn test_message_count() {
        let batches = vec![
            StreamBatch {
                stream: "orders".to_string(),
                messages: vec![
                    StreamMessage::new("1-0", vec![]),
                    StreamMessage::new("2-0", vec![]),
                ],
            },
            StreamBatch {
                stream: "orders".to_string(),
                messages: vec![],
            },
        ];
        assert_eq!(message_count(&batches), 2);
        assert_eq!(message_count(&[]), 0);
    }
}
