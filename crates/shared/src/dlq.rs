//! 死信队列处理
//!
//! 当一条消息在全部尝试后仍处理失败，其原始负载会被追加到同名的死信 stream
//! `<stream>-dlq`，然后原消息被确认，避免阻塞消费组的进度。
//!
//! 死信条目的 `data` 字段与原条目逐字节相同。默认布局只包含这一个字段，
//! 与现有检查死信的工具保持兼容；开启元数据后会额外写入失败原因、尝试次数等字段。

use chrono::{DateTime, Utc};

use crate::error::{Result, StreamError};
use crate::order::Order;
use crate::stream::{DATA_FIELD, StreamMessage};

/// 死信 stream 的名称后缀
pub const DLQ_SUFFIX: &str = "-dlq";

/// 死信条目的元数据字段名
pub mod fields {
    pub const SOURCE_STREAM: &str = "source_stream";
    pub const SOURCE_ID: &str = "source_id";
    pub const ATTEMPTS: &str = "attempts";
    pub const ERROR: &str = "error";
    pub const FAILED_AT: &str = "failed_at";
}

/// 主 stream 对应的死信 stream 名称
pub fn dead_letter_stream(stream: &str) -> String {
    format!("{stream}{DLQ_SUFFIX}")
}

// ---------------------------------------------------------------------------
// DeadLetterEntry — 死信条目
// ---------------------------------------------------------------------------

/// 失败元数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureMetadata {
    /// 原始 stream
    pub source_stream: String,
    /// 原始条目 ID
    pub source_id: String,
    /// 实际尝试次数
    pub attempts: u32,
    /// 最后一次失败原因
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl FailureMetadata {
    fn push_fields(self, out: &mut Vec<(String, Vec<u8>)>) {
        out.push((fields::SOURCE_STREAM.to_string(), self.source_stream.into_bytes()));
        out.push((fields::SOURCE_ID.to_string(), self.source_id.into_bytes()));
        out.push((fields::ATTEMPTS.to_string(), self.attempts.to_string().into_bytes()));
        out.push((fields::ERROR.to_string(), self.error.into_bytes()));
        out.push((
            fields::FAILED_AT.to_string(),
            self.failed_at.to_rfc3339().into_bytes(),
        ));
    }
}

/// 原条目缺少 `data` 字段时使用的死信字段：原字段按名称排序后原样复制，
/// 元数据字段追加在后面
pub fn verbatim_fields(
    msg: &StreamMessage,
    metadata: Option<FailureMetadata>,
) -> Vec<(String, Vec<u8>)> {
    let mut out: Vec<(String, Vec<u8>)> = msg
        .fields
        .iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    if let Some(meta) = metadata {
        meta.push_fields(&mut out);
    }
    out
}

/// 死信条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterEntry {
    /// 未经解码的原始负载
    pub payload: Vec<u8>,
    pub metadata: Option<FailureMetadata>,
}

impl DeadLetterEntry {
    /// 只携带原始负载的兼容布局
    pub fn raw(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(payload: impl Into<Vec<u8>>, metadata: FailureMetadata) -> Self {
        Self {
            payload: payload.into(),
            metadata: Some(metadata),
        }
    }

    /// 转换为 XADD 字段，`data` 总是第一个字段
    pub fn into_fields(self) -> Vec<(String, Vec<u8>)> {
        let mut out = vec![(DATA_FIELD.to_string(), self.payload)];
        if let Some(meta) = self.metadata {
            meta.push_fields(&mut out);
        }
        out
    }

    /// 从死信 stream 中读出的消息还原条目
    ///
    /// 元数据字段不完整或格式不对时按兼容布局处理，只保留负载。
    pub fn from_message(msg: &StreamMessage) -> Result<Self> {
        let payload = msg.require_payload()?.to_vec();

        let metadata = parse_metadata(msg);

        Ok(Self { payload, metadata })
    }

    /// 尝试把负载解码为订单，便于按订单 ID 追溯
    pub fn order(&self) -> Result<Order> {
        Order::decode(&self.payload)
    }

    /// 负载中的订单 ID；负载本身损坏时返回 None
    pub fn order_id(&self) -> Option<String> {
        self.order().ok().map(|o| o.id)
    }
}

fn parse_metadata(msg: &StreamMessage) -> Option<FailureMetadata> {
    Some(FailureMetadata {
        source_stream: msg.field_str(fields::SOURCE_STREAM)?.to_string(),
        source_id: msg.field_str(fields::SOURCE_ID)?.to_string(),
        attempts: msg.field_str(fields::ATTEMPTS)?.parse().ok()?,
        error: msg.field_str(fields::ERROR)?.to_string(),
        failed_at: DateTime::parse_from_rfc3339(msg.field_str(fields::FAILED_AT)?)
            .ok()?
            .with_timezone(&Utc),
    })
}

impl TryFrom<&StreamMessage> for DeadLetterEntry {
    type Error = StreamError;

    fn try_from(msg: &StreamMessage) -> Result<Self> {
        Self::from_message(msg)
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
