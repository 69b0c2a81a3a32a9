//! 统一错误处理模块
//!
//! 定义 Redis Stream 传输层、订单编解码与配置加载共享的错误类型，
//! 使用 thiserror 提供良好的错误信息。

use thiserror::Error;

/// 流操作错误类型
#[derive(Debug, Error)]
pub enum StreamError {
    // ==================== 传输层错误 ====================
    /// 连接失败或 Redis 服务端返回错误（XADD / XREADGROUP / XACK）
    #[error("Redis 传输错误: {0}")]
    Transport(#[from] redis::RedisError),

    /// 创建消费组失败（BUSYGROUP 不属于此类，会被视为幂等成功）
    #[error("创建消费组失败: stream={stream} group={group}: {source}")]
    GroupBootstrap {
        stream: String,
        group: String,
        #[source]
        source: redis::RedisError,
    },

    // ==================== 编解码错误 ====================
    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("消息缺少字段: id={id} field={field}")]
    MissingField { id: String, field: String },

    // ==================== 配置错误 ====================
    #[error("配置错误: {0}")]
    Config(#[from] config::ConfigError),

    // ==================== 测试注入错误 ====================
    /// 内存传输层主动注入的故障，仅用于测试
    #[error("注入故障: {0}")]
    Injected(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, StreamError>;

impl StreamError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::GroupBootstrap { .. } => "GROUP_BOOTSTRAP_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::MissingField { .. } => "MISSING_FIELD",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Injected(_) => "INJECTED_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 只有传输层的瞬时故障值得重试；编解码和配置错误重试也不会改变结果。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Injected(_))
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = StreamError::MissingField {
            id: "1-0".to_string(),
            field: "data".to_string(),
        };
        assert_eq!(err.code(), "MISSING_FIELD");
        assert_eq!(err.to_string(), "消息缺少字段: id=1-0 field=data");
    }

    #[test]
    fn test_is_retryable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused");
        let transport = StreamError::Transport(redis::RedisError::from(io));
        assert!(transport.is_retryable());

        let serialization = StreamError::Serialization("bad json".to_string());
        assert!(!serialization.is_retryable());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err = StreamError::from(json_err);
        assert_eq!(err.code(), "SERIALIZATION_ERROR");
    }
}
