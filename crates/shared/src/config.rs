//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::observability::ObservabilityConfig;
use crate::stream::MIN_CONSUMER_BLOCK;

/// 兼容旧部署方式的 Redis 地址环境变量
pub const REDIS_ADDR_ENV: &str = "REDIS_ADDR";

/// Redis 配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// `host:port` 形式的地址，也接受完整的 `redis://` URL
    pub addr: String,
    /// 写连接（XADD / XACK）的响应超时
    pub response_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            addr: "localhost:6379".to_string(),
            response_timeout_ms: 2000,
        }
    }
}

impl RedisConfig {
    /// 转换为 redis crate 可识别的连接 URL
    pub fn url(&self) -> String {
        if self.addr.contains("://") {
            self.addr.clone()
        } else {
            format!("redis://{}", self.addr)
        }
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Stream 与消费组配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub name: String,
    pub group: String,
    /// XREADGROUP 的阻塞时长，0 按 1ms 处理
    pub block_ms: u64,
    /// 单次读取的最大条数
    pub batch_size: usize,
    /// 死信条目是否附带失败元数据（默认只写原始 data 字段）
    pub dlq_metadata: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: "orders".to_string(),
            group: "order_group".to_string(),
            block_ms: 5000,
            batch_size: 10,
            dlq_metadata: false,
        }
    }
}

impl StreamConfig {
    /// 消费循环的阻塞时长
    ///
    /// Redis 中 `BLOCK 0` 表示无限等待，内存实现中则表示不阻塞，两者都不适合消费循环。
    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms).max(MIN_CONSUMER_BLOCK)
    }
}

/// 消费者配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    /// 消费者在组内的身份
    pub name: String,
    /// 单条消息的最大处理次数（含首次）
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    /// 启动时是否先重新处理本消费者名下未确认的消息
    pub recover_pending: bool,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            name: "consumer-1".to_string(),
            max_attempts: 3,
            retry_delay_ms: 1000,
            recover_pending: true,
        }
    }
}

/// 生产者配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProducerSettings {
    /// 两次发送之间的间隔
    pub interval_ms: u64,
    pub item: String,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            item: "Product-X".to_string(),
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub redis: RedisConfig,
    pub stream: StreamConfig,
    pub consumer: ConsumerSettings,
    pub producer: ProducerSettings,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. config/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（ORDER_STREAM 前缀，双下划线分隔层级，
    ///    如 ORDER_STREAM__STREAM__BLOCK_MS -> stream.block_ms）
    /// 5. REDIS_ADDR（与旧部署脚本保持兼容）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("ORDER_STREAM_ENV").unwrap_or_else(|_| "development".to_string());

        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .set_default("observability.service_name", service_name)?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", service_name)))
                    .required(false),
            )
            .add_source(
                Environment::with_prefix("ORDER_STREAM")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut config: Self = builder.build()?.try_deserialize()?;

        if let Ok(addr) = std::env::var(REDIS_ADDR_ENV)
            && !addr.is_empty()
        {
            config.redis.addr = addr;
        }

        Ok(config)
    }

    /// 死信 stream 名称
    pub fn dead_letter_stream(&self) -> String {
        crate::dlq::dead_letter_stream(&self.stream.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.redis.addr, "localhost:6379");
        assert_eq!(config.stream.name, "orders");
        assert_eq!(config.stream.group, "order_group");
        assert_eq!(config.stream.block(), Duration::from_secs(5));
        assert_eq!(config.consumer.max_attempts, 3);
        assert_eq!(config.consumer.retry_delay_ms, 1000);
        assert!(!config.stream.dlq_metadata);
    }

    #[test]
    fn test_zero_block_is_clamped() {
        let config = StreamConfig {
            block_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.block(), MIN_CONSUMER_BLOCK);

        let config = StreamConfig {
            block_ms: 250,
            ..Default::default()
        };
        assert_eq!(config.block(), Duration::from_millis(250));
    }

    #[test]
    fn test_redis_url() {
        let plain = RedisConfig {
            addr: "10.0.0.5:6380".to_string(),
            ..Default::default()
        };
        assert_eq!(plain.url(), "redis://10.0.0.5:6380");

        let full = RedisConfig {
            addr: "rediss://cache.internal:6379/2".to_string(),
            ..Default::default()
        };
        assert_eq!(full.url(), "rediss://cache.internal:6379/2");
    }

    #[test]
    fn test_dead_letter_stream_name() {
        let config = AppConfig::default();
        assert_eq!(config.dead_letter_stream(), "orders-dlq");
    }

    #[test]
    fn test_load_without_files_and_redis_addr_override() {
        // 两个断言放在同一个测试中，避免并行测试同时修改 REDIS_ADDR
        // SAFETY: 仅本测试读写这些环境变量
        unsafe {
            std::env::set_var("CONFIG_DIR", "/nonexistent-order-stream-config");
            std::env::remove_var(REDIS_ADDR_ENV);
        }

        let config = AppConfig::load("order-consumer").unwrap();
        assert_eq!(config.service_name, "order-consumer");
        assert_eq!(config.observability.service_name, "order-consumer");
        assert_eq!(config.redis.addr, "localhost:6379");
        assert_eq!(config.stream.batch_size, 10);

        unsafe {
            std::env::set_var(REDIS_ADDR_ENV, "redis-primary:6379");
        }
        let config = AppConfig::load("order-consumer").unwrap();
        assert_eq!(config.redis.addr, "redis-primary:6379");
        assert_eq!(config.redis.url(), "redis://redis-primary:6379");

        unsafe {
            std::env::remove_var(REDIS_ADDR_ENV);
            std::env::remove_var("CONFIG_DIR");
        }
    }
}
