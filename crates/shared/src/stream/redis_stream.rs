//! 基于 redis crate 的 Stream 传输实现
//!
//! 写操作（XADD / XACK / XGROUP）共用一条多路复用连接。阻塞读（XREADGROUP BLOCK）
//! 会让 Redis 暂停处理所在连接上的后续命令，因此每个消费者身份使用独立的读连接，
//! 首次读取时建立，之后在所有 clone 之间复用。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadReply};
use redis::{AsyncConnectionConfig, Client, RedisError};
use tracing::{debug, info, instrument};

use super::{GroupStatus, ReadOptions, StreamBatch, StreamMessage, StreamTransport};
use crate::config::RedisConfig;
use crate::error::{Result, StreamError};

/// 阻塞读在 BLOCK 时长之外额外等待服务端响应的余量
const READ_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

/// Redis Stream 客户端
///
/// Clone 成本很低，可在生产者与多个消费者身份之间共享。
#[derive(Clone)]
pub struct RedisStream {
    client: Client,
    conn: MultiplexedConnection,
    /// 按消费者身份划分的阻塞读连接
    readers: Arc<Mutex<HashMap<String, MultiplexedConnection>>>,
}

impl RedisStream {
    /// 建立写连接，读连接在各消费者首次读取时建立
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url().as_str())?;

        let write_config =
            AsyncConnectionConfig::new().set_response_timeout(Some(config.response_timeout()));
        let conn = client
            .get_multiplexed_async_connection_with_config(&write_config)
            .await?;

        info!(addr = %config.addr, "Redis Stream 客户端已连接");
        Ok(Self {
            client,
            conn,
            readers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// 当前已建立的读连接数
    pub fn reader_count(&self) -> usize {
        self.readers.lock().len()
    }

    /// 取得 `consumer` 专用的读连接，不存在时新建
    async fn reader(&self, consumer: &str) -> Result<MultiplexedConnection> {
        let existing = self.readers.lock().get(consumer).cloned();
        if let Some(conn) = existing {
            return Ok(conn);
        }

        // 阻塞读的耗时由 BLOCK 参数决定，由 read_group 自行计算超时
        let read_config = AsyncConnectionConfig::new().set_response_timeout(None);
        let conn = self
            .client
            .get_multiplexed_async_connection_with_config(&read_config)
            .await?;
        debug!(consumer, "已为消费者建立读连接");

        // 并发首次读取时保留先插入的连接
        Ok(self
            .readers
            .lock()
            .entry(consumer.to_string())
            .or_insert(conn)
            .clone())
    }

    /// 健康检查
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(StreamError::from)
    }
}

#[async_trait]
impl StreamTransport for RedisStream {
    #[instrument(skip(self))]
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<GroupStatus> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => {
                info!(stream, group, "消费组已创建");
                Ok(GroupStatus::Created)
            }
            Err(e) => classify_group_error(stream, group, e),
        }
    }

    #[instrument(skip(self, fields), fields(field_count = fields.len()))]
    async fn append_entry(&self, stream: &str, fields: Vec<(String, Vec<u8>)>) -> Result<String> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (name, value) in &fields {
            cmd.arg(name).arg(value.as_slice());
        }

        let mut conn = self.conn.clone();
        let id: String = cmd.query_async(&mut conn).await?;
        debug!(stream, id = %id, "条目已追加");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        options: ReadOptions,
    ) -> Result<Vec<StreamBatch>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(options.count);
        // BLOCK 0 在 Redis 中表示无限等待，零时长按非阻塞读取处理
        if !options.block.is_zero() {
            cmd.arg("BLOCK").arg(options.block.as_millis() as u64);
        }
        cmd.arg("STREAMS").arg(stream).arg(options.cursor.as_id());

        let mut conn = self.reader(consumer).await?;
        let reply: Option<StreamReadReply> = tokio::time::timeout(
            options.block + READ_TIMEOUT_MARGIN,
            cmd.query_async::<Option<StreamReadReply>>(&mut conn),
        )
        .await
        .map_err(|_| read_timeout_error(options.block))??;

        // 阻塞超时时 Redis 返回 nil，这是正常的“无数据”，不是错误
        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        Ok(reply
            .keys
            .into_iter()
            .map(|key| StreamBatch {
                stream: key.key,
                messages: key.ids.into_iter().map(into_message).collect(),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let acked: u64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(id)
            .query_async(&mut conn)
            .await?;
        Ok(acked)
    }
}

/// 区分 BUSYGROUP（幂等成功）、服务端拒绝（建组失败）和连接故障（可重试）
fn classify_group_error(stream: &str, group: &str, err: RedisError) -> Result<GroupStatus> {
    match err.code() {
        Some("BUSYGROUP") => {
            debug!(stream, group, "消费组已存在");
            Ok(GroupStatus::AlreadyExists)
        }
        Some(_) => Err(StreamError::GroupBootstrap {
            stream: stream.to_string(),
            group: group.to_string(),
            source: err,
        }),
        None => Err(StreamError::Transport(err)),
    }
}

fn read_timeout_error(block: Duration) -> StreamError {
    let io = std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!(
            "XREADGROUP 在 {}ms 内未返回",
            (block + READ_TIMEOUT_MARGIN).as_millis()
        ),
    );
    StreamError::Transport(RedisError::from(io))
}

/// 将 redis 的 StreamId 转换为拥有所有权的消息，字段值统一保留为字节
fn into_message(entry: StreamId) -> StreamMessage {
    let fields = entry
        .map
        .keys()
        .filter_map(|name| {
            entry
                .get::<Vec<u8>>(name)
                .map(|value| (name.clone(), value))
        })
        .collect();

    StreamMessage {
        id: entry.id,
        fields,
    }
}
