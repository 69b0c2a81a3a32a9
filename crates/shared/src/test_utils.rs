//! 测试工具模块
//!
//! 提供不依赖 Redis 的内存 Stream 实现、故障注入与检查辅助，
//! 以及集成测试使用的 Redis 地址和唯一命名辅助函数。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::RedisConfig;
use crate::error::{Result, StreamError};
use crate::stream::{
    GroupStatus, ReadCursor, ReadOptions, StreamBatch, StreamMessage, StreamTransport,
};

// ==================== 测试配置辅助 ====================

/// 集成测试使用的 Redis 地址
///
/// 优先使用 `TEST_REDIS_ADDR` 环境变量，否则连接本地默认端口
pub fn test_redis_addr() -> String {
    std::env::var("TEST_REDIS_ADDR").unwrap_or_else(|_| "localhost:6379".to_string())
}

/// 创建测试用 Redis 配置
pub fn test_redis_config() -> RedisConfig {
    RedisConfig {
        addr: test_redis_addr(),
        ..Default::default()
    }
}

/// 生成唯一的 stream 名称，避免并行测试互相干扰
pub fn unique_stream_name(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4().simple())
}

// ==================== 内存 Stream ====================

#[derive(Debug)]
struct Entry {
    seq: u64,
    fields: Vec<(String, Vec<u8>)>,
}

impl Entry {
    fn to_message(&self) -> StreamMessage {
        StreamMessage {
            id: format_id(self.seq),
            fields: self.fields.iter().cloned().collect(),
        }
    }
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    /// 已投递给本组的最大序号
    last_delivered: u64,
    /// 已投递未确认的消息，按序号排列
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamState {
    next_seq: u64,
    entries: Vec<Entry>,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn append(&mut self, fields: Vec<(String, Vec<u8>)>) -> u64 {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.entries.push(Entry { seq, fields });
        seq
    }
}

/// 待注入的故障次数
#[derive(Debug, Default)]
struct Faults {
    group_creates: u32,
    appends: u32,
    reads: u32,
    acks: u32,
}

/// 各操作的调用次数（含注入失败的调用）
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub group_creates: u32,
    pub appends: u32,
    pub reads: u32,
    pub acks: u32,
}

#[derive(Debug, Default)]
struct State {
    streams: HashMap<String, StreamState>,
    faults: Faults,
    calls: CallCounts,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    appended: Notify,
}

/// 内存实现的 [`StreamTransport`]
///
/// 模拟 Redis Stream 的消费组语义：`>` 只投递新消息并记入待确认列表，
/// `0` 重新投递本消费者的待确认消息，确认后从列表移除。
/// 条目 ID 形如 `"{序号}-0"`，在每个 stream 内从 1 开始递增。
///
/// 阻塞读通过 [`Notify`] 等待新的追加，超时后返回空结果；
/// 阻塞时长为零时不等待。计时使用 tokio 时钟，可配合 `start_paused` 使用。
#[derive(Debug, Clone, Default)]
pub struct InMemoryStream {
    inner: Arc<Inner>,
}

impl InMemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    // ---------- 故障注入 ----------

    /// 接下来 n 次建组返回注入错误
    pub fn fail_next_group_creates(&self, n: u32) {
        self.inner.state.lock().faults.group_creates = n;
    }

    /// 接下来 n 次追加返回注入错误（包括写入死信 stream）
    pub fn fail_next_appends(&self, n: u32) {
        self.inner.state.lock().faults.appends = n;
    }

    /// 接下来 n 次组读取返回注入错误
    pub fn fail_next_reads(&self, n: u32) {
        self.inner.state.lock().faults.reads = n;
    }

    /// 接下来 n 次确认返回注入错误
    pub fn fail_next_acks(&self, n: u32) {
        self.inner.state.lock().faults.acks = n;
    }

    // ---------- 状态检查 ----------

    /// stream 中的全部条目，按 ID 顺序
    pub fn entries(&self, stream: &str) -> Vec<StreamMessage> {
        let state = self.inner.state.lock();
        state
            .streams
            .get(stream)
            .map(|s| s.entries.iter().map(Entry::to_message).collect())
            .unwrap_or_default()
    }

    pub fn stream_len(&self, stream: &str) -> usize {
        let state = self.inner.state.lock();
        state.streams.get(stream).map_or(0, |s| s.entries.len())
    }

    pub fn has_group(&self, stream: &str, group: &str) -> bool {
        let state = self.inner.state.lock();
        state
            .streams
            .get(stream)
            .is_some_and(|s| s.groups.contains_key(group))
    }

    /// 组内已投递未确认的消息 ID
    pub fn pending_ids(&self, stream: &str, group: &str) -> Vec<String> {
        let state = self.inner.state.lock();
        state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.keys().copied().map(format_id).collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.pending_ids(stream, group).len()
    }

    /// 某条待确认消息的投递次数
    pub fn delivery_count(&self, stream: &str, group: &str, id: &str) -> Option<u32> {
        let seq = parse_id(id)?;
        let state = self.inner.state.lock();
        state
            .streams
            .get(stream)?
            .groups
            .get(group)?
            .pending
            .get(&seq)
            .map(|p| p.delivery_count)
    }

    /// 组游标（最后投递的 ID），组不存在时返回 None
    pub fn last_delivered_id(&self, stream: &str, group: &str) -> Option<String> {
        let state = self.inner.state.lock();
        state
            .streams
            .get(stream)?
            .groups
            .get(group)
            .map(|g| format_id(g.last_delivered))
    }

    pub fn calls(&self) -> CallCounts {
        self.inner.state.lock().calls
    }

    // ---------- 内部实现 ----------

    fn try_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        options: &ReadOptions,
    ) -> Result<Vec<StreamMessage>> {
        let mut state = self.inner.state.lock();
        let Some(stream_state) = state.streams.get_mut(stream) else {
            return Err(no_group(stream, group));
        };
        let StreamState {
            entries, groups, ..
        } = stream_state;
        let Some(group_state) = groups.get_mut(group) else {
            return Err(no_group(stream, group));
        };

        let mut messages = Vec::new();
        match options.cursor {
            ReadCursor::New => {
                let cursor = group_state.last_delivered;
                for entry in entries
                    .iter()
                    .filter(|e| e.seq > cursor)
                    .take(options.count)
                {
                    group_state.last_delivered = entry.seq;
                    group_state.pending.insert(
                        entry.seq,
                        PendingEntry {
                            consumer: consumer.to_string(),
                            delivery_count: 1,
                        },
                    );
                    messages.push(entry.to_message());
                }
            }
            ReadCursor::Pending => {
                for (seq, pending) in group_state
                    .pending
                    .iter_mut()
                    .filter(|(_, p)| p.consumer == consumer)
                    .take(options.count)
                {
                    pending.delivery_count += 1;
                    let message = match entries.iter().find(|e| e.seq == *seq) {
                        Some(entry) => entry.to_message(),
                        // 条目已被删除时 Redis 返回空字段
                        None => StreamMessage {
                            id: format_id(*seq),
                            fields: HashMap::new(),
                        },
                    };
                    messages.push(message);
                }
            }
        }

        Ok(messages)
    }
}

#[async_trait]
impl StreamTransport for InMemoryStream {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<GroupStatus> {
        let mut state = self.inner.state.lock();
        state.calls.group_creates += 1;
        if take_fault(&mut state.faults.group_creates) {
            return Err(injected("XGROUP CREATE"));
        }

        let stream_state = state.streams.entry(stream.to_string()).or_default();
        if stream_state.groups.contains_key(group) {
            return Ok(GroupStatus::AlreadyExists);
        }
        stream_state
            .groups
            .insert(group.to_string(), GroupState::default());
        Ok(GroupStatus::Created)
    }

    async fn append_entry(&self, stream: &str, fields: Vec<(String, Vec<u8>)>) -> Result<String> {
        let seq = {
            let mut state = self.inner.state.lock();
            state.calls.appends += 1;
            if take_fault(&mut state.faults.appends) {
                return Err(injected("XADD"));
            }
            state
                .streams
                .entry(stream.to_string())
                .or_default()
                .append(fields)
        };

        self.inner.appended.notify_waiters();
        Ok(format_id(seq))
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        options: ReadOptions,
    ) -> Result<Vec<StreamBatch>> {
        {
            let mut state = self.inner.state.lock();
            state.calls.reads += 1;
            if take_fault(&mut state.faults.reads) {
                return Err(injected("XREADGROUP"));
            }
        }

        let batch = |messages| {
            vec![StreamBatch {
                stream: stream.to_string(),
                messages,
            }]
        };

        // 待确认列表的读取从不阻塞，即使为空也返回该 stream 的空批次
        if options.cursor == ReadCursor::Pending {
            return Ok(batch(self.try_read(stream, group, consumer, &options)?));
        }

        let deadline = Instant::now() + options.block;
        loop {
            let notified = self.inner.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let messages = self.try_read(stream, group, consumer, &options)?;
            if !messages.is_empty() {
                return Ok(batch(messages));
            }
            if options.block == Duration::ZERO {
                return Ok(Vec::new());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<u64> {
        let mut state = self.inner.state.lock();
        state.calls.acks += 1;
        if take_fault(&mut state.faults.acks) {
            return Err(injected("XACK"));
        }

        let Some(seq) = parse_id(id) else {
            return Ok(0);
        };
        let removed = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .and_then(|g| g.pending.remove(&seq));
        Ok(u64::from(removed.is_some()))
    }
}

fn format_id(seq: u64) -> String {
    format!("{seq}-0")
}

fn parse_id(id: &str) -> Option<u64> {
    id.split_once('-')
        .map_or(id, |(ms, _)| ms)
        .parse()
        .ok()
}

fn take_fault(remaining: &mut u32) -> bool {
    if *remaining == 0 {
        return false;
    }
    *remaining -= 1;
    true
}

fn injected(command: &str) -> StreamError {
    StreamError::Injected(format!("{command} 模拟失败"))
}

fn no_group(stream: &str, group: &str) -> StreamError {
    StreamError::Injected(format!("NOGROUP stream={stream} group={group}"))
}
