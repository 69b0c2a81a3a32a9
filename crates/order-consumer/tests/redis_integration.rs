//! Redis Stream 集成测试
//!
//! 需要运行中的 Redis（`TEST_REDIS_ADDR`，默认 localhost:6379）：
//!
//! ```bash
//! docker run --rm -p 6379:6379 redis:7
//! cargo test -p order-consumer --test redis_integration -- --ignored
//! ```
//!
//! 每个测试使用独立的 stream 名称，互不干扰。

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use order_consumer::consumer::{ConsumerConfig, OrderConsumer};
use order_consumer::handler::{FnHandler, HandlerError};
use order_stream_shared::order::Order;
use order_stream_shared::retry::RetryPolicy;
use order_stream_shared::stream::{
    GroupStatus, ReadCursor, ReadOptions, RedisStream, StreamMessage, StreamTransport,
};
use order_stream_shared::test_utils::{test_redis_config, unique_stream_name};
use tokio::sync::watch;

async fn connect() -> Arc<RedisStream> {
    let redis = RedisStream::connect(&test_redis_config())
        .await
        .expect("连接测试 Redis 失败");
    redis.health_check().await.expect("Redis 健康检查失败");
    Arc::new(redis)
}

fn test_config(stream: &str) -> ConsumerConfig {
    ConsumerConfig {
        stream: stream.to_string(),
        group: "order_group".to_string(),
        consumer: "it-consumer".to_string(),
        block: Duration::from_millis(200),
        retry: RetryPolicy::fixed(2, Duration::from_millis(10)),
        recover_pending: false,
        ..Default::default()
    }
}

/// 用一个独立的检查组从头读取 stream 的全部条目
async fn read_all(redis: &RedisStream, stream: &str) -> Vec<StreamMessage> {
    redis.ensure_group(stream, "inspector").await.unwrap();
    let batches = redis
        .read_group(
            stream,
            "inspector",
            "inspector-1",
            ReadOptions::new(ReadCursor::New, 100, Duration::from_millis(50)),
        )
        .await
        .unwrap();
    batches.into_iter().flat_map(|b| b.messages).collect()
}

#[tokio::test]
#[ignore = "需要运行 Redis"]
async fn test_ensure_group_twice_is_idempotent() {
    let redis = connect().await;
    let stream = unique_stream_name("it-orders");

    assert_eq!(
        redis.ensure_group(&stream, "order_group").await.unwrap(),
        GroupStatus::Created
    );
    assert_eq!(
        redis.ensure_group(&stream, "order_group").await.unwrap(),
        GroupStatus::AlreadyExists
    );
}

#[tokio::test]
#[ignore = "需要运行 Redis"]
async fn test_ensure_group_again_does_not_reset_cursor() {
    let redis = connect().await;
    let stream = unique_stream_name("it-orders");
    redis.ensure_group(&stream, "order_group").await.unwrap();
    for i in 0..2 {
        let order = Order::with_id(format!("o-{i}"), "Test", i);
        redis.append(&stream, &order.encode().unwrap()).await.unwrap();
    }

    let opts = ReadOptions::new(ReadCursor::New, 10, Duration::from_millis(50));
    let delivered = redis
        .read_group(&stream, "order_group", "c1", opts)
        .await
        .unwrap();
    assert_eq!(delivered.iter().map(|b| b.messages.len()).sum::<usize>(), 2);

    assert_eq!(
        redis.ensure_group(&stream, "order_group").await.unwrap(),
        GroupStatus::AlreadyExists
    );

    let again = redis
        .read_group(&stream, "order_group", "c2", opts)
        .await
        .unwrap();
    assert!(again.iter().all(|b| b.messages.is_empty()));
}

#[tokio::test]
#[ignore = "需要运行 Redis"]
async fn test_consumers_sharing_client_block_concurrently() {
    let redis = connect().await;
    let stream = unique_stream_name("it-orders");
    redis.ensure_group(&stream, "order_group").await.unwrap();

    let opts = ReadOptions::new(ReadCursor::New, 10, Duration::from_millis(1500));
    let started = std::time::Instant::now();
    let (a, b) = tokio::join!(
        redis.read_group(&stream, "order_group", "c1", opts),
        redis.read_group(&stream, "order_group", "c2", opts),
    );

    assert!(a.unwrap().iter().all(|b| b.messages.is_empty()));
    assert!(b.unwrap().iter().all(|b| b.messages.is_empty()));
    // 两个阻塞读若共用一条连接会串行执行，耗时至少 3 秒
    assert!(started.elapsed() < Duration::from_millis(2500));
    assert_eq!(redis.reader_count(), 2);
}

#[tokio::test]
#[ignore = "需要运行 Redis"]
async fn test_blocking_read_times_out_with_empty_result() {
    let redis = connect().await;
    let stream = unique_stream_name("it-orders");
    redis.ensure_group(&stream, "order_group").await.unwrap();

    let started = std::time::Instant::now();
    let batches = redis
        .read_group(
            &stream,
            "order_group",
            "c1",
            ReadOptions::new(ReadCursor::New, 10, Duration::from_millis(300)),
        )
        .await
        .unwrap();

    assert!(batches.iter().all(|b| b.messages.is_empty()));
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
#[ignore = "需要运行 Redis"]
async fn test_success_path_acks_and_dlq_stays_empty() {
    let redis = connect().await;
    let stream = unique_stream_name("it-orders");
    let consumer = OrderConsumer::new(
        redis.clone(),
        Arc::new(FnHandler::new(|_order: Order| async {
            Ok::<(), HandlerError>(())
        })),
        test_config(&stream),
    );
    consumer.bootstrap().await.unwrap();

    let payload = Order::with_id("abc", "Test", 10).encode().unwrap();
    redis.append(&stream, &payload).await.unwrap();

    let (_tx, mut rx) = watch::channel(false);
    let summary = consumer.poll_once(ReadCursor::New, &mut rx).await.unwrap();
    assert_eq!(summary.acknowledged, 1);

    // 已确认的消息不在待确认列表中
    let pending = consumer
        .poll_once(ReadCursor::Pending, &mut rx)
        .await
        .unwrap();
    assert_eq!(pending.received, 0);

    assert!(read_all(&redis, consumer.dead_letter_stream()).await.is_empty());
}

#[tokio::test]
#[ignore = "需要运行 Redis"]
async fn test_failure_path_dead_letters_byte_identical_payload() {
    let redis = connect().await;
    let stream = unique_stream_name("it-orders");
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let consumer = OrderConsumer::new(
        redis.clone(),
        Arc::new(FnHandler::new(move |_order: Order| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(HandlerError::Retryable("下游不可用".into())) }
        })),
        test_config(&stream),
    );
    consumer.bootstrap().await.unwrap();

    let payload = Order::with_id("abc", "Test", 10).encode().unwrap();
    redis.append(&stream, &payload).await.unwrap();

    let (_tx, mut rx) = watch::channel(false);
    let summary = consumer.poll_once(ReadCursor::New, &mut rx).await.unwrap();

    assert_eq!(summary.dead_lettered, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let dead = read_all(&redis, consumer.dead_letter_stream()).await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].payload(), Some(payload.as_slice()));
    assert_eq!(Order::decode(&payload).unwrap().id, "abc");

    let pending = consumer
        .poll_once(ReadCursor::Pending, &mut rx)
        .await
        .unwrap();
    assert_eq!(pending.received, 0);
}

#[tokio::test]
#[ignore = "需要运行 Redis"]
async fn test_each_message_goes_to_one_consumer_in_group() {
    let redis = connect().await;
    let stream = unique_stream_name("it-orders");
    redis.ensure_group(&stream, "order_group").await.unwrap();
    for i in 0..4 {
        let order = Order::with_id(format!("o-{i}"), "Test", i);
        redis.append(&stream, &order.encode().unwrap()).await.unwrap();
    }

    let opts = ReadOptions::new(ReadCursor::New, 2, Duration::from_millis(50));
    let first = redis
        .read_group(&stream, "order_group", "c1", opts)
        .await
        .unwrap();
    let second = redis
        .read_group(&stream, "order_group", "c2", opts)
        .await
        .unwrap();

    let mut ids: Vec<String> = first
        .into_iter()
        .chain(second)
        .flat_map(|b| b.messages)
        .map(|m| m.id)
        .collect();
    let total = ids.len();
    ids.sort();
    ids.dedup();
    assert_eq!(total, 4);
    assert_eq!(ids.len(), 4);
}
