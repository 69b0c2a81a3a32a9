//! 订单消费服务
//!
//! 以消费组成员身份处理订单，直到收到 Ctrl+C 或 SIGTERM。

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use order_stream_shared::{
    config::AppConfig,
    error::StreamError,
    observability,
    retry::{RetryPolicy, retry_with_policy},
    stream::{RedisStream, StreamTransport},
};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use order_consumer::{
    consumer::{ConsumerConfig, OrderConsumer},
    handler::LoggingHandler,
};

/// 命令行参数，优先级高于配置文件与环境变量
#[derive(Debug, Parser)]
#[command(name = "order-consumer", version, about = "订单队列消费者")]
struct Cli {
    /// Stream 名称
    #[arg(long)]
    stream: Option<String>,

    /// 消费组名称
    #[arg(long)]
    group: Option<String>,

    /// 组内的消费者身份
    #[arg(long)]
    consumer: Option<String>,

    /// 死信条目附带失败元数据
    #[arg(long)]
    dlq_metadata: bool,
}

impl Cli {
    fn apply(self, config: &mut AppConfig) {
        if let Some(stream) = self.stream {
            config.stream.name = stream;
        }
        if let Some(group) = self.group {
            config.stream.group = group;
        }
        if let Some(consumer) = self.consumer {
            config.consumer.name = consumer;
        }
        if self.dlq_metadata {
            config.stream.dlq_metadata = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // 1. 加载配置：默认值 -> 配置文件 -> 环境变量 -> 命令行
    let mut config = AppConfig::load("order-consumer")?;
    cli.apply(&mut config);

    // 2. 初始化可观测性
    let obs_config = config
        .observability
        .clone()
        .with_service_name(&config.service_name)
        .merge_env();
    let _guard = observability::init(&obs_config).await?;

    info!(
        environment = %config.environment,
        redis = %config.redis.addr,
        stream = %config.stream.name,
        group = %config.stream.group,
        consumer = %config.consumer.name,
        "Starting order-consumer..."
    );

    // 3. 连接 Redis，启动阶段的连接失败按退避策略重试
    let redis = retry_with_policy(
        &RetryPolicy::default(),
        "redis_connect",
        StreamError::is_retryable,
        || RedisStream::connect(&config.redis),
    )
    .await?;
    let transport: Arc<dyn StreamTransport> = Arc::new(redis);

    // 4. 启动消费循环
    let consumer = OrderConsumer::new(
        transport,
        Arc::new(LoggingHandler::default()),
        ConsumerConfig::from_app_config(&config),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    consumer.run(shutdown_rx).await?;

    info!("Service shutdown complete");
    Ok(())
}

/// 优雅关闭信号处理
///
/// 监听 Ctrl+C 和 SIGTERM 信号，用于 Kubernetes 优雅关闭
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
