//! 订单生产服务
//!
//! 按固定间隔向 stream 发送随机订单，直到收到 Ctrl+C 或达到指定数量。

use std::sync::Arc;
use std::time::Duration;

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

use order_producer::{
    generator::OrderGenerator,
    producer::{OrderProducer, run_producer_loop},
};

/// 命令行参数，优先级高于配置文件与环境变量
#[derive(Debug, Parser)]
#[command(name = "order-producer", version, about = "订单队列生产者")]
struct Cli {
    /// Stream 名称
    #[arg(long)]
    stream: Option<String>,

    /// 发送间隔（毫秒）
    #[arg(short, long)]
    interval_ms: Option<u64>,

    /// 商品名称
    #[arg(long)]
    item: Option<String>,

    /// 发送数量，不指定时持续发送
    #[arg(short = 'n', long)]
    count: Option<u64>,
}

impl Cli {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(stream) = &self.stream {
            config.stream.name = stream.clone();
        }
        if let Some(interval_ms) = self.interval_ms {
            config.producer.interval_ms = interval_ms;
        }
        if let Some(item) = &self.item {
            config.producer.item = item.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = AppConfig::load("order-producer")?;
    cli.apply(&mut config);

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
        "Starting order-producer..."
    );

    let redis = retry_with_policy(
        &RetryPolicy::default(),
        "redis_connect",
        StreamError::is_retryable,
        || RedisStream::connect(&config.redis),
    )
    .await?;
    let transport: Arc<dyn StreamTransport> = Arc::new(redis);

    let producer = OrderProducer::new(transport, config.stream.name.clone());
    let generator = OrderGenerator::new(config.producer.item.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let stats = run_producer_loop(
        &producer,
        &generator,
        Duration::from_millis(config.producer.interval_ms),
        cli.count,
        shutdown_rx,
    )
    .await;

    info!(sent = stats.sent, failed = stats.failed, "Service shutdown complete");
    Ok(())
}

/// 监听 Ctrl+C 和 SIGTERM 信号
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
        _ = ctrl_c => info!("Received Ctrl+C, starting graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting graceful shutdown..."),
    }
}
