//! Dispatcher daemon startup and shutdown.

use crate::app::AppContext;
use command_outbox::{Broker, DispatcherConfig, InMemoryBroker, OutboxDispatcher, RedisStreamBroker};
use command_throttle::{PublishThrottleConfig, TenantPublishThrottler};
use dispatch_config_and_utils::{metrics, BrokerConfig, BrokerKind};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Run the outbox dispatcher until Ctrl-C.
pub async fn run_dispatcher(ctx: AppContext) -> anyhow::Result<()> {
    info!(
        environment = %ctx.config.environment,
        database = %ctx.db.path(),
        "Starting command dispatcher"
    );
    metrics::register_metrics();

    let broker = connect_broker(&ctx.config.broker).await?;
    let throttler = Arc::new(TenantPublishThrottler::new(PublishThrottleConfig::from(
        &ctx.config.publish_throttle,
    )));
    let dispatcher = OutboxDispatcher::new(
        ctx.store(),
        broker,
        throttler,
        DispatcherConfig::from_config(&ctx.config),
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(async move { dispatcher.run(shutdown_rx).await });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
    handle.await?;

    ctx.db.close().await?;
    info!("Command dispatcher exited");
    Ok(())
}

async fn connect_broker(config: &BrokerConfig) -> anyhow::Result<Arc<dyn Broker>> {
    match config.kind {
        BrokerKind::Redis => Ok(Arc::new(RedisStreamBroker::connect(config).await?)),
        BrokerKind::Memory => {
            warn!("Using in-memory broker; published messages are not persisted");
            Ok(Arc::new(InMemoryBroker::new()))
        }
    }
}
