use std::sync::Arc;

use anyhow::{anyhow, Context};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use timeseries_worker::env::Config;
use timeseries_worker::rabbitmq::{
    wait_all_closed, ChannelPool, ConnectionManager, Dispatcher, FixedBackoff,
};
use timeseries_worker::timeseries::{MemoryStore, TimeseriesHandler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Setup tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load().context("Failed to load configuration")?;

    // An unreachable broker at startup is fatal
    let connection = match ConnectionManager::connect(&config.connection).await {
        Ok(connection) => Arc::new(connection),
        Err(e) => {
            error!(error = %e, "Cannot connect to RabbitMQ");
            return Err(e).context("Failed to connect to RabbitMQ");
        }
    };

    let handler = Arc::new(TimeseriesHandler::new(Arc::new(MemoryStore::new())));
    let dispatcher = Arc::new(Dispatcher::new(handler, &config.pool.queue_name));

    let pool = ChannelPool::new(Arc::clone(&connection), config.pool.clone())
        .with_retry_strategy(FixedBackoff::new(config.channel_retry_delay));
    let mut slots = pool.start(dispatcher);
    let workers = slots.len();

    info!(
        queue = %config.pool.queue_name,
        "Started successfully with {} workers",
        workers
    );

    // With every slot closed nothing consumes; exit so the supervisor restarts us
    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for the shutdown signal")?;
            info!(retries = pool.retry_count(), "Shutting down");
            Ok(())
        }
        () = wait_all_closed(&mut slots) => {
            error!(workers, retries = pool.retry_count(), "All channels closed, no consumers left");
            Err(anyhow!("all {} channels closed", workers))
        }
    };

    for slot in &slots {
        slot.abort();
    }
    if connection.is_connected() {
        if let Err(e) = connection.close().await {
            warn!(error = %e, "Failed to close RabbitMQ connection");
        }
    }

    outcome
}
