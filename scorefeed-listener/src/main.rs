//! Standalone change-capture listener.
//!
//! Runs once per pod: opens a single PostgreSQL LISTEN connection,
//! subscribes to every change channel, and forwards each notification
//! into the Redis relay. Serving processes subscribe to the relay instead
//! of each holding their own store subscription.

mod runner;
mod shutdown;

use clap::Parser;
use runner::ListenerRunner;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Scorefeed notify listener - forwards source store changes to the relay
#[derive(Parser, Debug)]
#[command(name = "scorefeed-listener")]
#[command(version, about, long_about = None)]
struct Args {
    /// PostgreSQL connection string for the source store
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Redis connection string for the relay
    #[arg(long, env = "REDIS_URL", default_value = "redis://localhost:6379")]
    redis_url: String,

    /// Seconds to wait between reconnection attempts
    #[arg(long, default_value_t = 5)]
    retry_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = Args::parse();
    tracing::info!("Starting scorefeed-listener v{}", env!("CARGO_PKG_VERSION"));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown::shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let runner = ListenerRunner::new(
        args.database_url,
        args.redis_url,
        Duration::from_secs(args.retry_interval_secs),
    );
    runner.run(shutdown_rx).await;

    tracing::info!("Listener shutdown complete");
    Ok(())
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
