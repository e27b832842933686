//! Reconnect-forever runner for the change-capture listener.

use scorefeed_core::error::NotifyError;
use scorefeed_core::listener::ChangeListener;
use scorefeed_core::relay::{RelayNotifier, RelayPublisher};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Drives one LISTEN connection and one relay publisher, reconnecting
/// both from scratch after any connection error until shutdown.
pub struct ListenerRunner {
    database_url: String,
    redis_url: String,
    retry_interval: Duration,
}

impl ListenerRunner {
    pub fn new(database_url: String, redis_url: String, retry_interval: Duration) -> Self {
        Self {
            database_url,
            redis_url,
            retry_interval,
        }
    }

    /// Run until the shutdown signal fires.
    ///
    /// Connection errors are logged and followed by a fixed-interval
    /// retry; the shutdown signal also interrupts the retry sleep.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            match self.run_once(shutdown_rx.clone()).await {
                Ok(()) => break,
                Err(e) if e.is_connection() => {
                    error!(error = %e, "listener connection error");
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    info!(
                        seconds = self.retry_interval.as_secs(),
                        "reconnecting after delay"
                    );
                    tokio::select! {
                        _ = shutdown_rx.changed() => {}
                        _ = tokio::time::sleep(self.retry_interval) => {}
                    }
                }
                Err(e) => {
                    // Contract violations are bugs; retrying cannot help.
                    error!(error = %e, "unrecoverable listener error");
                    break;
                }
            }
        }
        info!("notify listener stopped");
    }

    /// One connect-and-pump cycle.
    ///
    /// Returns `Ok(())` only when stopped by the shutdown signal; any
    /// connection failure tears both ends down and surfaces the error so
    /// the outer loop can retry.
    async fn run_once(&self, shutdown_rx: watch::Receiver<bool>) -> Result<(), NotifyError> {
        let mut relay = RelayNotifier::new(self.redis_url.clone());
        relay.connect().await?;
        let publisher = RelayPublisher::new(relay);

        let mut listener = ChangeListener::new(self.database_url.clone());
        if let Err(e) = listener.start().await {
            publisher.shutdown().await;
            return Err(e);
        }
        info!("forwarding source store notifications to relay");

        let result = listener.run(&publisher, shutdown_rx).await;

        listener.stop().await;
        publisher.shutdown().await;
        result
    }
}
