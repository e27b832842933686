//! Direct change-capture listener against the source store.
//!
//! The `ChangeListener` owns one long-lived PostgreSQL connection,
//! LISTENs on the fixed channel set, and forwards each decoded
//! notification to a sink. The sink is a [`Processor<ChangeEvent>`]: the
//! standalone listener process plugs in a relay publisher, while a
//! `ConnectionManager` in fallback mode plugs in a registry-dispatching
//! sink.
//!
//! The listener is stateless about retry timing; on connection loss the
//! receive loop returns an error and the owning process decides when to
//! restart.

use crate::error::NotifyError;
use crate::events::{ChangeEvent, Channel};
use kanau::processor::Processor;
use sqlx::postgres::PgListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Long-lived LISTEN connection to the source store.
pub struct ChangeListener {
    store_url: String,
    listener: Option<PgListener>,
}

impl ChangeListener {
    pub fn new(store_url: impl Into<String>) -> Self {
        Self {
            store_url: store_url.into(),
            listener: None,
        }
    }

    /// Whether `start()` has succeeded and `stop()` has not yet run.
    pub fn is_started(&self) -> bool {
        self.listener.is_some()
    }

    /// Open the store connection and register interest in every channel.
    ///
    /// If registration fails partway, the channels already registered are
    /// unregistered before the error surfaces, so no partial subscription
    /// leaks. Calling `start()` on an already-started listener is a no-op.
    pub async fn start(&mut self) -> Result<(), NotifyError> {
        if self.listener.is_some() {
            return Ok(());
        }

        let mut listener = PgListener::connect(&self.store_url).await?;

        for (index, channel) in Channel::ALL.iter().enumerate() {
            if let Err(e) = listener.listen(channel.as_str()).await {
                warn!(%channel, error = %e, "channel registration failed, rolling back");
                for registered in &Channel::ALL[..index] {
                    if let Err(e) = listener.unlisten(registered.as_str()).await {
                        warn!(channel = %registered, error = %e, "failed to unregister channel");
                    }
                }
                return Err(e.into());
            }
            info!(%channel, "listening on channel");
        }

        self.listener = Some(listener);
        Ok(())
    }

    /// Receive notifications and forward them to `sink` until the shutdown
    /// signal fires or the connection drops.
    ///
    /// Returns `Ok(())` only on shutdown. A dropped connection yields
    /// `ConnectionLost` so the owner can restart with its own backoff.
    /// Decode problems and sink errors are logged per notification and
    /// never terminate the loop.
    pub async fn run<S>(
        &mut self,
        sink: &S,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), NotifyError>
    where
        S: Processor<ChangeEvent, Output = ()>,
        <S as Processor<ChangeEvent>>::Error: std::fmt::Display,
    {
        let listener = self
            .listener
            .as_mut()
            .ok_or(NotifyError::IllegalState("run() before start()"))?;

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("change listener stopping");
                        return Ok(());
                    }
                }

                received = listener.try_recv() => {
                    match received {
                        Ok(Some(notification)) => {
                            let Some(event) = decode_notification(
                                notification.channel(),
                                notification.payload(),
                            ) else {
                                continue;
                            };
                            if let Err(e) = sink.process(event).await {
                                error!(error = %e, "change event sink failed");
                            }
                        }
                        Ok(None) => {
                            return Err(NotifyError::ConnectionLost(
                                "source store notification connection dropped",
                            ));
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }

    /// Unregister every channel and close the connection.
    ///
    /// Idempotent: safe on a never-started or already-stopped listener.
    pub async fn stop(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            if let Err(e) = listener.unlisten_all().await {
                warn!(error = %e, "failed to unregister channels during stop");
            }
            info!("source store connection closed");
        }
    }
}

/// Decode one NOTIFY delivery into a [`ChangeEvent`].
///
/// Empty or whitespace payloads, unknown channels, and malformed JSON all
/// yield `None`; they are logged and skipped without disturbing the
/// connection.
fn decode_notification(channel: &str, payload: &str) -> Option<ChangeEvent> {
    let Some(channel) = Channel::parse(channel) else {
        debug!(channel, "notification on unknown channel, skipping");
        return None;
    };

    let trimmed = payload.trim();
    if trimmed.is_empty() {
        warn!(%channel, "empty payload received on channel");
        return None;
    }

    match serde_json::from_str(trimmed) {
        Ok(value) => Some(ChangeEvent::new(channel, value)),
        Err(e) => {
            error!(%channel, error = %e, "failed to decode notification payload");
            None
        }
    }
}
