//! Relay transport wrapper.
//!
//! The relay is a shared Redis broker: the standalone listener process
//! publishes change events into it, and every serving process subscribes
//! from it instead of holding its own store subscription. All logical
//! channels travel over the single [`RELAY_TOPIC`], demultiplexed by the
//! dispatch loop through the shared [`HandlerRegistry`].

use crate::error::NotifyError;
use crate::events::{ChangeEvent, Channel, RELAY_TOPIC, RelayEnvelope};
use crate::handler::{ChannelHandler, HandlerRegistry};
use futures_util::StreamExt;
use kanau::processor::Processor;
use redis::AsyncCommands;
use redis::aio::{MultiplexedConnection, PubSub};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Connection lifecycle, publish/subscribe primitives, and the dispatch
/// loop for the relay.
pub struct RelayNotifier {
    relay_url: String,
    client: Option<redis::Client>,
    conn: Option<MultiplexedConnection>,
    pubsub: Option<PubSub>,
    registry: Arc<HandlerRegistry>,
}

impl RelayNotifier {
    /// Create a notifier with its own empty handler registry.
    ///
    /// Publishers (which never dispatch) use this form.
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self::with_registry(relay_url, Arc::new(HandlerRegistry::new()))
    }

    /// Create a notifier that dispatches through a shared registry.
    ///
    /// The `ConnectionManager` injects its own registry here so that relay
    /// and fallback delivery resolve the same channel→handler map.
    pub fn with_registry(relay_url: impl Into<String>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            relay_url: relay_url.into(),
            client: None,
            conn: None,
            pubsub: None,
            registry,
        }
    }

    /// Whether `connect()` has succeeded and `disconnect()` has not run.
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Establish the relay connection.
    ///
    /// On failure no partial handle is stored; the notifier stays in the
    /// never-connected state.
    pub async fn connect(&mut self) -> Result<(), NotifyError> {
        let client = redis::Client::open(self.relay_url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        self.client = Some(client);
        self.conn = Some(conn);
        info!("connected to relay");
        Ok(())
    }

    /// Close the subscription and connection if open.
    ///
    /// Idempotent, safe from any state including never-connected.
    pub async fn disconnect(&mut self) {
        if let Some(mut pubsub) = self.pubsub.take() {
            if let Err(e) = pubsub.unsubscribe(RELAY_TOPIC).await {
                warn!(error = %e, "failed to unsubscribe from relay topic");
            }
        }
        if self.conn.take().is_some() {
            info!("disconnected from relay");
        }
        self.client = None;
    }

    /// Publish a change event to the shared relay topic.
    ///
    /// Fails with `IllegalState` if not connected.
    pub async fn publish(&self, channel: Channel, payload: &Value) -> Result<(), NotifyError> {
        let conn = self
            .conn
            .as_ref()
            .ok_or(NotifyError::IllegalState("publish before connect"))?;

        let envelope = RelayEnvelope::from_event(ChangeEvent::new(channel, payload.clone()));
        let message = envelope.encode()?;

        // The multiplexed connection is a cheap clone over one socket.
        let mut conn = conn.clone();
        let _: () = conn.publish(RELAY_TOPIC, message).await?;
        debug!(%channel, "published change event to relay");
        Ok(())
    }

    /// Open the single subscription to the shared topic.
    ///
    /// Fails with `IllegalState` if not connected.
    pub async fn subscribe(&mut self) -> Result<(), NotifyError> {
        let client = self
            .client
            .as_ref()
            .ok_or(NotifyError::IllegalState("subscribe before connect"))?;

        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(RELAY_TOPIC).await?;
        self.pubsub = Some(pubsub);
        info!(topic = RELAY_TOPIC, "subscribed to relay topic");
        Ok(())
    }

    /// Register a handler for a channel in the underlying registry.
    pub async fn register_callback(&self, channel: Channel, handler: ChannelHandler) {
        self.registry.register(channel, handler).await;
    }

    /// Remove a channel's handler from the underlying registry.
    pub async fn unregister_callback(&self, channel: Channel) {
        self.registry.unregister(channel).await;
    }

    /// Receive relay messages and dispatch them until cancelled.
    ///
    /// Subscription acknowledgements are consumed by the driver; every
    /// message that reaches this loop is a data message. Malformed
    /// messages, unknown channels, and handler failures are logged per
    /// message and never terminate the loop. Cancellation is the only
    /// clean exit; a closed pub/sub stream yields `ConnectionLost`.
    pub async fn dispatch_loop(
        &mut self,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> Result<(), NotifyError> {
        let registry = Arc::clone(&self.registry);
        let pubsub = self
            .pubsub
            .as_mut()
            .ok_or(NotifyError::IllegalState("dispatch_loop before subscribe"))?;

        let mut stream = pubsub.on_message();
        info!("relay dispatch loop started");

        loop {
            tokio::select! {
                biased;

                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        info!("relay dispatch loop cancelled");
                        return Ok(());
                    }
                }

                message = stream.next() => {
                    match message {
                        Some(message) => {
                            let raw: String = match message.get_payload() {
                                Ok(raw) => raw,
                                Err(e) => {
                                    error!(error = %e, "relay message payload was not text");
                                    continue;
                                }
                            };
                            registry.dispatch_raw(&raw).await;
                        }
                        None => {
                            return Err(NotifyError::ConnectionLost(
                                "relay pub/sub stream closed",
                            ));
                        }
                    }
                }
            }
        }
    }
}

/// Publish sink feeding a [`ChangeListener`] into the relay.
///
/// This is the glue the standalone listener process uses: every decoded
/// change event is wrapped in an envelope and published.
///
/// [`ChangeListener`]: crate::listener::ChangeListener
pub struct RelayPublisher {
    notifier: RelayNotifier,
}

impl RelayPublisher {
    /// Wrap a connected notifier.
    pub fn new(notifier: RelayNotifier) -> Self {
        Self { notifier }
    }

    /// Disconnect the underlying notifier.
    pub async fn shutdown(mut self) {
        self.notifier.disconnect().await;
    }
}

impl Processor<ChangeEvent> for RelayPublisher {
    type Output = ();
    type Error = NotifyError;

    async fn process(&self, event: ChangeEvent) -> Result<(), NotifyError> {
        self.notifier.publish(event.channel, &event.payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_publish_before_connect_is_illegal_state() {
        let notifier = RelayNotifier::new("redis://localhost:6379");
        let result = notifier.publish(Channel::Scoreboard, &json!({})).await;
        assert!(matches!(result, Err(NotifyError::IllegalState(_))));
    }

    #[tokio::test]
    async fn test_subscribe_before_connect_is_illegal_state() {
        let mut notifier = RelayNotifier::new("redis://localhost:6379");
        assert!(matches!(
            notifier.subscribe().await,
            Err(NotifyError::IllegalState(_))
        ));
    }

    #[tokio::test]
    async fn test_dispatch_loop_before_subscribe_is_illegal_state() {
        let mut notifier = RelayNotifier::new("redis://localhost:6379");
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        assert!(matches!(
            notifier.dispatch_loop(cancel_rx).await,
            Err(NotifyError::IllegalState(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_from_any_state() {
        let mut notifier = RelayNotifier::new("redis://localhost:6379");
        notifier.disconnect().await;
        notifier.disconnect().await;
        assert!(!notifier.is_connected());
    }

    #[tokio::test]
    async fn test_callback_registration_delegates_to_shared_registry() {
        let registry = Arc::new(HandlerRegistry::new());
        let notifier = RelayNotifier::with_registry("redis://localhost:6379", registry.clone());

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        notifier
            .register_callback(
                Channel::Scoreboard,
                handler_fn(move |_channel, _payload| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .await;

        // The handler is visible through the registry both transports share.
        registry.invoke(Channel::Scoreboard, json!({"period": 2})).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        notifier.unregister_callback(Channel::Scoreboard).await;
        registry.invoke(Channel::Scoreboard, json!({})).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_no_partial_handle() {
        // Port 9 (discard) is not a Redis server; the connect is refused.
        let mut notifier = RelayNotifier::new("redis://127.0.0.1:9");
        assert!(notifier.connect().await.is_err());
        assert!(!notifier.is_connected());
    }
}
