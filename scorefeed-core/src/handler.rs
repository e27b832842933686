//! Channel handler registry.
//!
//! One handler per channel, last registration wins. The registry is the
//! single routing table shared by both transports: the relay dispatch loop
//! and the direct-listener fallback both resolve handlers here, so a mode
//! switch never changes delivery semantics downstream.
//!
//! The registry is read fresh per message; registering or unregistering a
//! handler has no effect on a dispatch iteration already in flight.

use crate::events::{ChangeEvent, Channel, RelayEnvelope};
use futures_util::future::BoxFuture;
use kanau::processor::Processor;
use serde_json::Value;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error};

/// Error type handlers may surface; logged per message, never fatal.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A registered channel handler.
///
/// Handlers receive `(channel, payload)` and push data to the broadcast
/// sink owned by the surrounding service. They should complete promptly;
/// a failing handler is logged and does not affect other messages.
pub type ChannelHandler =
    Arc<dyn Fn(Channel, Value) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Wrap an async closure as a [`ChannelHandler`].
pub fn handler_fn<F, Fut>(f: F) -> ChannelHandler
where
    F: Fn(Channel, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |channel, payload| Box::pin(f(channel, payload)))
}

/// Mapping from [`Channel`] to its single handler.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<Channel, ChannelHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry pre-populated from a handler map.
    pub fn from_map(handlers: HashMap<Channel, ChannelHandler>) -> Self {
        Self {
            handlers: RwLock::new(handlers),
        }
    }

    /// Register a handler for a channel. A previous registration for the
    /// same channel is replaced.
    pub async fn register(&self, channel: Channel, handler: ChannelHandler) {
        self.handlers.write().await.insert(channel, handler);
        debug!(%channel, "registered handler");
    }

    /// Remove the handler for a channel. No effect if none was registered.
    pub async fn unregister(&self, channel: Channel) {
        self.handlers.write().await.remove(&channel);
        debug!(%channel, "unregistered handler");
    }

    /// Decode a raw relay message and route it to its handler.
    ///
    /// Malformed messages, unknown channels, and missing handlers are all
    /// logged and swallowed; one bad message must never stop a dispatch
    /// loop.
    pub async fn dispatch_raw(&self, raw: &str) {
        let envelope = match RelayEnvelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(error = %e, "failed to decode relay message");
                return;
            }
        };

        let Some(channel) = envelope.known_channel() else {
            debug!(channel = %envelope.channel, "relay message for unknown channel, skipping");
            return;
        };

        self.invoke(channel, envelope.payload).await;
    }

    /// Invoke the handler registered for `channel`, if any.
    pub async fn invoke(&self, channel: Channel, payload: Value) {
        // Clone the handler out so the lock is not held across the call.
        let handler = self.handlers.read().await.get(&channel).cloned();

        match handler {
            Some(handler) => {
                if let Err(e) = handler(channel, payload).await {
                    error!(%channel, error = %e, "channel handler failed");
                }
            }
            None => {
                debug!(%channel, "no handler registered for channel, dropping message");
            }
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Sink that routes decoded change events straight into the registry.
///
/// Used in fallback mode, where the direct store listener plays the role
/// the relay dispatch loop plays otherwise.
pub struct RegistrySink {
    registry: Arc<HandlerRegistry>,
}

impl RegistrySink {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }
}

impl Processor<ChangeEvent> for RegistrySink {
    type Output = ();
    type Error = Infallible;

    async fn process(&self, event: ChangeEvent) -> Result<(), Infallible> {
        self.registry.invoke(event.channel, event.payload).await;
        Ok(())
    }
}
