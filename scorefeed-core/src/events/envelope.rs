//! Wire format for change events crossing the relay.
//!
//! All logical channels are multiplexed over one physical relay topic, so
//! the number of relay subscriptions stays constant regardless of channel
//! count. Each message is JSON `{"channel": <string>, "payload": <any>}`.
//! The format has no version field; extensions must be additive only.

use crate::error::NotifyError;
use crate::events::types::{ChangeEvent, Channel};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The single shared relay topic carrying every channel.
pub const RELAY_TOPIC: &str = "pg_notify:events";

/// Wire record wrapping a change event for transport across the relay.
///
/// The channel stays a plain string on the wire so that consumers can skip
/// names they do not know instead of failing to decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    /// Wire name of the logical channel.
    pub channel: String,
    /// Opaque producer payload.
    pub payload: Value,
}

impl RelayEnvelope {
    /// Wrap an event for publishing.
    pub fn from_event(event: ChangeEvent) -> Self {
        Self {
            channel: event.channel.as_str().to_owned(),
            payload: event.payload,
        }
    }

    /// Resolve the wire channel name against the known channel set.
    pub fn known_channel(&self) -> Option<Channel> {
        Channel::parse(&self.channel)
    }

    /// Convert back into a [`ChangeEvent`], or `None` if the channel name
    /// is not in the known set.
    pub fn into_event(self) -> Option<ChangeEvent> {
        let channel = Channel::parse(&self.channel)?;
        Some(ChangeEvent::new(channel, self.payload))
    }

    /// Serialize for the wire.
    pub fn encode(&self) -> Result<String, NotifyError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from the wire.
    pub fn decode(raw: &str) -> Result<Self, NotifyError> {
        Ok(serde_json::from_str(raw)?)
    }
}
