//! Event model for the notification fan-out pipeline.
//!
//! Change events are ephemeral: produced once per committed change at the
//! source store, transported through the relay (or consumed directly in
//! fallback mode), handed to a channel handler, and discarded. Nothing in
//! this subsystem persists them.
//!
//! Payloads are opaque JSON blobs owned by the producers; only channel
//! routing is interpreted here.

pub mod envelope;
pub mod types;

pub use envelope::{RELAY_TOPIC, RelayEnvelope};
pub use types::{ChangeEvent, Channel};
