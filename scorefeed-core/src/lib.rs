#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod events;
pub mod handler;
pub mod listener;
pub mod manager;
pub mod relay;
