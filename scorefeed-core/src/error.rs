//! Error taxonomy for the notification pipeline.
//!
//! Three families matter to callers:
//!
//! - connection errors (`StoreConnection`, `RelayConnection`, `ConnectionLost`)
//!   are converted into state transitions by the [`ConnectionManager`] and
//!   never crash the surrounding service
//! - `Decode` is caught at the lowest level (listener callback, dispatch
//!   loop), logged and dropped
//! - `IllegalState` is a programming-contract violation and propagates to
//!   the immediate caller
//!
//! [`ConnectionManager`]: crate::manager::ConnectionManager

use thiserror::Error;

/// Errors produced by the notification fan-out pipeline.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// The source store (PostgreSQL) was unreachable or rejected a
    /// LISTEN registration.
    #[error("source store connection error: {0}")]
    StoreConnection(#[from] sqlx::Error),

    /// The relay (Redis) was unreachable or a pub/sub operation failed.
    #[error("relay connection error: {0}")]
    RelayConnection(#[from] redis::RedisError),

    /// An operation was attempted in the wrong lifecycle state, e.g.
    /// publishing before connecting.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// A payload on the wire could not be decoded as JSON.
    #[error("failed to decode payload: {0}")]
    Decode(#[from] serde_json::Error),

    /// An established transport died mid-run. Surfaced to the owning loop
    /// so it can switch modes; never propagated to `startup()` callers.
    #[error("connection lost: {0}")]
    ConnectionLost(&'static str),
}

impl NotifyError {
    /// Whether this error describes an unreachable or dropped transport,
    /// as opposed to a contract violation or a bad payload. Connection
    /// errors are retryable; the rest are not.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            NotifyError::StoreConnection(_)
                | NotifyError::RelayConnection(_)
                | NotifyError::ConnectionLost(_)
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_errors_are_retryable() {
        assert!(NotifyError::StoreConnection(sqlx::Error::PoolClosed).is_connection());
        assert!(
            NotifyError::RelayConnection(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            )))
            .is_connection()
        );
        assert!(NotifyError::ConnectionLost("pub/sub stream closed").is_connection());

        assert!(!NotifyError::IllegalState("publish before connect").is_connection());
        let bad_json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(!NotifyError::Decode(bad_json).is_connection());
    }
}
