//! Error types for NATS access operations.
//!
//! Native statuses are translated into a small taxonomy keyed by the kind of
//! operation that failed. The message carries the rendered status text so
//! callers never need to know the engine's numeric codes.

use thiserror::Error;

use crate::status::Status;

/// Top-level error type for the NATS access layer.
///
/// Errors are `Clone` because a failed client keeps its cause and hands it
/// back to every later caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NatsError {
    /// Connect-time failure, or an operation attempted while not connected.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The engine rejected a publish or request.
    #[error("publish failed: {0}")]
    PublishFailed(String),

    /// The engine rejected a subscribe, unsubscribe or drain.
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    /// Native status without a mapping.
    #[error("unknown native status: {0}")]
    Unknown(i32),

    /// Configuration rejected before reaching the engine.
    #[error("configuration error: {0}")]
    Config(String),
}

impl NatsError {
    /// Translate a connect-time status.
    pub fn connection(status: Status) -> Self {
        Self::from_status(status, NatsError::ConnectionFailed, "")
    }

    /// Translate a publish status.
    pub fn publish(status: Status) -> Self {
        Self::from_status(status, NatsError::PublishFailed, "")
    }

    /// Translate a subscribe status.
    pub fn subscribe(status: Status) -> Self {
        Self::from_status(status, NatsError::SubscribeFailed, "")
    }

    /// Render `status` into the variant built by `kind`, prefixing the text
    /// with `context`. Unknown codes always become [`NatsError::Unknown`].
    pub fn from_status(status: Status, kind: fn(String) -> NatsError, context: &str) -> Self {
        match status {
            Status::Unknown(code) => NatsError::Unknown(code),
            known => kind(format!("{context}{}", known.text())),
        }
    }

    /// Returns true if this error reports a not-connected precondition or a
    /// connection-level failure.
    pub fn is_connection(&self) -> bool {
        matches!(self, NatsError::ConnectionFailed(_))
    }

    /// Returns true if the rendered status is a timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            NatsError::ConnectionFailed(msg)
            | NatsError::PublishFailed(msg)
            | NatsError::SubscribeFailed(msg) => msg.ends_with(Status::Timeout.text()),
            _ => false,
        }
    }
}

/// Shorthand result alias for NATS access operations.
pub type NatsResult<T> = Result<T, NatsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_translation() {
        assert_eq!(
            NatsError::connection(Status::NoServer),
            NatsError::ConnectionFailed("No server available for connection".into())
        );
        assert_eq!(
            NatsError::publish(Status::ConnectionClosed),
            NatsError::PublishFailed("Connection Closed".into())
        );
        assert_eq!(
            NatsError::subscribe(Status::InvalidSubscription),
            NatsError::SubscribeFailed("Invalid Subscription".into())
        );
        assert_eq!(NatsError::publish(Status::Unknown(77)), NatsError::Unknown(77));
    }

    #[test]
    fn test_context_prefix() {
        let err = NatsError::from_status(Status::Timeout, NatsError::PublishFailed, "Request failed: ");
        assert_eq!(err, NatsError::PublishFailed("Request failed: Timeout".into()));
        assert!(err.is_timeout());
        assert!(!err.is_connection());
    }

    #[test]
    fn test_error_display() {
        let err = NatsError::ConnectionFailed("Not connected".into());
        assert_eq!(format!("{err}"), "connection failed: Not connected");
        assert!(err.is_connection());
        assert!(!NatsError::Config("bad url".into()).is_timeout());
    }
}
