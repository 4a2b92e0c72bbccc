//! Native status codes reported by the protocol engine.
//!
//! Codes and texts follow the engine's own status table so that rendered
//! errors read the same regardless of which engine produced them.

use std::fmt;

/// Status returned by a failed engine primitive.
///
/// Success is expressed as `Ok(..)` by the [`Engine`](crate::Engine) methods,
/// so there is no `Ok` variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Generic error.
    Err,
    /// Error while parsing the protocol.
    ProtocolError,
    /// Socket level failure.
    IoError,
    /// The connection has been closed.
    ConnectionClosed,
    /// No server could be reached.
    NoServer,
    /// The connection was lost and is not usable right now.
    ConnectionDisconnected,
    /// The server rejected the credentials.
    AuthFailed,
    /// The operation is not permitted.
    NotPermitted,
    /// A required resource could not be found.
    NotFound,
    /// The subject is empty or malformed.
    InvalidSubject,
    /// An argument is invalid.
    InvalidArg,
    /// The subscription is invalid or no longer active.
    InvalidSubscription,
    /// The timeout is invalid (zero or negative).
    InvalidTimeout,
    /// The object is in a state that does not allow the operation.
    IllegalState,
    /// The subscriber could not keep up and messages were dropped.
    SlowConsumer,
    /// The payload exceeds the server's limit.
    MaxPayload,
    /// The operation timed out.
    Timeout,
    /// The connection has not been established yet.
    NotYetConnected,
    /// A drain is already in progress.
    Draining,
    /// The queue group name is invalid.
    InvalidQueueName,
    /// A request was sent but no subscriber is listening on the subject.
    NoResponders,
    /// Any code not listed above.
    Unknown(i32),
}

impl Status {
    /// Numeric code as used by the engine.
    pub fn code(&self) -> i32 {
        match self {
            Status::Err => 1,
            Status::ProtocolError => 2,
            Status::IoError => 3,
            Status::ConnectionClosed => 5,
            Status::NoServer => 6,
            Status::ConnectionDisconnected => 10,
            Status::AuthFailed => 11,
            Status::NotPermitted => 12,
            Status::NotFound => 13,
            Status::InvalidSubject => 15,
            Status::InvalidArg => 16,
            Status::InvalidSubscription => 17,
            Status::InvalidTimeout => 18,
            Status::IllegalState => 19,
            Status::SlowConsumer => 20,
            Status::MaxPayload => 21,
            Status::Timeout => 26,
            Status::NotYetConnected => 31,
            Status::Draining => 32,
            Status::InvalidQueueName => 33,
            Status::NoResponders => 34,
            Status::Unknown(code) => *code,
        }
    }

    /// Map a numeric code back to a status. Unlisted codes become
    /// [`Status::Unknown`].
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Status::Err,
            2 => Status::ProtocolError,
            3 => Status::IoError,
            5 => Status::ConnectionClosed,
            6 => Status::NoServer,
            10 => Status::ConnectionDisconnected,
            11 => Status::AuthFailed,
            12 => Status::NotPermitted,
            13 => Status::NotFound,
            15 => Status::InvalidSubject,
            16 => Status::InvalidArg,
            17 => Status::InvalidSubscription,
            18 => Status::InvalidTimeout,
            19 => Status::IllegalState,
            20 => Status::SlowConsumer,
            21 => Status::MaxPayload,
            26 => Status::Timeout,
            31 => Status::NotYetConnected,
            32 => Status::Draining,
            33 => Status::InvalidQueueName,
            34 => Status::NoResponders,
            other => Status::Unknown(other),
        }
    }

    /// Human readable status text.
    pub fn text(&self) -> &'static str {
        match self {
            Status::Err => "Error",
            Status::ProtocolError => "Protocol Error",
            Status::IoError => "IO Error",
            Status::ConnectionClosed => "Connection Closed",
            Status::NoServer => "No server available for connection",
            Status::ConnectionDisconnected => "Connection Disconnected",
            Status::AuthFailed => "Authentication Violation",
            Status::NotPermitted => "Not Permitted",
            Status::NotFound => "Not Found",
            Status::InvalidSubject => "Invalid Subject",
            Status::InvalidArg => "Invalid Argument",
            Status::InvalidSubscription => "Invalid Subscription",
            Status::InvalidTimeout => "Invalid Timeout",
            Status::IllegalState => "Illegal State",
            Status::SlowConsumer => "Slow Consumer, Messages Dropped",
            Status::MaxPayload => "Maximum Payload Exceeded",
            Status::Timeout => "Timeout",
            Status::NotYetConnected => "Not Yet Connected",
            Status::Draining => "Draining in Progress",
            Status::InvalidQueueName => "Invalid queue name",
            Status::NoResponders => "No Responders Available For Request",
            Status::Unknown(_) => "Unknown Status",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip_for_known_statuses() {
        for status in [
            Status::Err,
            Status::ConnectionClosed,
            Status::InvalidSubscription,
            Status::Timeout,
            Status::NoResponders,
        ] {
            assert_eq!(Status::from_code(status.code()), status);
        }
    }

    #[test]
    fn test_unlisted_code_is_unknown() {
        assert_eq!(Status::from_code(999), Status::Unknown(999));
        assert_eq!(Status::Unknown(999).code(), 999);
    }

    #[test]
    fn test_display_renders_text() {
        assert_eq!(Status::Timeout.to_string(), "Timeout");
        assert_eq!(Status::InvalidSubscription.to_string(), "Invalid Subscription");
    }
}
