//! Client metrics.
//!
//! Metrics are lazily registered with the default prometheus registry on
//! first access. Registration failures are fatal (`.unwrap()`): they can
//! only come from a name clash, which is a programming error.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, register_int_counter, register_int_gauge};

lazy_static! {
    /// Messages published, replies included
    pub static ref NATS_MESSAGES_PUBLISHED: IntCounter = register_int_counter!(
        "nats_messages_published",
        "count of messages published"
    ).unwrap();

    /// Messages delivered to subscription streams
    pub static ref NATS_MESSAGES_RECEIVED: IntCounter = register_int_counter!(
        "nats_messages_received",
        "count of messages delivered to subscription streams"
    ).unwrap();

    /// Deliveries dropped because the subscription had already terminated
    pub static ref NATS_MESSAGES_DROPPED: IntCounter = register_int_counter!(
        "nats_messages_dropped",
        "count of late deliveries dropped after subscription termination"
    ).unwrap();

    /// Requests sent
    pub static ref NATS_REQUESTS: IntCounter = register_int_counter!(
        "nats_requests",
        "count of requests sent"
    ).unwrap();

    /// Requests that failed or timed out
    pub static ref NATS_REQUEST_FAILURES: IntCounter = register_int_counter!(
        "nats_request_failures",
        "count of requests that failed or timed out"
    ).unwrap();

    /// Subscriptions currently registered with the engine
    pub static ref NATS_ACTIVE_SUBSCRIPTIONS: IntGauge = register_int_gauge!(
        "nats_active_subscriptions",
        "number of subscriptions currently registered with the engine"
    ).unwrap();

    /// Connection state (0 idle, 1 connecting, 2 connected, 3 closing, 4 closed, 5 failed)
    pub static ref NATS_CONNECTION_STATE: IntGauge = register_int_gauge!(
        "nats_connection_state",
        "current connection state of the most recently updated client"
    ).unwrap();
}
