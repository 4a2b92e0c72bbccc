//! Protocol engine primitives.
//!
//! An [`Engine`] is the collaborator that actually speaks NATS. Resources it
//! hands out are identified by opaque ids; ownership of those ids is managed
//! by the handles in [`crate::handle`], never by callers directly.
//!
//! Primitives fall in two groups:
//!
//! - *blocking*: `connect`, `publish`, `publish_request`, `subscribe`,
//!   `queue_subscribe`, `request`. They may perform network I/O and must be
//!   called from a thread that is allowed to block (for tokio users, inside
//!   `spawn_blocking`).
//! - *non-blocking*: everything else. These are used from drop paths and must
//!   return promptly.

use std::{any::Any, fmt, path::Path, sync::Arc, time::Duration};

use crate::{handle::MessageHandle, handle::NativeMessage, status::Status};

/// Opaque id of a native options resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawOptions(pub u64);

/// Opaque id of a native connection resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawConnection(pub u64);

/// Opaque id of a native subscription resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawSubscription(pub u64);

/// Opaque user context stored by the engine next to a message callback and
/// handed back on every delivery.
pub type Closure = Arc<dyn Any + Send + Sync>;

/// Message delivery callback.
///
/// A plain function pointer: it captures nothing, all state must travel in
/// the [`Closure`]. It may be invoked on a thread owned by the engine. Both
/// the message and the closure are optional so that callbacks can defend
/// against a misbehaving engine.
pub type MsgCallback = fn(RawSubscription, Option<MessageHandle<'_>>, Option<&Closure>);

/// Connection status as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnStatus {
    /// Initial connect in progress.
    Connecting,
    /// Connected and usable.
    Connected,
    /// Connection lost, engine is trying to re-establish it.
    Reconnecting,
    /// Closed for good, either explicitly or after reconnects were exhausted.
    Closed,
}

/// Reconnect settings passed through to the engine untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Whether the engine may reconnect at all.
    pub allowed: bool,
    /// Maximum number of reconnect attempts.
    pub max_reconnects: u32,
    /// Delay between attempts.
    pub wait: Duration,
}

/// Minimum primitives required from a NATS protocol engine.
pub trait Engine: Send + Sync + fmt::Debug + 'static {
    /// Allocate an options resource.
    fn options_create(&self) -> Result<RawOptions, Status>;
    /// Release an options resource.
    fn options_destroy(&self, options: RawOptions);
    /// Set the server URL.
    fn options_set_url(&self, options: RawOptions, url: &str) -> Result<(), Status>;
    /// Set user/password credentials.
    fn options_set_user_info(
        &self,
        options: RawOptions,
        user: &str,
        password: &str,
    ) -> Result<(), Status>;
    /// Set a token credential.
    fn options_set_token(&self, options: RawOptions, token: &str) -> Result<(), Status>;
    /// Load user credentials (JWT + nkey) from a creds file.
    fn options_set_credentials_file(&self, options: RawOptions, path: &Path)
    -> Result<(), Status>;
    /// Set the reconnect policy.
    fn options_set_reconnect(
        &self,
        options: RawOptions,
        policy: ReconnectPolicy,
    ) -> Result<(), Status>;

    /// Connect using `options`. Blocking.
    fn connect(&self, options: RawOptions) -> Result<RawConnection, Status>;
    /// Close the connection. Further primitives on it fail with
    /// [`Status::ConnectionClosed`]. Calling it twice is harmless.
    fn connection_close(&self, conn: RawConnection);
    /// Release the connection resource, closing it first if needed.
    fn connection_destroy(&self, conn: RawConnection);
    /// Current connection status.
    fn connection_status(&self, conn: RawConnection) -> ConnStatus;

    /// Publish `data` on `subject`. Blocking.
    fn publish(&self, conn: RawConnection, subject: &str, data: &[u8]) -> Result<(), Status>;
    /// Publish `data` on `subject` with a reply subject. Blocking.
    fn publish_request(
        &self,
        conn: RawConnection,
        subject: &str,
        reply: &str,
        data: &[u8],
    ) -> Result<(), Status>;

    /// Register `callback` for messages on `subject`. Blocking.
    fn subscribe(
        &self,
        conn: RawConnection,
        subject: &str,
        callback: MsgCallback,
        closure: Closure,
    ) -> Result<RawSubscription, Status>;
    /// Register `callback` as a member of queue group `queue`. Blocking.
    fn queue_subscribe(
        &self,
        conn: RawConnection,
        subject: &str,
        queue: &str,
        callback: MsgCallback,
        closure: Closure,
    ) -> Result<RawSubscription, Status>;
    /// Stop deliveries immediately.
    fn unsubscribe(&self, sub: RawSubscription) -> Result<(), Status>;
    /// Stop interest but deliver what is already pending first.
    fn drain(&self, sub: RawSubscription) -> Result<(), Status>;
    /// Release the subscription resource, unsubscribing first if needed.
    /// The stored closure is dropped after the last delivery, which may
    /// happen after this returns.
    fn subscription_destroy(&self, sub: RawSubscription);

    /// Send a request and wait up to `timeout_ms` for the first reply.
    /// Blocking.
    fn request(
        &self,
        conn: RawConnection,
        subject: &str,
        data: &[u8],
        timeout_ms: i64,
    ) -> Result<NativeMessage, Status>;
}
