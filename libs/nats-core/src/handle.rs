//! Single-owner wrappers around engine resources.
//!
//! Every handle owns exactly one engine resource and releases it on drop.
//! Handles are not `Clone`; sharing a connection means sharing the handle
//! behind an `Arc`, which keeps a single release.

use std::{
    fmt,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use tracing::trace;

use crate::{
    engine::{
        Closure, ConnStatus, Engine, MsgCallback, RawConnection, RawOptions, RawSubscription,
        ReconnectPolicy,
    },
    error::{NatsError, NatsResult},
};

/// Message resource as produced by an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeMessage {
    subject: String,
    reply: Option<String>,
    data: Bytes,
}

impl NativeMessage {
    /// Build a native message.
    pub fn new(subject: impl Into<String>, reply: Option<String>, data: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            reply,
            data: data.into(),
        }
    }

    /// Borrow a view over this message.
    pub fn handle(&self) -> MessageHandle<'_> {
        MessageHandle::new(self)
    }
}

/// Borrowed view over a native message.
///
/// Only valid for `'a`; inside a delivery callback that is the duration of
/// the call, so anything needed afterwards has to be copied out.
#[derive(Debug, Clone, Copy)]
pub struct MessageHandle<'a> {
    msg: &'a NativeMessage,
}

impl<'a> MessageHandle<'a> {
    /// View `msg`.
    pub fn new(msg: &'a NativeMessage) -> Self {
        Self { msg }
    }

    /// Subject the message was published on. `None` when the engine left it
    /// empty.
    pub fn subject(&self) -> Option<&'a str> {
        Some(self.msg.subject.as_str()).filter(|s| !s.is_empty())
    }

    /// Reply subject, if the publisher asked for one.
    pub fn reply(&self) -> Option<&'a str> {
        self.msg.reply.as_deref().filter(|s| !s.is_empty())
    }

    /// Payload bytes.
    pub fn data(&self) -> Option<&'a [u8]> {
        Some(self.msg.data.as_ref())
    }

    /// Payload length in bytes.
    pub fn data_len(&self) -> usize {
        self.msg.data.len()
    }
}

/// Owns a native options resource. Built per connect attempt.
pub struct OptionsHandle {
    raw: RawOptions,
    engine: Arc<dyn Engine>,
}

impl OptionsHandle {
    /// Allocate options on `engine`.
    pub fn new(engine: Arc<dyn Engine>) -> NatsResult<Self> {
        let raw = engine.options_create().map_err(NatsError::connection)?;
        Ok(Self { raw, engine })
    }

    /// Set the server URL.
    pub fn set_url(&self, url: &str) -> NatsResult<()> {
        self.engine
            .options_set_url(self.raw, url)
            .map_err(config_status)
    }

    /// Set user/password credentials.
    pub fn set_user_info(&self, user: &str, password: &str) -> NatsResult<()> {
        self.engine
            .options_set_user_info(self.raw, user, password)
            .map_err(config_status)
    }

    /// Set a token credential.
    pub fn set_token(&self, token: &str) -> NatsResult<()> {
        self.engine
            .options_set_token(self.raw, token)
            .map_err(config_status)
    }

    /// Load credentials from a creds file.
    pub fn set_credentials_file(&self, path: &Path) -> NatsResult<()> {
        self.engine
            .options_set_credentials_file(self.raw, path)
            .map_err(config_status)
    }

    /// Set the reconnect policy.
    pub fn set_reconnect(&self, policy: ReconnectPolicy) -> NatsResult<()> {
        self.engine
            .options_set_reconnect(self.raw, policy)
            .map_err(config_status)
    }

    /// Engine-side id.
    pub fn raw(&self) -> RawOptions {
        self.raw
    }
}

fn config_status(status: crate::status::Status) -> NatsError {
    NatsError::from_status(status, NatsError::Config, "invalid option: ")
}

impl Drop for OptionsHandle {
    fn drop(&mut self) {
        self.engine.options_destroy(self.raw);
    }
}

impl fmt::Debug for OptionsHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptionsHandle")
            .field("raw", &self.raw)
            .finish_non_exhaustive()
    }
}

/// Owns a native connection resource.
pub struct ConnectionHandle {
    raw: RawConnection,
    engine: Arc<dyn Engine>,
    closed: AtomicBool,
}

impl ConnectionHandle {
    /// Connect with `options`. Blocking.
    pub fn connect(options: &OptionsHandle) -> NatsResult<Self> {
        let engine = Arc::clone(&options.engine);
        let raw = engine
            .connect(options.raw)
            .map_err(NatsError::connection)?;
        Ok(Self {
            raw,
            engine,
            closed: AtomicBool::new(false),
        })
    }

    /// Publish a message. Blocking.
    pub fn publish(&self, subject: &str, data: &[u8]) -> NatsResult<()> {
        self.engine
            .publish(self.raw, subject, data)
            .map_err(NatsError::publish)
    }

    /// Publish a message carrying a reply subject. Blocking.
    pub fn publish_request(&self, subject: &str, reply: &str, data: &[u8]) -> NatsResult<()> {
        self.engine
            .publish_request(self.raw, subject, reply, data)
            .map_err(NatsError::publish)
    }

    /// Close the connection. Only the first call reaches the engine.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            trace!(raw = ?self.raw, "closing connection");
            self.engine.connection_close(self.raw);
        }
    }

    /// Engine-reported status.
    pub fn status(&self) -> ConnStatus {
        if self.closed.load(Ordering::Acquire) {
            return ConnStatus::Closed;
        }
        self.engine.connection_status(self.raw)
    }

    /// Returns true if the engine reports the connection as usable.
    pub fn is_connected(&self) -> bool {
        self.status() == ConnStatus::Connected
    }

    /// Subscribe `callback` to `subject`. Blocking.
    pub fn subscribe(
        &self,
        subject: &str,
        callback: MsgCallback,
        closure: Closure,
    ) -> NatsResult<SubscriptionHandle> {
        let raw = self
            .engine
            .subscribe(self.raw, subject, callback, closure)
            .map_err(NatsError::subscribe)?;
        Ok(SubscriptionHandle::new(raw, Arc::clone(&self.engine)))
    }

    /// Subscribe `callback` to `subject` as a member of `queue`. Blocking.
    pub fn queue_subscribe(
        &self,
        subject: &str,
        queue: &str,
        callback: MsgCallback,
        closure: Closure,
    ) -> NatsResult<SubscriptionHandle> {
        let raw = self
            .engine
            .queue_subscribe(self.raw, subject, queue, callback, closure)
            .map_err(|status| {
                NatsError::from_status(status, NatsError::SubscribeFailed, "QueueSubscribe failed: ")
            })?;
        Ok(SubscriptionHandle::new(raw, Arc::clone(&self.engine)))
    }

    /// Send a request and wait for the reply. Blocking.
    pub fn request(&self, subject: &str, data: &[u8], timeout_ms: i64) -> NatsResult<NativeMessage> {
        self.engine
            .request(self.raw, subject, data, timeout_ms)
            .map_err(|status| {
                NatsError::from_status(status, NatsError::PublishFailed, "Request failed: ")
            })
    }

    /// Engine-side id.
    pub fn raw(&self) -> RawConnection {
        self.raw
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.engine.connection_destroy(self.raw);
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("raw", &self.raw)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Owns a native subscription resource.
pub struct SubscriptionHandle {
    raw: RawSubscription,
    engine: Arc<dyn Engine>,
    active: bool,
}

impl SubscriptionHandle {
    fn new(raw: RawSubscription, engine: Arc<dyn Engine>) -> Self {
        Self {
            raw,
            engine,
            active: true,
        }
    }

    /// Stop deliveries. A second call is rejected without reaching the
    /// engine.
    pub fn unsubscribe(&mut self) -> NatsResult<()> {
        self.deactivate()?;
        self.engine.unsubscribe(self.raw).map_err(|status| {
            NatsError::from_status(status, NatsError::SubscribeFailed, "Unsubscribe failed: ")
        })
    }

    /// Stop interest and let pending deliveries finish. A second call, or a
    /// call after [`unsubscribe`](Self::unsubscribe), is rejected.
    pub fn drain(&mut self) -> NatsResult<()> {
        self.deactivate()?;
        self.engine.drain(self.raw).map_err(|status| {
            NatsError::from_status(status, NatsError::SubscribeFailed, "Drain failed: ")
        })
    }

    fn deactivate(&mut self) -> NatsResult<()> {
        if !self.active {
            return Err(NatsError::SubscribeFailed("Invalid subscription".into()));
        }
        self.active = false;
        Ok(())
    }

    /// Returns true until the first unsubscribe or drain.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Engine-side id.
    pub fn raw(&self) -> RawSubscription {
        self.raw
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.engine.subscription_destroy(self.raw);
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("raw", &self.raw)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}
