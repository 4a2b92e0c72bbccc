//! Callback context boxes.
//!
//! A subscription's delivery callback is a plain function pointer, so the
//! state it needs (the sender feeding the subscription stream) has to travel
//! through the engine as an opaque closure. The engine only ever sees a
//! [`ContextRef`]: a registry key plus a weak pointer to the registry. The
//! box itself lives in the registry until it is released, and it is released
//! exactly once, by whoever removes the entry first:
//!
//! - the stream being dropped or unsubscribed,
//! - connection teardown ([`ContextRegistry::release_all`]),
//! - the engine dropping the closure (failed subscribe, finished drain).
//!
//! Lookups and removals happen under one lock, so a delivery racing with a
//! release either emits before the release or finds nothing and is dropped.

use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use nats_core::{
    Closure, MessageHandle, NatsError, NatsResult, RawSubscription, SubscriptionHandle,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::{NatsMessage, metrics};

/// Registry key of a context box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextKey(u64);

/// Context box counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    /// Boxes created.
    pub retained: u64,
    /// Boxes released.
    pub released: u64,
    /// Boxes currently held.
    pub live: usize,
}

#[derive(Debug)]
struct ContextBox {
    subject: String,
    emit: mpsc::UnboundedSender<NatsMessage>,
    subscription: Option<SubscriptionHandle>,
}

impl ContextBox {
    // Runs outside the registry lock: unsubscribing and dropping the handle
    // call into the engine.
    fn terminate(self, key: ContextKey) {
        if let Some(mut sub) = self.subscription {
            if sub.is_active() {
                if let Err(err) = sub.unsubscribe() {
                    debug!(?err, subject = %self.subject, "unsubscribe on release failed");
                }
            }
            metrics::NATS_ACTIVE_SUBSCRIPTIONS.dec();
        }
        trace!(key = key.0, subject = %self.subject, "context box released");
    }
}

/// Arena of context boxes shared by every subscription of a client.
#[derive(Debug, Default)]
pub struct ContextRegistry {
    boxes: Mutex<HashMap<ContextKey, ContextBox>>,
    next_key: AtomicU64,
    retained: AtomicU64,
    released: AtomicU64,
}

impl ContextRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a box around `emit` and retain it.
    pub(crate) fn retain(
        &self,
        subject: &str,
        emit: mpsc::UnboundedSender<NatsMessage>,
    ) -> ContextKey {
        let key = ContextKey(self.next_key.fetch_add(1, Ordering::Relaxed) + 1);
        self.boxes.lock().insert(
            key,
            ContextBox {
                subject: subject.to_owned(),
                emit,
                subscription: None,
            },
        );
        self.retained.fetch_add(1, Ordering::Relaxed);
        key
    }

    /// Hand the native subscription to the box. If the box was released in
    /// the meantime the handle is given back so the caller can terminate it.
    pub(crate) fn attach(
        &self,
        key: ContextKey,
        subscription: SubscriptionHandle,
    ) -> Result<(), SubscriptionHandle> {
        match self.boxes.lock().get_mut(&key) {
            Some(entry) => {
                entry.subscription = Some(subscription);
                metrics::NATS_ACTIVE_SUBSCRIPTIONS.inc();
                Ok(())
            }
            None => Err(subscription),
        }
    }

    /// Release the box: unsubscribe if still active, drop the handle and the
    /// emit endpoint. Returns false if it was already released.
    pub(crate) fn release(&self, key: ContextKey) -> bool {
        let entry = self.boxes.lock().remove(&key);
        match entry {
            Some(entry) => {
                self.released.fetch_add(1, Ordering::Relaxed);
                entry.terminate(key);
                true
            }
            None => false,
        }
    }

    /// Release every box. Used on connection teardown.
    pub(crate) fn release_all(&self) -> usize {
        let entries: Vec<_> = self.boxes.lock().drain().collect();
        let count = entries.len();
        self.released.fetch_add(count as u64, Ordering::Relaxed);
        for (key, entry) in entries {
            entry.terminate(key);
        }
        count
    }

    /// Stop interest but keep the box until the engine lets go of the
    /// closure, so messages already pending still reach the stream.
    pub(crate) fn drain(&self, key: ContextKey) -> NatsResult<()> {
        let mut boxes = self.boxes.lock();
        let sub = boxes
            .get_mut(&key)
            .and_then(|entry| entry.subscription.as_mut())
            .ok_or_else(|| NatsError::SubscribeFailed("Invalid subscription".into()))?;
        sub.drain()
    }

    fn emit(&self, key: ContextKey, msg: NatsMessage) -> bool {
        match self.boxes.lock().get(&key) {
            Some(entry) => entry.emit.send(msg).is_ok(),
            None => false,
        }
    }

    /// Returns true while the box behind `key` is held.
    pub fn contains(&self, key: ContextKey) -> bool {
        self.boxes.lock().contains_key(&key)
    }

    /// Current counters.
    pub fn stats(&self) -> ContextStats {
        ContextStats {
            retained: self.retained.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            live: self.boxes.lock().len(),
        }
    }
}

/// The closure handed to the engine.
#[derive(Debug)]
pub(crate) struct ContextRef {
    registry: Weak<ContextRegistry>,
    key: ContextKey,
}

impl ContextRef {
    pub(crate) fn closure(registry: &Arc<ContextRegistry>, key: ContextKey) -> Closure {
        Arc::new(ContextRef {
            registry: Arc::downgrade(registry),
            key,
        })
    }
}

// The engine dropping the closure means no further deliveries can happen.
impl Drop for ContextRef {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.release(self.key);
        }
    }
}

/// Delivery callback registered with the engine for every subscription.
pub(crate) fn on_message(
    sub: RawSubscription,
    msg: Option<MessageHandle<'_>>,
    closure: Option<&Closure>,
) {
    let Some(context) = closure.and_then(|c| c.downcast_ref::<ContextRef>()) else {
        warn!(?sub, "delivery without a usable context, dropping message");
        return;
    };
    let Some(msg) = msg else {
        warn!(?sub, "delivery without a message");
        return;
    };
    let Some(registry) = context.registry.upgrade() else {
        metrics::NATS_MESSAGES_DROPPED.inc();
        return;
    };
    let Some(message) = NatsMessage::copy_from(&msg) else {
        warn!(?sub, "delivery without a subject, dropping message");
        return;
    };
    if registry.emit(context.key, message) {
        metrics::NATS_MESSAGES_RECEIVED.inc();
    } else {
        metrics::NATS_MESSAGES_DROPPED.inc();
    }
}
