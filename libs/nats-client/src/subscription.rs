//! Subscription streams.
//!
//! A [`Subscription`] is lazy: nothing is registered with the engine until
//! the stream is first polled. From then on the engine's delivery callback
//! copies every message into an unbounded channel which the stream reads.
//! However the stream ends, the context box (and with it the native
//! subscription) is released exactly once.

use std::{
    fmt,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{FutureExt, Stream, future::BoxFuture, stream::FusedStream};
use nats_core::{NatsError, NatsResult};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::{
    NatsMessage,
    client::Shared,
    context::{ContextKey, ContextRef, ContextRegistry, on_message},
    state::ConnectionState,
};

/// Stream of messages received on a subject.
///
/// Ends when it is unsubscribed, drained, or when the client shuts down.
/// Ends immediately, without error, if the client was not connected when
/// the stream was first polled. A finished subscription cannot be restarted.
pub struct Subscription {
    shared: Arc<Shared>,
    subject: String,
    queue: Option<String>,
    phase: Phase,
}

enum Phase {
    Pending,
    Starting(BoxFuture<'static, Option<Active>>),
    Active(Active),
    Done,
}

struct Active {
    key: ContextKey,
    rx: mpsc::UnboundedReceiver<NatsMessage>,
    shutdown: BoxFuture<'static, ()>,
}

enum Step {
    Ready(Option<NatsMessage>),
    Pending,
    Become(Phase),
}

impl Subscription {
    pub(crate) fn new(shared: Arc<Shared>, subject: String, queue: Option<String>) -> Self {
        Self {
            shared,
            subject,
            queue,
            phase: Phase::Pending,
        }
    }

    /// Subject or pattern this stream listens on.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Queue group, for queue subscriptions.
    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    /// Stop the subscription. Messages already buffered are discarded and
    /// the stream ends. Fails if the subscription has already ended.
    pub fn unsubscribe(&mut self) -> NatsResult<()> {
        match std::mem::replace(&mut self.phase, Phase::Done) {
            Phase::Active(active) => {
                if self.shared.contexts.release(active.key) {
                    debug!(subject = %self.subject, "unsubscribed");
                    Ok(())
                } else {
                    Err(invalid())
                }
            }
            // dropping the start future releases whatever it retained
            Phase::Starting(_) | Phase::Pending => Ok(()),
            Phase::Done => Err(invalid()),
        }
    }

    /// Stop interest in new messages but keep delivering the ones already
    /// pending. The stream ends once the engine has flushed them.
    pub fn drain(&mut self) -> NatsResult<()> {
        match &self.phase {
            Phase::Active(active) => {
                self.shared.contexts.drain(active.key)?;
                debug!(subject = %self.subject, "draining");
                Ok(())
            }
            _ => Err(invalid()),
        }
    }

    fn finish(&mut self) {
        if let Phase::Active(active) = std::mem::replace(&mut self.phase, Phase::Done) {
            self.shared.contexts.release(active.key);
        }
    }
}

fn invalid() -> NatsError {
    NatsError::SubscribeFailed("Invalid subscription".into())
}

impl Stream for Subscription {
    type Item = NatsMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<NatsMessage>> {
        let this = &mut *self;
        loop {
            let step = match &mut this.phase {
                Phase::Pending => Step::Become(Phase::Starting(
                    start(
                        Arc::clone(&this.shared),
                        this.subject.clone(),
                        this.queue.clone(),
                    )
                    .boxed(),
                )),
                Phase::Starting(fut) => match fut.poll_unpin(cx) {
                    Poll::Pending => Step::Pending,
                    Poll::Ready(Some(active)) => Step::Become(Phase::Active(active)),
                    Poll::Ready(None) => Step::Become(Phase::Done),
                },
                Phase::Active(active) => {
                    if active.shutdown.poll_unpin(cx).is_ready() {
                        debug!(subject = %this.subject, "client shutting down, ending subscription");
                        Step::Ready(None)
                    } else {
                        match active.rx.poll_recv(cx) {
                            Poll::Ready(Some(msg)) => return Poll::Ready(Some(msg)),
                            Poll::Ready(None) => Step::Ready(None),
                            Poll::Pending => Step::Pending,
                        }
                    }
                }
                Phase::Done => return Poll::Ready(None),
            };
            match step {
                Step::Pending => return Poll::Pending,
                Step::Ready(None) => {
                    this.finish();
                    return Poll::Ready(None);
                }
                Step::Ready(some) => return Poll::Ready(some),
                Step::Become(phase) => this.phase = phase,
            }
        }
    }
}

impl FusedStream for Subscription {
    fn is_terminated(&self) -> bool {
        matches!(self.phase, Phase::Done)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.finish();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self.phase {
            Phase::Pending => "pending",
            Phase::Starting(_) => "starting",
            Phase::Active(_) => "active",
            Phase::Done => "done",
        };
        f.debug_struct("Subscription")
            .field("subject", &self.subject)
            .field("queue", &self.queue)
            .field("phase", &phase)
            .finish()
    }
}

/// Releases a retained box unless the start completed.
struct PendingGuard {
    contexts: Arc<ContextRegistry>,
    key: Option<ContextKey>,
}

impl PendingGuard {
    fn disarm(mut self) {
        self.key = None;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.contexts.release(key);
        }
    }
}

async fn start(shared: Arc<Shared>, subject: String, queue: Option<String>) -> Option<Active> {
    let (conn, token) = {
        let guard = shared.state.lock().await;
        match (guard.state(), guard.conn()) {
            (ConnectionState::Connected, Some(conn)) => (conn, guard.shutdown_token()),
            (state, _) => {
                warn!(%subject, state = %state.kind(), "subscribe while not connected, ending stream");
                return None;
            }
        }
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let key = shared.contexts.retain(&subject, tx);
    let guard = PendingGuard {
        contexts: Arc::clone(&shared.contexts),
        key: Some(key),
    };
    let contexts = Arc::clone(&shared.contexts);
    let closure = ContextRef::closure(&contexts, key);
    let native_subject = subject.clone();
    let result = tokio::task::spawn_blocking(move || -> NatsResult<()> {
        let handle = match &queue {
            Some(queue) => conn.queue_subscribe(&native_subject, queue, on_message, closure)?,
            None => conn.subscribe(&native_subject, on_message, closure)?,
        };
        // the stream went away while we were subscribing
        if let Err(mut handle) = contexts.attach(key, handle) {
            let _ = handle.unsubscribe();
        }
        Ok(())
    })
    .await;

    match result {
        Ok(Ok(())) => {
            debug!(%subject, "subscribed");
            guard.disarm();
            Some(Active {
                key,
                rx,
                shutdown: async move { token.cancelled().await }.boxed(),
            })
        }
        Ok(Err(err)) => {
            error!(?err, %subject, "subscribe failed, ending stream");
            None
        }
        Err(err) => {
            error!(?err, %subject, "subscribe task failed, ending stream");
            None
        }
    }
}
