//! NATS client with a connection state machine.
//!
//! [`NatsClient::run`] connects and then waits until shutdown is requested or
//! the connection dies. [`NatsClient::trigger_graceful_shutdown`] tears the
//! connection down and ends every subscription stream. Both are safe to call
//! concurrently, and any number of times.
//!
//! Every engine primitive that may block runs on tokio's blocking pool.

use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use nats_core::{ConnStatus, ConnectionHandle, Engine, NatsError, NatsResult};
use serde::{Serialize, de::DeserializeOwned};
use tokio::{sync::broadcast, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info};

use crate::{
    ClientConfig, NatsMessage, Subscription,
    context::{ContextRegistry, ContextStats},
    metrics,
    state::{ClientState, ConnectionState, StateHolder},
};

/// Extra time granted to the engine on top of a request's own timeout
/// before the call is abandoned.
const REQUEST_GRACE: Duration = Duration::from_millis(500);

pub(crate) struct Shared {
    pub(crate) config: ClientConfig,
    pub(crate) engine: Arc<dyn Engine>,
    pub(crate) state: StateHolder,
    pub(crate) contexts: Arc<ContextRegistry>,
}

/// NATS client.
///
/// Cloning is cheap; clones share the connection and its state.
#[derive(Clone)]
pub struct NatsClient {
    shared: Arc<Shared>,
}

impl fmt::Debug for NatsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsClient")
            .field("url", &self.shared.config.url)
            .field("engine", &self.shared.engine)
            .field("contexts", &self.shared.contexts.stats())
            .finish_non_exhaustive()
    }
}

async fn blocking<T, F>(f: F) -> NatsResult<T>
where
    F: FnOnce() -> NatsResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| NatsError::ConnectionFailed(format!("blocking task failed: {err}")))?
}

fn timeout_millis(timeout: Duration) -> i64 {
    i64::try_from(timeout.as_millis())
        .unwrap_or(i64::MAX)
        .max(1)
}

impl NatsClient {
    /// Create an idle client. Nothing happens until [`run`](Self::run).
    pub fn new(config: ClientConfig, engine: Arc<dyn Engine>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                engine,
                state: StateHolder::new(),
                contexts: Arc::new(ContextRegistry::new()),
            }),
        }
    }

    /// Configuration the client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Current state, without the failure cause.
    pub async fn connection_state(&self) -> ClientState {
        self.shared.state.lock().await.state().kind()
    }

    /// Cause of the failure if the client is `Failed`.
    pub async fn failure(&self) -> Option<NatsError> {
        match self.shared.state.lock().await.state() {
            ConnectionState::Failed(cause) => Some(cause.clone()),
            _ => None,
        }
    }

    /// Receiver of every state transition made from now on, in order.
    pub fn state_changes(&self) -> broadcast::Receiver<ClientState> {
        self.shared.state.subscribe()
    }

    /// Wait until the client is connected. Fails with the stored cause if the
    /// client fails first.
    pub async fn wait_for_connected(&self, timeout: Duration) -> NatsResult<()> {
        let mut changes = self.state_changes();
        let wait = async {
            match self.shared.state.lock().await.state() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Failed(cause) => return Err(cause.clone()),
                _ => {}
            }
            loop {
                match changes.recv().await {
                    Ok(ClientState::Connected) => return Ok(()),
                    Ok(ClientState::Failed) => {
                        return Err(self.failure().await.unwrap_or_else(|| {
                            NatsError::ConnectionFailed("Connection failed".into())
                        }));
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(NatsError::ConnectionFailed("Not connected".into()));
                    }
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| NatsError::ConnectionFailed("Timeout".into()))?
    }

    /// Context box counters, for checking that subscriptions release what
    /// they retain.
    pub fn context_stats(&self) -> ContextStats {
        self.shared.contexts.stats()
    }

    /// Connect and wait until shutdown is requested or the connection dies.
    ///
    /// Returns immediately if the client is already connecting or connected.
    /// Fails with `ConnectionFailed("Client is closing")` during a shutdown
    /// and with the stored cause once the client has failed.
    ///
    /// The work runs on its own task. Dropping the returned future does not
    /// leave the client stuck in `Connecting`: the attempt still completes
    /// and the connection is watched until shutdown.
    pub async fn run(&self) -> NatsResult<()> {
        let (attempt, token) = {
            let mut guard = self.shared.state.lock().await;
            match guard.state() {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    debug!("NATS client already running");
                    return Ok(());
                }
                ConnectionState::Closing => {
                    return Err(NatsError::ConnectionFailed("Client is closing".into()));
                }
                ConnectionState::Failed(cause) => return Err(cause.clone()),
                ConnectionState::Idle | ConnectionState::Closed => {}
            }
            let token = guard.renew_shutdown_token();
            let attempt = guard.begin_attempt();
            guard.set(ConnectionState::Connecting);
            (attempt, token)
        };

        let client = self.clone();
        let task = async move { client.drive(attempt, token).await };
        match tokio::spawn(task.in_current_span()).await {
            Ok(result) => result,
            Err(err) => {
                let err = NatsError::ConnectionFailed(format!("run task failed: {err}"));
                let mut guard = self.shared.state.lock().await;
                if guard.is_connecting(attempt) {
                    guard.set(ConnectionState::Failed(err.clone()));
                }
                error!(?err, "NATS run task ended abnormally");
                Err(err)
            }
        }
    }

    async fn drive(&self, attempt: u64, token: CancellationToken) -> NatsResult<()> {
        let url = &self.shared.config.url;
        info!(%url, attempt, "connecting to NATS");
        let connected = self.connect().await;

        {
            let mut guard = self.shared.state.lock().await;
            let current = guard.is_connecting(attempt);
            match connected {
                Err(err) if current => {
                    guard.set(ConnectionState::Failed(err.clone()));
                    error!(?err, %url, "NATS client failed to connect");
                    return Err(err);
                }
                Err(err) => {
                    debug!(?err, attempt, "connect failed after the attempt was abandoned");
                    return Ok(());
                }
                Ok(conn) if !current => {
                    drop(guard);
                    debug!(attempt, "connect attempt abandoned, closing its connection");
                    return blocking(move || {
                        conn.close();
                        Ok(())
                    })
                    .await;
                }
                Ok(conn) => {
                    guard.set_conn(Arc::new(conn));
                    guard.set(ConnectionState::Connected);
                }
            }
        }
        info!(%url, "NATS client connected");

        self.watch(token).await
    }

    async fn connect(&self) -> NatsResult<ConnectionHandle> {
        let config = self.shared.config.clone();
        let engine = Arc::clone(&self.shared.engine);
        blocking(move || {
            let options = config.build_options(engine)?;
            ConnectionHandle::connect(&options)
        })
        .await
    }

    async fn watch(&self, token: CancellationToken) -> NatsResult<()> {
        let mut interval = tokio::time::interval(self.shared.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("NATS run loop stopped");
                    return Ok(());
                }
                _ = interval.tick() => {}
            }

            let mut guard = self.shared.state.lock().await;
            match guard.state() {
                ConnectionState::Connected => {
                    let alive = guard
                        .conn()
                        .is_some_and(|conn| conn.status() != ConnStatus::Closed);
                    if alive {
                        continue;
                    }
                    let err = NatsError::ConnectionFailed("Connection closed".into());
                    guard.set(ConnectionState::Failed(err.clone()));
                    token.cancel();
                    let conn = guard.take_conn();
                    drop(guard);
                    error!("NATS connection closed by the engine");
                    let contexts = Arc::clone(&self.shared.contexts);
                    blocking(move || {
                        contexts.release_all();
                        drop(conn);
                        Ok(())
                    })
                    .await?;
                    return Err(err);
                }
                ConnectionState::Failed(cause) => return Err(cause.clone()),
                _ => return Ok(()),
            }
        }
    }

    /// Close the connection and end every subscription stream.
    ///
    /// From `Connected` this goes through `Closing` to `Closed`; from any
    /// other state straight to `Closed`. Calling it again is a no-op.
    pub async fn trigger_graceful_shutdown(&self) {
        let mut guard = self.shared.state.lock().await;
        guard.shutdown_token().cancel();
        match guard.state() {
            ConnectionState::Connected => {
                guard.set(ConnectionState::Closing);
                let conn = guard.take_conn();
                let contexts = Arc::clone(&self.shared.contexts);
                let released = blocking(move || {
                    let released = contexts.release_all();
                    if let Some(conn) = conn {
                        conn.close();
                    }
                    Ok(released)
                })
                .await;
                if let Err(err) = &released {
                    error!(?err, "NATS teardown did not complete");
                }
                guard.set(ConnectionState::Closed);
                info!(
                    subscriptions = released.unwrap_or_default(),
                    "NATS client disconnected (graceful shutdown)"
                );
            }
            ConnectionState::Closed => {}
            _ => guard.set(ConnectionState::Closed),
        }
    }

    /// Alias of [`trigger_graceful_shutdown`](Self::trigger_graceful_shutdown).
    pub async fn shutdown(&self) {
        self.trigger_graceful_shutdown().await
    }

    async fn connection(&self) -> NatsResult<Arc<ConnectionHandle>> {
        let guard = self.shared.state.lock().await;
        match (guard.state(), guard.conn()) {
            (ConnectionState::Connected, Some(conn)) => Ok(conn),
            (ConnectionState::Failed(cause), _) => Err(cause.clone()),
            _ => Err(NatsError::ConnectionFailed("Not connected".into())),
        }
    }

    /// Publish `payload` on `subject`.
    pub async fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> NatsResult<()> {
        let conn = self.connection().await?;
        let subject = subject.to_owned();
        let payload = payload.into();
        blocking(move || conn.publish(&subject, &payload)).await?;
        metrics::NATS_MESSAGES_PUBLISHED.inc();
        Ok(())
    }

    /// Publish `payload` on `subject`, asking receivers to answer on `reply`.
    pub async fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: impl Into<Bytes>,
    ) -> NatsResult<()> {
        let conn = self.connection().await?;
        let subject = subject.to_owned();
        let reply = reply.to_owned();
        let payload = payload.into();
        blocking(move || conn.publish_request(&subject, &reply, &payload)).await?;
        metrics::NATS_MESSAGES_PUBLISHED.inc();
        Ok(())
    }

    /// Publish `value` encoded as JSON.
    pub async fn publish_json<T: Serialize>(&self, subject: &str, value: &T) -> NatsResult<()> {
        let payload = serde_json::to_vec(value)
            .map_err(|err| NatsError::PublishFailed(format!("invalid json payload: {err}")))?;
        self.publish(subject, payload).await
    }

    /// Stream of messages on `subject`. See [`Subscription`].
    pub fn subscribe(&self, subject: impl Into<String>) -> Subscription {
        Subscription::new(Arc::clone(&self.shared), subject.into(), None)
    }

    /// Stream of messages on `subject`, shared with the other members of
    /// queue group `queue`.
    pub fn queue_subscribe(
        &self,
        subject: impl Into<String>,
        queue: impl Into<String>,
    ) -> Subscription {
        Subscription::new(
            Arc::clone(&self.shared),
            subject.into(),
            Some(queue.into()),
        )
    }

    /// Send a request and wait up to `timeout` for the reply.
    pub async fn request(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> NatsResult<NatsMessage> {
        let conn = self.connection().await?;
        metrics::NATS_REQUESTS.inc();
        let timeout_ms = timeout_millis(timeout);
        let native_subject = subject.to_owned();
        let payload = payload.into();
        let call = blocking(move || {
            let reply = conn.request(&native_subject, &payload, timeout_ms)?;
            let handle = reply.handle();
            Ok(NatsMessage::copy_from(&handle).unwrap_or_else(|| {
                NatsMessage::new(
                    native_subject.clone(),
                    Bytes::copy_from_slice(handle.data().unwrap_or_default()),
                )
            }))
        });
        let result = match tokio::time::timeout(timeout.saturating_add(REQUEST_GRACE), call).await {
            Ok(result) => result,
            Err(_) => Err(NatsError::PublishFailed("Request failed: Timeout".into())),
        };
        if let Err(err) = &result {
            metrics::NATS_REQUEST_FAILURES.inc();
            debug!(?err, subject, "request failed");
        }
        result
    }

    /// [`request`](Self::request) with the configured request timeout.
    pub async fn request_default(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
    ) -> NatsResult<NatsMessage> {
        self.request(subject, payload, self.shared.config.request_timeout)
            .await
    }

    /// Send `value` as JSON and decode the JSON reply.
    pub async fn request_json<T, R>(&self, subject: &str, value: &T) -> NatsResult<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_vec(value)
            .map_err(|err| NatsError::PublishFailed(format!("invalid json payload: {err}")))?;
        let reply = self.request_default(subject, payload).await?;
        reply
            .json()
            .map_err(|err| NatsError::PublishFailed(format!("invalid json reply: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use nats_core::MemoryEngine;
    use tracing_test::traced_test;

    use super::*;

    fn client() -> (NatsClient, Arc<MemoryEngine>) {
        let engine = Arc::new(MemoryEngine::new());
        let config = ClientConfig::new("nats://localhost:4222")
            .with_poll_interval(Duration::from_millis(10));
        (NatsClient::new(config, engine.clone()), engine)
    }

    #[test]
    fn test_timeout_millis_is_clamped() {
        assert_eq!(timeout_millis(Duration::ZERO), 1);
        assert_eq!(timeout_millis(Duration::from_micros(300)), 1);
        assert_eq!(timeout_millis(Duration::from_millis(200)), 200);
        assert_eq!(timeout_millis(Duration::MAX), i64::MAX);
    }

    #[tokio::test]
    async fn test_run_while_closing_is_rejected() {
        let (client, _engine) = client();
        client
            .shared
            .state
            .lock()
            .await
            .set(ConnectionState::Closing);
        assert_eq!(
            client.run().await,
            Err(NatsError::ConnectionFailed("Client is closing".into()))
        );
        assert_eq!(client.connection_state().await, ClientState::Closing);
    }

    #[tokio::test]
    async fn test_operations_before_run() {
        let (client, engine) = client();
        let not_connected = Err(NatsError::ConnectionFailed("Not connected".into()));
        assert_eq!(client.publish("a", "x").await, not_connected);
        assert_eq!(
            client
                .request("a", "x", Duration::from_millis(10))
                .await
                .map(|_| ()),
            not_connected
        );
        assert_eq!(engine.stats().publishes, 0);
        assert_eq!(engine.stats().requests, 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_connect_and_shutdown_are_logged() {
        let (client, engine) = client();
        let runner = {
            let client = client.clone();
            tokio::spawn(async move { client.run().await })
        };
        client
            .wait_for_connected(Duration::from_secs(2))
            .await
            .unwrap();
        assert!(logs_contain("connecting to NATS"));

        client.trigger_graceful_shutdown().await;
        runner.await.unwrap().unwrap();
        assert!(logs_contain("graceful shutdown"));
        assert_eq!(engine.stats().closes, 1);
    }
}
