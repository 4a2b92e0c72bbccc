//! Service lifecycle.
//!
//! A [`Service`] runs until told to shut down. A [`ServiceGroup`] runs a set
//! of services under one cancellation token: cancelling the token, or any
//! service failing, shuts every service down through the same path as a
//! direct `shutdown()` call.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use nats_core::{NatsError, NatsResult};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::NatsClient;

/// Long-running component with a graceful shutdown path.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Run until shutdown is requested or the service fails.
    async fn run(&self) -> NatsResult<()>;

    /// Request a graceful shutdown. Must be idempotent.
    async fn shutdown(&self);
}

#[async_trait]
impl Service for NatsClient {
    fn name(&self) -> &str {
        "nats-client"
    }

    async fn run(&self) -> NatsResult<()> {
        NatsClient::run(self).await
    }

    async fn shutdown(&self) {
        self.trigger_graceful_shutdown().await
    }
}

/// Runs services and shuts them all down together.
#[derive(Default)]
pub struct ServiceGroup {
    services: Vec<Arc<dyn Service>>,
    token: CancellationToken,
}

impl fmt::Debug for ServiceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceGroup")
            .field(
                "services",
                &self.services.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

impl ServiceGroup {
    /// Empty group with its own shutdown token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Group driven by an existing token.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            services: Vec::new(),
            token,
        }
    }

    /// Add a service to run alongside the others.
    pub fn add(&mut self, service: Arc<dyn Service>) -> &mut Self {
        self.services.push(service);
        self
    }

    /// Token whose cancellation shuts the group down.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Shut every service down. Idempotent.
    pub fn trigger_graceful_shutdown(&self) {
        self.token.cancel();
    }

    /// Run every service until all of them have returned. Returns the first
    /// error, in registration order.
    pub async fn run(&self) -> NatsResult<()> {
        let tasks: Vec<_> = self
            .services
            .iter()
            .map(|service| {
                let service = Arc::clone(service);
                let token = self.token.clone();
                tokio::spawn(supervise(service, token))
            })
            .collect();

        let mut first = None;
        for task in tasks {
            let result = task.await.unwrap_or_else(|err| {
                Err(NatsError::ConnectionFailed(format!(
                    "service task failed: {err}"
                )))
            });
            if let Err(err) = result {
                first.get_or_insert(err);
            }
        }
        info!("all services stopped");
        first.map_or(Ok(()), Err)
    }
}

async fn supervise(service: Arc<dyn Service>, token: CancellationToken) -> NatsResult<()> {
    let name = service.name().to_owned();
    if token.is_cancelled() {
        debug!(service = %name, "group already shut down, not starting");
        return Ok(());
    }
    let mut run = service.run();
    let result = tokio::select! {
        biased;
        result = &mut run => result,
        _ = token.cancelled() => {
            debug!(service = %name, "shutting down");
            service.shutdown().await;
            run.await
        }
    };
    if let Err(err) = &result {
        error!(?err, service = %name, "service failed, shutting down group");
        token.cancel();
    }
    result
}
