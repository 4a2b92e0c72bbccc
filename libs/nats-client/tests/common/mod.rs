#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use anyhow::{Result, bail};
use futures::StreamExt;
use nats_client::{ClientConfig, NatsClient, NatsResult, Subscription};
use nats_core::MemoryEngine;
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(2);

pub fn config() -> ClientConfig {
    ClientConfig::new("nats://localhost:4222").with_poll_interval(Duration::from_millis(10))
}

/// Idle client on a fresh in-memory engine.
pub fn setup() -> (NatsClient, Arc<MemoryEngine>) {
    setup_with(config())
}

pub fn setup_with(config: ClientConfig) -> (NatsClient, Arc<MemoryEngine>) {
    let engine = Arc::new(MemoryEngine::new());
    (NatsClient::new(config, engine.clone()), engine)
}

/// Client whose `run()` is driven by a background task, already connected.
pub async fn connected() -> Result<(NatsClient, Arc<MemoryEngine>, JoinHandle<NatsResult<()>>)> {
    let (client, engine) = setup();
    let runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };
    client.wait_for_connected(WAIT).await?;
    Ok((client, engine, runner))
}

/// Poll `cond` until it holds or [`WAIT`] elapses.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            bail!("condition not met within {WAIT:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}

/// Poll `sub` once so that it registers with the engine, then wait until the
/// engine reports `live` subscriptions.
pub async fn activate(sub: &mut Subscription, engine: &MemoryEngine, live: usize) -> Result<()> {
    let _ = tokio::time::timeout(Duration::from_millis(5), sub.next()).await;
    eventually(|| engine.live_subscriptions() == live).await
}
