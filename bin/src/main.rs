#![allow(clippy::cognitive_complexity)]
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use nats_client::{NatsClient, ServiceGroup};
use nats_core::{Engine, MemoryEngine, RemoteEngine};
use tokio::{runtime::Builder, signal, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::*;

mod commands;
mod config;

use commands::CommandService;
use config::{
    cli::{self, Parser},
    trace,
};

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    // load .env first so its vars count as environment for the cli parser
    let dotenv = dotenv::dotenv();
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.nats_log, &config.log_format)?;
    debug!(url = %config.nats_url, command = ?config.command, ?trace_config);
    if let Err(err) = dotenv {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    // if we have a configured value here, set it
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    // build the runtime
    let rt = builder.build()?;

    rt.block_on(async move {
        match flatten(tokio::spawn(async move { start(config).await })).await {
            Err(err) => {
                error!(?err, "exited with error");
                Err(err)
            }
            Ok(_) => {
                debug!("exiting...");
                Ok(())
            }
        }
    })
}

async fn start(config: cli::Config) -> Result<()> {
    let engine: Arc<dyn Engine> = if config.is_memory() {
        info!("using in-process broker");
        Arc::new(MemoryEngine::new())
    } else {
        Arc::new(RemoteEngine::current().context("failed to create NATS engine")?)
    };
    let client = NatsClient::new(config.client_config(), engine);

    let token = CancellationToken::new();
    let mut group = ServiceGroup::with_token(token.clone());
    group
        .add(Arc::new(client.clone()))
        .add(Arc::new(CommandService::new(
            client,
            config.command.clone(),
            token.clone(),
        )));

    let signal = tokio::spawn(shutdown_signal(token.clone()));
    let result = group.run().await;
    signal.abort();
    result.map_err(|err| anyhow!(err))
}

async fn flatten<T>(handle: JoinHandle<Result<T, anyhow::Error>>) -> Result<T, anyhow::Error> {
    match handle.await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err),
        Err(err) => Err(anyhow!(err)),
    }
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    info!("shutdown signal received");
    token.cancel();
    ret
}
