mod common;

use std::time::Duration;

use anyhow::Result;
use common::*;
use nats_client::{AuthMode, ClientState, NatsError};
use nats_core::Status;
use tracing_test::traced_test;

#[tokio::test]
#[traced_test]
async fn test_full_lifecycle_transitions() -> Result<()> {
    let (client, engine) = setup();
    let mut changes = client.state_changes();
    assert_eq!(client.connection_state().await, ClientState::Idle);

    let runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };
    assert_eq!(changes.recv().await?, ClientState::Connecting);
    assert_eq!(changes.recv().await?, ClientState::Connected);
    assert_eq!(client.connection_state().await, ClientState::Connected);

    client.trigger_graceful_shutdown().await;
    assert_eq!(changes.recv().await?, ClientState::Closing);
    assert_eq!(changes.recv().await?, ClientState::Closed);
    assert_eq!(client.connection_state().await, ClientState::Closed);

    runner.await??;
    let stats = engine.stats();
    assert_eq!(stats.connects, 1);
    assert_eq!(stats.closes, 1);
    assert_eq!(stats.connections_destroyed, 1);
    assert_eq!(stats.options_live, 0);
    Ok(())
}

#[tokio::test]
async fn test_run_while_connected_is_noop() -> Result<()> {
    let (client, engine, runner) = connected().await?;
    // returns straight away instead of waiting for shutdown
    tokio::time::timeout(WAIT, client.run()).await??;
    assert_eq!(engine.stats().connects, 1);
    assert_eq!(client.connection_state().await, ClientState::Connected);

    client.shutdown().await;
    runner.await??;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_shutdowns_close_once() -> Result<()> {
    let (client, engine, runner) = connected().await?;
    let mut changes = client.state_changes();

    let shutdowns: Vec<_> = (0..8)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.trigger_graceful_shutdown().await })
        })
        .collect();
    for shutdown in shutdowns {
        shutdown.await?;
    }
    runner.await??;

    assert_eq!(changes.recv().await?, ClientState::Closing);
    assert_eq!(changes.recv().await?, ClientState::Closed);
    assert!(changes.try_recv().is_err());
    let stats = engine.stats();
    assert_eq!(stats.closes, 1);
    assert_eq!(stats.connections_destroyed, 1);
    Ok(())
}

#[tokio::test]
async fn test_shutdown_before_run() -> Result<()> {
    let (client, engine) = setup();
    client.shutdown().await;
    client.shutdown().await;
    assert_eq!(client.connection_state().await, ClientState::Closed);
    assert_eq!(engine.stats().closes, 0);

    // closed clients may connect again
    let runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };
    client.wait_for_connected(WAIT).await?;
    client.shutdown().await;
    runner.await??;
    assert_eq!(engine.stats().connects, 1);
    Ok(())
}

#[tokio::test]
async fn test_reconnect_after_closed() -> Result<()> {
    let (client, engine, runner) = connected().await?;
    client.shutdown().await;
    runner.await??;

    let runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };
    client.wait_for_connected(WAIT).await?;
    client.publish("still.alive", "yes").await?;
    client.shutdown().await;
    runner.await??;

    let stats = engine.stats();
    assert_eq!(stats.connects, 2);
    assert_eq!(stats.closes, 2);
    assert_eq!(stats.connections_destroyed, 2);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_failed_connect_is_terminal() -> Result<()> {
    let (client, engine) = setup();
    engine.fail_next_connect(Status::NoServer);
    let expected = NatsError::ConnectionFailed("No server available for connection".into());

    assert_eq!(client.run().await, Err(expected.clone()));
    assert_eq!(client.connection_state().await, ClientState::Failed);
    assert_eq!(client.failure().await, Some(expected.clone()));

    // rethrown, no new connect attempt
    assert_eq!(client.run().await, Err(expected.clone()));
    assert_eq!(client.publish("a", "x").await, Err(expected.clone()));
    assert_eq!(engine.stats().connects, 0);
    assert_eq!(engine.stats().options_live, 0);

    client.shutdown().await;
    assert_eq!(client.connection_state().await, ClientState::Closed);
    Ok(())
}

#[tokio::test]
async fn test_nkey_seed_is_rejected_before_connecting() -> Result<()> {
    let (client, engine) = setup_with(config().with_auth(AuthMode::NkeySeed("SUACSSL3".into())));
    let err = client.run().await.unwrap_err();
    assert!(matches!(err, NatsError::Config(_)));
    assert_eq!(client.connection_state().await, ClientState::Failed);
    let stats = engine.stats();
    assert_eq!(stats.options_created, 0);
    assert_eq!(stats.connects, 0);
    Ok(())
}

#[tokio::test]
async fn test_auth_rejected() -> Result<()> {
    let (client, engine) = setup_with(config().with_auth(AuthMode::UserPassword {
        user: "alice".into(),
        password: "wrong".into(),
    }));
    engine.require_user("alice", "secret");
    assert_eq!(
        client.run().await,
        Err(NatsError::ConnectionFailed("Authentication Violation".into()))
    );

    let (client, engine) = setup_with(config().with_auth(AuthMode::Token("s3cret".into())));
    engine.require_token("s3cret");
    let runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };
    client.wait_for_connected(WAIT).await?;
    client.shutdown().await;
    runner.await??;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_while_connecting_closes_new_connection() -> Result<()> {
    let (client, engine) = setup();
    engine.set_connect_delay(Some(Duration::from_millis(200)));
    let mut changes = client.state_changes();
    let runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };
    assert_eq!(changes.recv().await?, ClientState::Connecting);

    client.shutdown().await;
    assert_eq!(changes.recv().await?, ClientState::Closed);
    runner.await??;

    assert_eq!(client.connection_state().await, ClientState::Closed);
    let stats = engine.stats();
    assert_eq!(stats.connects, 1);
    assert_eq!(stats.closes, 1);
    assert_eq!(stats.connections_destroyed, 1);
    Ok(())
}

#[tokio::test]
async fn test_abandoned_connect_does_not_override_newer_run() -> Result<()> {
    let (client, engine) = setup();
    engine.set_connect_delay(Some(Duration::from_millis(300)));
    let mut changes = client.state_changes();
    let first = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };
    assert_eq!(changes.recv().await?, ClientState::Connecting);
    client.shutdown().await;
    assert_eq!(changes.recv().await?, ClientState::Closed);

    let second = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };
    assert_eq!(changes.recv().await?, ClientState::Connecting);

    // the first attempt lands while the second is in flight and must step aside
    tokio::time::timeout(WAIT, first).await???;
    assert_eq!(engine.stats().closes, 1);
    client.wait_for_connected(WAIT).await?;
    assert_eq!(engine.stats().connects, 2);
    client.publish("after.rerun", "x").await?;

    client.shutdown().await;
    tokio::time::timeout(WAIT, second).await???;
    assert_eq!(client.connection_state().await, ClientState::Closed);
    let stats = engine.stats();
    assert_eq!(stats.closes, 2);
    assert_eq!(stats.connections_destroyed, 2);
    Ok(())
}

#[tokio::test]
async fn test_dropped_run_still_completes_connect() -> Result<()> {
    let (client, engine) = setup();
    engine.set_connect_delay(Some(Duration::from_millis(200)));
    let dropped = tokio::time::timeout(Duration::from_millis(50), client.run()).await;
    assert!(dropped.is_err());
    assert_eq!(client.connection_state().await, ClientState::Connecting);

    client.wait_for_connected(WAIT).await?;
    client.publish("after.drop", "x").await?;
    // already connected, so this returns straight away
    tokio::time::timeout(WAIT, client.run()).await??;

    client.shutdown().await;
    assert_eq!(client.connection_state().await, ClientState::Closed);
    let stats = engine.stats();
    assert_eq!(stats.connects, 1);
    assert_eq!(stats.closes, 1);
    Ok(())
}

#[tokio::test]
async fn test_connection_lost_fails_client() -> Result<()> {
    let (client, engine, runner) = connected().await?;
    let mut sub = client.subscribe("events.>");
    let pending = tokio::spawn(async move {
        use futures::StreamExt;
        sub.next().await
    });
    eventually(|| engine.live_subscriptions() == 1).await?;

    engine.kill_connections();
    let expected = NatsError::ConnectionFailed("Connection closed".into());
    assert_eq!(runner.await?, Err(expected.clone()));
    assert_eq!(client.connection_state().await, ClientState::Failed);
    assert_eq!(client.publish("a", "x").await, Err(expected));

    // the stream ends with the connection
    assert_eq!(tokio::time::timeout(WAIT, pending).await??, None);
    assert_eq!(client.context_stats().live, 0);
    Ok(())
}
