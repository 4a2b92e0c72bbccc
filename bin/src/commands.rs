//! natsctl subcommands, run as a service next to the client.

use std::{io::Write, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use nats_client::{NatsClient, NatsError, NatsMessage, NatsResult, Service};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::cli::Command;

const CONNECT_WAIT: Duration = Duration::from_secs(30);

/// Runs one subcommand once the client is connected, then shuts the group
/// down through `token`.
pub struct CommandService {
    client: NatsClient,
    command: Command,
    token: CancellationToken,
    out: Arc<parking_lot::Mutex<Box<dyn Write + Send>>>,
}

impl CommandService {
    pub fn new(client: NatsClient, command: Command, token: CancellationToken) -> Self {
        Self::with_output(client, command, token, Box::new(std::io::stdout()))
    }

    pub fn with_output(
        client: NatsClient,
        command: Command,
        token: CancellationToken,
        out: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            client,
            command,
            token,
            out: Arc::new(parking_lot::Mutex::new(out)),
        }
    }

    fn print(&self, msg: &NatsMessage) -> NatsResult<()> {
        let mut out = self.out.lock();
        writeln!(
            out,
            "[{}] {}",
            msg.subject(),
            String::from_utf8_lossy(msg.payload())
        )
        .and_then(|_| out.flush())
        .map_err(|err| NatsError::Config(format!("failed to write output: {err}")))
    }

    async fn execute(&self) -> NatsResult<()> {
        self.client.wait_for_connected(CONNECT_WAIT).await?;
        match &self.command {
            Command::Pub(args) => {
                self.client
                    .publish(&args.subject, args.payload.clone())
                    .await?;
                info!(subject = %args.subject, "published");
            }
            Command::Req(args) => {
                let reply = self.client.request_default(&args.subject, args.payload.clone()).await?;
                self.print(&reply)?;
            }
            Command::Sub(args) => {
                let mut sub = match &args.queue {
                    Some(queue) => self.client.queue_subscribe(&args.subject, queue),
                    None => self.client.subscribe(&args.subject),
                };
                info!(subject = %args.subject, queue = ?args.queue, "listening");
                let mut seen = 0;
                while let Some(msg) = sub.next().await {
                    self.print(&msg)?;
                    seen += 1;
                    if args.count.is_some_and(|count| seen >= count) {
                        debug!(seen, "message count reached");
                        break;
                    }
                }
            }
            Command::Reply(args) => {
                let mut sub = match &args.queue {
                    Some(queue) => self.client.queue_subscribe(&args.subject, queue),
                    None => self.client.subscribe(&args.subject),
                };
                info!(subject = %args.subject, "answering requests");
                while let Some(msg) = sub.next().await {
                    let Some(reply_to) = msg.reply_to() else {
                        warn!(subject = %msg.subject(), "message without reply subject, ignoring");
                        continue;
                    };
                    self.client
                        .publish(reply_to, args.payload.clone())
                        .await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Service for CommandService {
    fn name(&self) -> &str {
        "command"
    }

    async fn run(&self) -> NatsResult<()> {
        let result = tokio::select! {
            biased;
            _ = self.token.cancelled() => Ok(()),
            result = self.execute() => result,
        };
        self.token.cancel();
        result
    }

    async fn shutdown(&self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use nats_client::{ClientConfig, ClientState, ServiceGroup};
    use nats_core::MemoryEngine;
    use tracing_test::traced_test;

    use super::*;
    use crate::config::cli::{PubArgs, ReplyArgs, SubArgs};

    /// `Write` into a buffer the test can read back.
    #[derive(Clone, Default)]
    struct Captured(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    fn client(engine: &Arc<MemoryEngine>) -> NatsClient {
        let config = ClientConfig::new("mem://test").with_poll_interval(Duration::from_millis(10));
        NatsClient::new(config, engine.clone())
    }

    fn group(client: &NatsClient, command: Command, out: Captured) -> ServiceGroup {
        let mut group = ServiceGroup::new();
        let service = CommandService::with_output(client.clone(), command, group.token(), Box::new(out));
        group.add(Arc::new(client.clone())).add(Arc::new(service));
        group
    }

    #[tokio::test]
    #[traced_test]
    async fn test_pub_then_exit() {
        let engine = Arc::new(MemoryEngine::new());
        let client = client(&engine);
        let group = group(
            &client,
            Command::Pub(PubArgs {
                subject: "greet".into(),
                payload: "hi".into(),
            }),
            Captured::default(),
        );
        tokio::time::timeout(Duration::from_secs(2), group.run())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(engine.stats().publishes, 1);
        assert_eq!(client.connection_state().await, ClientState::Closed);
        assert!(logs_contain("published"));
    }

    #[tokio::test]
    async fn test_sub_counts_then_exits() {
        let engine = Arc::new(MemoryEngine::new());
        let client = client(&engine);
        let out = Captured::default();
        let group = group(
            &client,
            Command::Sub(SubArgs {
                subject: "events.*".into(),
                queue: None,
                count: Some(2),
            }),
            out.clone(),
        );
        let running = tokio::spawn(async move { group.run().await });

        let publisher = {
            let engine = engine.clone();
            let client = client.clone();
            tokio::spawn(async move {
                while engine.live_subscriptions() == 0 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                for (subject, payload) in [("events.a", "one"), ("events.b", "two"), ("events.c", "three")] {
                    // the group may already be shutting down after the second message
                    let _ = client.publish(subject, payload).await;
                }
            })
        };
        publisher.await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(out.text(), "[events.a] one\n[events.b] two\n");
    }

    #[tokio::test]
    async fn test_req_against_reply() {
        let engine = Arc::new(MemoryEngine::new());
        let responder = client(&engine);
        let reply = group(
            &responder,
            Command::Reply(ReplyArgs {
                subject: "svc.ping".into(),
                payload: "pong".into(),
                queue: Some("pingers".into()),
            }),
            Captured::default(),
        );
        let reply_token = reply.token();
        let replying = tokio::spawn(async move { reply.run().await });
        while engine.live_subscriptions() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let requester = client(&engine);
        let out = Captured::default();
        let req = group(
            &requester,
            Command::Req(PubArgs {
                subject: "svc.ping".into(),
                payload: "ping".into(),
            }),
            out.clone(),
        );
        tokio::time::timeout(Duration::from_secs(2), req.run())
            .await
            .unwrap()
            .unwrap();
        assert!(out.text().ends_with("] pong\n"), "{}", out.text());

        reply_token.cancel();
        replying.await.unwrap().unwrap();
        assert_eq!(responder.connection_state().await, ClientState::Closed);
    }

    #[tokio::test]
    async fn test_req_without_responders_fails_group() {
        let engine = Arc::new(MemoryEngine::new());
        let client = client(&engine);
        let group = group(
            &client,
            Command::Req(PubArgs {
                subject: "svc.none".into(),
                payload: String::new(),
            }),
            Captured::default(),
        );
        let err = tokio::time::timeout(Duration::from_secs(2), group.run())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(
            err,
            NatsError::PublishFailed("Request failed: No Responders Available For Request".into())
        );
        assert_eq!(client.connection_state().await, ClientState::Closed);
    }
}
