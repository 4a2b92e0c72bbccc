//! Engine backed by a real NATS server through `async-nats`.
//!
//! The async client runs on a tokio runtime whose [`Handle`] the engine
//! keeps. Blocking primitives drive it with [`Handle::block_on`], so they
//! must be called from a thread that is not a runtime worker (for example
//! from `spawn_blocking`). Each subscription is pumped by a task on the same
//! runtime which invokes the delivery callback.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_nats::{ClientError, ConnectErrorKind, ConnectOptions, Event, client::RequestErrorKind};
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::oneshot, task::JoinHandle};
use tracing::{debug, trace, warn};

use crate::{
    engine::{
        Closure, ConnStatus, Engine, MsgCallback, RawConnection, RawOptions, RawSubscription,
        ReconnectPolicy,
    },
    error::{NatsError, NatsResult},
    handle::NativeMessage,
    status::Status,
    subject,
};

const DEFAULT_URL: &str = "nats://localhost:4222";

#[derive(Debug, Clone, Default)]
struct RemoteOptions {
    url: Option<String>,
    user: Option<(String, String)>,
    token: Option<String>,
    creds: Option<PathBuf>,
    reconnect: Option<ReconnectPolicy>,
}

/// Whether `event` leaves the connection unusable for good. async-nats
/// itself keeps reporting `Disconnected` once it has given up, so this is
/// the only place a closed connection shows.
fn is_terminal(event: &Event, reconnect_allowed: bool) -> bool {
    match event {
        Event::Closed | Event::ClientError(ClientError::MaxReconnects) => true,
        // async-nats always tries at least once, close on the first drop instead
        Event::Disconnected => !reconnect_allowed,
        _ => false,
    }
}

impl RemoteOptions {
    async fn build(self, lost: Arc<AtomicBool>) -> Result<ConnectOptions, Status> {
        let reconnect_allowed = self.reconnect.is_none_or(|policy| policy.allowed);
        let mut opts = ConnectOptions::new().event_callback(move |event| {
            let lost = Arc::clone(&lost);
            async move {
                if is_terminal(&event, reconnect_allowed) {
                    warn!(%event, "NATS connection lost for good");
                    lost.store(true, Ordering::Release);
                } else {
                    debug!(%event, "NATS connection event");
                }
            }
        });
        if let Some((user, password)) = self.user {
            opts = opts.user_and_password(user, password);
        }
        if let Some(token) = self.token {
            opts = opts.token(token);
        }
        if let Some(path) = &self.creds {
            opts = opts.credentials_file(path).await.map_err(|err| {
                warn!(?err, path = %path.display(), "failed to load credentials file");
                Status::IoError
            })?;
        }
        if let Some(policy) = self.reconnect {
            // async-nats treats 0 as unlimited
            let max = if policy.allowed && policy.max_reconnects > 0 {
                policy.max_reconnects as usize
            } else {
                1
            };
            let wait = policy.wait;
            opts = opts
                .max_reconnects(max)
                .reconnect_delay_callback(move |_| wait);
        }
        Ok(opts)
    }
}

#[derive(Debug, Clone, Copy)]
enum StopMode {
    Unsubscribe,
    Drain,
}

#[derive(Debug)]
struct RemoteSubscription {
    conn: u64,
    stop: Option<oneshot::Sender<StopMode>>,
    _task: JoinHandle<()>,
}

impl RemoteSubscription {
    fn stop(&mut self, mode: StopMode) -> bool {
        match self.stop.take() {
            Some(tx) => {
                // task already gone means nothing left to stop
                let _ = tx.send(mode);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug)]
struct RemoteConnection {
    // `None` once closed
    client: Option<async_nats::Client>,
    // set from the event callback
    lost: Arc<AtomicBool>,
}

/// Engine talking to a NATS server.
pub struct RemoteEngine {
    runtime: Handle,
    next_id: AtomicU64,
    options: Mutex<HashMap<u64, RemoteOptions>>,
    connections: Mutex<HashMap<u64, RemoteConnection>>,
    subscriptions: Mutex<HashMap<u64, RemoteSubscription>>,
}

impl fmt::Debug for RemoteEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteEngine")
            .field("connections", &self.connections.lock().len())
            .field("subscriptions", &self.subscriptions.lock().len())
            .finish_non_exhaustive()
    }
}

impl RemoteEngine {
    /// Engine driving the client on `runtime`.
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            next_id: AtomicU64::new(1),
            options: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Engine driving the client on the runtime of the calling context.
    pub fn current() -> NatsResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|err| NatsError::Config(format!("no tokio runtime available: {err}")))?;
        Ok(Self::new(runtime))
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn client(&self, conn: RawConnection) -> Result<async_nats::Client, Status> {
        self.connections
            .lock()
            .get(&conn.0)
            .and_then(|entry| entry.client.clone())
            .ok_or(Status::ConnectionClosed)
    }

    fn with_options(
        &self,
        options: RawOptions,
        f: impl FnOnce(&mut RemoteOptions),
    ) -> Result<(), Status> {
        let mut all = self.options.lock();
        let opts = all.get_mut(&options.0).ok_or(Status::InvalidArg)?;
        f(opts);
        Ok(())
    }

    fn start(
        &self,
        conn: RawConnection,
        subscriber: async_nats::Subscriber,
        callback: MsgCallback,
        closure: Closure,
    ) -> RawSubscription {
        let id = self.next_id();
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = self
            .runtime
            .spawn(deliver(id, subscriber, stop_rx, callback, closure));
        self.subscriptions.lock().insert(
            id,
            RemoteSubscription {
                conn: conn.0,
                stop: Some(stop_tx),
                _task: task,
            },
        );
        RawSubscription(id)
    }

    fn stop(&self, sub: RawSubscription, mode: StopMode) -> Result<(), Status> {
        match self.subscriptions.lock().get_mut(&sub.0).map(|entry| entry.stop(mode)) {
            Some(true) => Ok(()),
            _ => Err(Status::InvalidSubscription),
        }
    }
}

fn native(msg: async_nats::Message) -> NativeMessage {
    NativeMessage::new(
        msg.subject.to_string(),
        msg.reply.map(|r| r.to_string()),
        msg.payload,
    )
}

async fn deliver(
    id: u64,
    mut subscriber: async_nats::Subscriber,
    mut stop: oneshot::Receiver<StopMode>,
    callback: MsgCallback,
    closure: Closure,
) {
    let raw = RawSubscription(id);
    let emit = |msg: async_nats::Message| {
        let msg = native(msg);
        callback(raw, Some(msg.handle()), Some(&closure));
    };
    loop {
        tokio::select! {
            mode = &mut stop => {
                match mode {
                    Ok(StopMode::Drain) => {
                        if let Err(err) = subscriber.drain().await {
                            warn!(?err, sub = id, "failed to drain subscription");
                        }
                        while let Some(msg) = subscriber.next().await {
                            emit(msg);
                        }
                    }
                    // a dropped sender means the subscription was destroyed
                    Ok(StopMode::Unsubscribe) | Err(_) => {
                        if let Err(err) = subscriber.unsubscribe().await {
                            debug!(?err, sub = id, "unsubscribe failed");
                        }
                    }
                }
                break;
            }
            msg = subscriber.next() => match msg {
                Some(msg) => emit(msg),
                None => break,
            },
        }
    }
    trace!(sub = id, "subscription task finished");
}

impl Engine for RemoteEngine {
    fn options_create(&self) -> Result<RawOptions, Status> {
        let id = self.next_id();
        self.options.lock().insert(id, RemoteOptions::default());
        Ok(RawOptions(id))
    }

    fn options_destroy(&self, options: RawOptions) {
        self.options.lock().remove(&options.0);
    }

    fn options_set_url(&self, options: RawOptions, url: &str) -> Result<(), Status> {
        if !url.contains("://") {
            return Err(Status::InvalidArg);
        }
        self.with_options(options, |o| o.url = Some(url.to_owned()))
    }

    fn options_set_user_info(
        &self,
        options: RawOptions,
        user: &str,
        password: &str,
    ) -> Result<(), Status> {
        self.with_options(options, |o| {
            o.user = Some((user.to_owned(), password.to_owned()))
        })
    }

    fn options_set_token(&self, options: RawOptions, token: &str) -> Result<(), Status> {
        self.with_options(options, |o| o.token = Some(token.to_owned()))
    }

    fn options_set_credentials_file(
        &self,
        options: RawOptions,
        path: &Path,
    ) -> Result<(), Status> {
        self.with_options(options, |o| o.creds = Some(path.to_owned()))
    }

    fn options_set_reconnect(
        &self,
        options: RawOptions,
        policy: ReconnectPolicy,
    ) -> Result<(), Status> {
        self.with_options(options, |o| o.reconnect = Some(policy))
    }

    fn connect(&self, options: RawOptions) -> Result<RawConnection, Status> {
        let opts = self
            .options
            .lock()
            .get(&options.0)
            .cloned()
            .ok_or(Status::InvalidArg)?;
        let url = opts.url.clone().unwrap_or_else(|| DEFAULT_URL.to_owned());
        let lost = Arc::new(AtomicBool::new(false));
        let client = self.runtime.block_on(async {
            let connect = opts.build(Arc::clone(&lost)).await?;
            connect.connect(url.as_str()).await.map_err(|err| {
                debug!(?err, %url, "NATS connect failed");
                match err.kind() {
                    ConnectErrorKind::Authentication | ConnectErrorKind::AuthorizationViolation => {
                        Status::AuthFailed
                    }
                    ConnectErrorKind::TimedOut => Status::Timeout,
                    ConnectErrorKind::Io => Status::IoError,
                    _ => Status::NoServer,
                }
            })
        })?;
        let id = self.next_id();
        self.connections.lock().insert(
            id,
            RemoteConnection {
                client: Some(client),
                lost,
            },
        );
        debug!(conn = id, %url, "NATS connection established");
        Ok(RawConnection(id))
    }

    fn connection_close(&self, conn: RawConnection) {
        let client = self
            .connections
            .lock()
            .get_mut(&conn.0)
            .and_then(|entry| entry.client.take());
        for sub in self
            .subscriptions
            .lock()
            .values_mut()
            .filter(|s| s.conn == conn.0)
        {
            sub.stop(StopMode::Unsubscribe);
        }
        if let Some(client) = client {
            self.runtime.spawn(async move {
                if let Err(err) = client.flush().await {
                    debug!(?err, "flush on close failed");
                }
            });
        }
    }

    fn connection_destroy(&self, conn: RawConnection) {
        self.connection_close(conn);
        self.connections.lock().remove(&conn.0);
    }

    fn connection_status(&self, conn: RawConnection) -> ConnStatus {
        match self.connections.lock().get(&conn.0) {
            Some(RemoteConnection { lost, .. }) if lost.load(Ordering::Acquire) => {
                ConnStatus::Closed
            }
            Some(RemoteConnection {
                client: Some(client),
                ..
            }) => match client.connection_state() {
                async_nats::connection::State::Connected => ConnStatus::Connected,
                async_nats::connection::State::Disconnected => ConnStatus::Reconnecting,
                async_nats::connection::State::Pending => ConnStatus::Connecting,
            },
            _ => ConnStatus::Closed,
        }
    }

    fn publish(&self, conn: RawConnection, subject: &str, data: &[u8]) -> Result<(), Status> {
        if !subject::is_valid_subject(subject) {
            return Err(Status::InvalidSubject);
        }
        let client = self.client(conn)?;
        self.runtime
            .block_on(client.publish(subject.to_string(), Bytes::copy_from_slice(data)))
            .map_err(|err| {
                debug!(?err, subject, "publish failed");
                Status::Err
            })
    }

    fn publish_request(
        &self,
        conn: RawConnection,
        subject: &str,
        reply: &str,
        data: &[u8],
    ) -> Result<(), Status> {
        if !subject::is_valid_subject(subject) || !subject::is_valid_subject(reply) {
            return Err(Status::InvalidSubject);
        }
        let client = self.client(conn)?;
        self.runtime
            .block_on(client.publish_with_reply(
                subject.to_string(),
                reply.to_string(),
                Bytes::copy_from_slice(data),
            ))
            .map_err(|err| {
                debug!(?err, subject, "publish with reply failed");
                Status::Err
            })
    }

    fn subscribe(
        &self,
        conn: RawConnection,
        subject: &str,
        callback: MsgCallback,
        closure: Closure,
    ) -> Result<RawSubscription, Status> {
        if !subject::is_valid_pattern(subject) {
            return Err(Status::InvalidSubject);
        }
        let client = self.client(conn)?;
        let subscriber = self
            .runtime
            .block_on(client.subscribe(subject.to_string()))
            .map_err(|err| {
                debug!(?err, subject, "subscribe failed");
                Status::Err
            })?;
        Ok(self.start(conn, subscriber, callback, closure))
    }

    fn queue_subscribe(
        &self,
        conn: RawConnection,
        subject: &str,
        queue: &str,
        callback: MsgCallback,
        closure: Closure,
    ) -> Result<RawSubscription, Status> {
        if !subject::is_valid_pattern(subject) {
            return Err(Status::InvalidSubject);
        }
        if queue.is_empty() || queue.chars().any(char::is_whitespace) {
            return Err(Status::InvalidQueueName);
        }
        let client = self.client(conn)?;
        let subscriber = self
            .runtime
            .block_on(client.queue_subscribe(subject.to_string(), queue.to_string()))
            .map_err(|err| {
                debug!(?err, subject, queue, "queue subscribe failed");
                Status::Err
            })?;
        Ok(self.start(conn, subscriber, callback, closure))
    }

    fn unsubscribe(&self, sub: RawSubscription) -> Result<(), Status> {
        self.stop(sub, StopMode::Unsubscribe)
    }

    fn drain(&self, sub: RawSubscription) -> Result<(), Status> {
        self.stop(sub, StopMode::Drain)
    }

    fn subscription_destroy(&self, sub: RawSubscription) {
        if let Some(mut entry) = self.subscriptions.lock().remove(&sub.0) {
            entry.stop(StopMode::Unsubscribe);
        }
    }

    fn request(
        &self,
        conn: RawConnection,
        subject: &str,
        data: &[u8],
        timeout_ms: i64,
    ) -> Result<NativeMessage, Status> {
        if timeout_ms <= 0 {
            return Err(Status::InvalidTimeout);
        }
        if !subject::is_valid_subject(subject) {
            return Err(Status::InvalidSubject);
        }
        let client = self.client(conn)?;
        let timeout = Duration::from_millis(timeout_ms as u64);
        let payload = Bytes::copy_from_slice(data);
        self.runtime.block_on(async {
            match tokio::time::timeout(timeout, client.request(subject.to_string(), payload)).await
            {
                Err(_) => Err(Status::Timeout),
                Ok(Err(err)) => Err(match err.kind() {
                    RequestErrorKind::TimedOut => Status::Timeout,
                    RequestErrorKind::NoResponders => Status::NoResponders,
                    _ => Status::Err,
                }),
                Ok(Ok(msg)) => Ok(native(msg)),
            }
        })
    }
}
