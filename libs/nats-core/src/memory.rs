//! In-process engine.
//!
//! `MemoryEngine` is a small broker living inside the process. It honours
//! the same threading contract as a real engine: every subscription gets its
//! own delivery thread, so callbacks never run on the caller's thread. It
//! also counts every primitive it executes and can be told to fail, which is
//! what the test suites use to check resource discipline.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use bytes::Bytes;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::{
    engine::{
        Closure, ConnStatus, Engine, MsgCallback, RawConnection, RawOptions, RawSubscription,
        ReconnectPolicy,
    },
    handle::NativeMessage,
    status::Status,
    subject,
};

const DEFAULT_URL: &str = "nats://localhost:4222";
const INBOX_PREFIX: &str = "_INBOX.";

/// Snapshot of the primitives a [`MemoryEngine`] has executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Options resources allocated.
    pub options_created: u64,
    /// Options resources released.
    pub options_destroyed: u64,
    /// Options resources currently allocated.
    pub options_live: u64,
    /// Successful connects.
    pub connects: u64,
    /// Connections closed.
    pub closes: u64,
    /// Connection resources released.
    pub connections_destroyed: u64,
    /// Successful publishes.
    pub publishes: u64,
    /// Successful subscribes, queue subscribes included.
    pub subscribes: u64,
    /// Successful unsubscribes.
    pub unsubscribes: u64,
    /// Successful drains.
    pub drains: u64,
    /// Subscription resources released.
    pub subscriptions_destroyed: u64,
    /// Callback invocations.
    pub deliveries: u64,
    /// Requests attempted.
    pub requests: u64,
}

#[derive(Debug, Default)]
struct Counters {
    options_created: AtomicU64,
    options_destroyed: AtomicU64,
    connects: AtomicU64,
    closes: AtomicU64,
    connections_destroyed: AtomicU64,
    publishes: AtomicU64,
    subscribes: AtomicU64,
    unsubscribes: AtomicU64,
    drains: AtomicU64,
    subscriptions_destroyed: AtomicU64,
    deliveries: AtomicU64,
    requests: AtomicU64,
}

fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn get(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

#[derive(Debug, Clone, Default)]
struct Options {
    url: Option<String>,
    user: Option<(String, String)>,
    token: Option<String>,
    creds: Option<PathBuf>,
    reconnect: Option<ReconnectPolicy>,
}

#[derive(Debug)]
struct Subscription {
    conn: u64,
    pattern: String,
    queue: Option<String>,
    // `None` once the subscription stopped routing; dropping the sender lets
    // the delivery thread run out.
    tx: Option<Sender<NativeMessage>>,
    // Set on unsubscribe so that already queued messages are discarded.
    discard: Arc<AtomicBool>,
}

impl Subscription {
    fn is_routing(&self) -> bool {
        self.tx.is_some()
    }

    fn send(&self, msg: NativeMessage) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.send(msg).is_ok())
    }

    fn stop(&mut self, discard: bool) {
        if discard {
            self.discard.store(true, Ordering::Release);
        }
        self.tx = None;
    }
}

#[derive(Debug, Default)]
struct Faults {
    connect: Option<Status>,
    subscribe: Option<Status>,
    publish: Option<Status>,
    connect_delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct Broker {
    options: HashMap<u64, Options>,
    connections: HashMap<u64, ConnStatus>,
    // ordered so that queue group selection is deterministic
    subscriptions: BTreeMap<u64, Subscription>,
    inboxes: HashMap<String, Sender<NativeMessage>>,
    queue_cursor: HashMap<String, usize>,
    required_user: Option<(String, String)>,
    required_token: Option<String>,
    last_connect: Option<Options>,
    faults: Faults,
}

impl Broker {
    fn check_open(&self, conn: RawConnection) -> Result<(), Status> {
        match self.connections.get(&conn.0) {
            Some(ConnStatus::Connected) => Ok(()),
            Some(ConnStatus::Connecting | ConnStatus::Reconnecting) => {
                Err(Status::ConnectionDisconnected)
            }
            _ => Err(Status::ConnectionClosed),
        }
    }

    fn check_auth(&self, opts: &Options) -> Result<(), Status> {
        if let Some(required) = &self.required_user {
            if opts.user.as_ref() != Some(required) {
                return Err(Status::AuthFailed);
            }
        }
        if let Some(required) = &self.required_token {
            if opts.token.as_ref() != Some(required) {
                return Err(Status::AuthFailed);
            }
        }
        Ok(())
    }

    fn close(&mut self, conn: u64) -> bool {
        let closed = match self.connections.get_mut(&conn) {
            Some(status) if *status != ConnStatus::Closed => {
                *status = ConnStatus::Closed;
                true
            }
            _ => false,
        };
        for sub in self.subscriptions.values_mut().filter(|s| s.conn == conn) {
            sub.stop(true);
        }
        closed
    }

    /// Fan `subject` out to every interested subscription. Returns the number
    /// of recipients.
    fn route(&mut self, subject: &str, reply: Option<&str>, data: &[u8]) -> usize {
        let msg = NativeMessage::new(
            subject,
            reply.map(str::to_owned),
            Bytes::copy_from_slice(data),
        );
        if let Some(inbox) = self.inboxes.get(subject) {
            return usize::from(inbox.try_send(msg).is_ok());
        }

        let mut delivered = 0;
        let mut groups: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        for (id, sub) in &self.subscriptions {
            if !sub.is_routing() || !subject::matches(&sub.pattern, subject) {
                continue;
            }
            match &sub.queue {
                Some(queue) => groups.entry(queue.clone()).or_default().push(*id),
                None => delivered += usize::from(sub.send(msg.clone())),
            }
        }
        for (queue, members) in groups {
            let cursor = self.queue_cursor.entry(queue).or_insert(0);
            let id = members[*cursor % members.len()];
            *cursor = cursor.wrapping_add(1);
            if let Some(sub) = self.subscriptions.get(&id) {
                delivered += usize::from(sub.send(msg.clone()));
            }
        }
        delivered
    }
}

/// In-process engine with instrumentation and fault injection.
#[derive(Default)]
pub struct MemoryEngine {
    broker: Mutex<Broker>,
    next_id: AtomicU64,
    counters: Arc<Counters>,
}

impl fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl MemoryEngine {
    /// Empty broker without auth requirements.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> EngineStats {
        let c = &self.counters;
        let options_created = get(&c.options_created);
        let options_destroyed = get(&c.options_destroyed);
        EngineStats {
            options_created,
            options_destroyed,
            options_live: options_created.saturating_sub(options_destroyed),
            connects: get(&c.connects),
            closes: get(&c.closes),
            connections_destroyed: get(&c.connections_destroyed),
            publishes: get(&c.publishes),
            subscribes: get(&c.subscribes),
            unsubscribes: get(&c.unsubscribes),
            drains: get(&c.drains),
            subscriptions_destroyed: get(&c.subscriptions_destroyed),
            deliveries: get(&c.deliveries),
            requests: get(&c.requests),
        }
    }

    /// Number of subscriptions still receiving new messages.
    pub fn live_subscriptions(&self) -> usize {
        self.broker
            .lock()
            .subscriptions
            .values()
            .filter(|s| s.is_routing())
            .count()
    }

    /// Only accept connections presenting these credentials.
    pub fn require_user(&self, user: impl Into<String>, password: impl Into<String>) {
        self.broker.lock().required_user = Some((user.into(), password.into()));
    }

    /// Only accept connections presenting this token.
    pub fn require_token(&self, token: impl Into<String>) {
        self.broker.lock().required_token = Some(token.into());
    }

    /// Fail the next connect with `status`.
    pub fn fail_next_connect(&self, status: Status) {
        self.broker.lock().faults.connect = Some(status);
    }

    /// Fail the next subscribe with `status`.
    pub fn fail_next_subscribe(&self, status: Status) {
        self.broker.lock().faults.subscribe = Some(status);
    }

    /// Fail the next publish with `status`.
    pub fn fail_next_publish(&self, status: Status) {
        self.broker.lock().faults.publish = Some(status);
    }

    /// Make every connect block for `delay` before completing.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.broker.lock().faults.connect_delay = delay;
    }

    /// Close every connection from the server side, as if reconnects had
    /// been exhausted.
    pub fn kill_connections(&self) {
        let mut broker = self.broker.lock();
        let ids: Vec<u64> = broker.connections.keys().copied().collect();
        for id in ids {
            broker.close(id);
        }
        debug!("memory engine closed all connections");
    }

    /// URL used by the most recent successful connect.
    pub fn last_connect_url(&self) -> Option<String> {
        self.broker
            .lock()
            .last_connect
            .as_ref()
            .map(|o| o.url.clone().unwrap_or_else(|| DEFAULT_URL.to_owned()))
    }

    /// Reconnect policy passed to the most recent successful connect.
    pub fn last_reconnect_policy(&self) -> Option<ReconnectPolicy> {
        self.broker
            .lock()
            .last_connect
            .as_ref()
            .and_then(|o| o.reconnect)
    }

    fn with_options(
        &self,
        options: RawOptions,
        f: impl FnOnce(&mut Options),
    ) -> Result<(), Status> {
        let mut broker = self.broker.lock();
        let opts = broker
            .options
            .get_mut(&options.0)
            .ok_or(Status::InvalidArg)?;
        f(opts);
        Ok(())
    }

    fn add_subscription(
        &self,
        conn: RawConnection,
        pattern: &str,
        queue: Option<&str>,
        callback: MsgCallback,
        closure: Closure,
    ) -> Result<RawSubscription, Status> {
        let mut broker = self.broker.lock();
        if let Some(status) = broker.faults.subscribe.take() {
            return Err(status);
        }
        broker.check_open(conn)?;
        if !subject::is_valid_pattern(pattern) {
            return Err(Status::InvalidSubject);
        }
        if queue.is_some_and(|q| q.is_empty() || q.chars().any(char::is_whitespace)) {
            return Err(Status::InvalidQueueName);
        }

        let id = self.next_id();
        let (tx, rx) = crossbeam_channel::unbounded::<NativeMessage>();
        let discard = Arc::new(AtomicBool::new(false));
        let counters = Arc::clone(&self.counters);
        let thread_discard = Arc::clone(&discard);
        thread::Builder::new()
            .name(format!("nats-mem-sub-{id}"))
            .spawn(move || {
                let raw = RawSubscription(id);
                for msg in rx.iter() {
                    if thread_discard.load(Ordering::Acquire) {
                        break;
                    }
                    callback(raw, Some(msg.handle()), Some(&closure));
                    inc(&counters.deliveries);
                }
                trace!(sub = id, "delivery thread finished");
            })
            .map_err(|err| {
                warn!(?err, "failed to spawn delivery thread");
                Status::Err
            })?;

        broker.subscriptions.insert(
            id,
            Subscription {
                conn: conn.0,
                pattern: pattern.to_owned(),
                queue: queue.map(str::to_owned),
                tx: Some(tx),
                discard,
            },
        );
        inc(&self.counters.subscribes);
        trace!(sub = id, pattern, ?queue, "memory subscription added");
        Ok(RawSubscription(id))
    }

    fn stop_subscription(&self, sub: RawSubscription, discard: bool) -> Result<(), Status> {
        let mut broker = self.broker.lock();
        match broker.subscriptions.get_mut(&sub.0) {
            Some(entry) if entry.is_routing() => {
                entry.stop(discard);
                Ok(())
            }
            _ => Err(Status::InvalidSubscription),
        }
    }
}

impl Engine for MemoryEngine {
    fn options_create(&self) -> Result<RawOptions, Status> {
        let id = self.next_id();
        self.broker.lock().options.insert(id, Options::default());
        inc(&self.counters.options_created);
        Ok(RawOptions(id))
    }

    fn options_destroy(&self, options: RawOptions) {
        if self.broker.lock().options.remove(&options.0).is_some() {
            inc(&self.counters.options_destroyed);
        }
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
        let delay = self.broker.lock().faults.connect_delay;
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let mut broker = self.broker.lock();
        if let Some(status) = broker.faults.connect.take() {
            return Err(status);
        }
        let opts = broker
            .options
            .get(&options.0)
            .cloned()
            .ok_or(Status::InvalidArg)?;
        if let Some(path) = &opts.creds {
            std::fs::metadata(path).map_err(|_| Status::IoError)?;
        }
        broker.check_auth(&opts)?;

        let id = self.next_id();
        broker.connections.insert(id, ConnStatus::Connected);
        debug!(
            conn = id,
            url = opts.url.as_deref().unwrap_or(DEFAULT_URL),
            "memory connection established"
        );
        broker.last_connect = Some(opts);
        inc(&self.counters.connects);
        Ok(RawConnection(id))
    }

    fn connection_close(&self, conn: RawConnection) {
        if self.broker.lock().close(conn.0) {
            inc(&self.counters.closes);
        }
    }

    fn connection_destroy(&self, conn: RawConnection) {
        let mut broker = self.broker.lock();
        if broker.close(conn.0) {
            inc(&self.counters.closes);
        }
        if broker.connections.remove(&conn.0).is_some() {
            inc(&self.counters.connections_destroyed);
        }
    }

    fn connection_status(&self, conn: RawConnection) -> ConnStatus {
        self.broker
            .lock()
            .connections
            .get(&conn.0)
            .copied()
            .unwrap_or(ConnStatus::Closed)
    }

    fn publish(&self, conn: RawConnection, subject: &str, data: &[u8]) -> Result<(), Status> {
        let mut broker = self.broker.lock();
        broker.check_open(conn)?;
        if let Some(status) = broker.faults.publish.take() {
            return Err(status);
        }
        if !subject::is_valid_subject(subject) {
            return Err(Status::InvalidSubject);
        }
        broker.route(subject, None, data);
        inc(&self.counters.publishes);
        Ok(())
    }

    fn publish_request(
        &self,
        conn: RawConnection,
        subject: &str,
        reply: &str,
        data: &[u8],
    ) -> Result<(), Status> {
        let mut broker = self.broker.lock();
        broker.check_open(conn)?;
        if let Some(status) = broker.faults.publish.take() {
            return Err(status);
        }
        if !subject::is_valid_subject(subject) || !subject::is_valid_subject(reply) {
            return Err(Status::InvalidSubject);
        }
        broker.route(subject, Some(reply), data);
        inc(&self.counters.publishes);
        Ok(())
    }

    fn subscribe(
        &self,
        conn: RawConnection,
        subject: &str,
        callback: MsgCallback,
        closure: Closure,
    ) -> Result<RawSubscription, Status> {
        self.add_subscription(conn, subject, None, callback, closure)
    }

    fn queue_subscribe(
        &self,
        conn: RawConnection,
        subject: &str,
        queue: &str,
        callback: MsgCallback,
        closure: Closure,
    ) -> Result<RawSubscription, Status> {
        self.add_subscription(conn, subject, Some(queue), callback, closure)
    }

    fn unsubscribe(&self, sub: RawSubscription) -> Result<(), Status> {
        self.stop_subscription(sub, true)?;
        inc(&self.counters.unsubscribes);
        Ok(())
    }

    fn drain(&self, sub: RawSubscription) -> Result<(), Status> {
        self.stop_subscription(sub, false)?;
        inc(&self.counters.drains);
        Ok(())
    }

    fn subscription_destroy(&self, sub: RawSubscription) {
        let mut broker = self.broker.lock();
        if let Some(mut entry) = broker.subscriptions.remove(&sub.0) {
            if entry.is_routing() {
                entry.stop(true);
            }
            inc(&self.counters.subscriptions_destroyed);
        }
    }

    fn request(
        &self,
        conn: RawConnection,
        subject: &str,
        data: &[u8],
        timeout_ms: i64,
    ) -> Result<NativeMessage, Status> {
        inc(&self.counters.requests);
        if timeout_ms <= 0 {
            return Err(Status::InvalidTimeout);
        }
        let inbox = format!("{INBOX_PREFIX}{}", Uuid::new_v4().simple());
        let (tx, rx) = crossbeam_channel::bounded(1);
        {
            let mut broker = self.broker.lock();
            broker.check_open(conn)?;
            if !subject::is_valid_subject(subject) {
                return Err(Status::InvalidSubject);
            }
            broker.inboxes.insert(inbox.clone(), tx);
            if broker.route(subject, Some(&inbox), data) == 0 {
                broker.inboxes.remove(&inbox);
                return Err(Status::NoResponders);
            }
        }
        let reply = rx.recv_timeout(Duration::from_millis(timeout_ms as u64));
        self.broker.lock().inboxes.remove(&inbox);
        reply.map_err(|_| Status::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use crossbeam_channel::Receiver;

    use super::*;
    use crate::handle::MessageHandle;

    type Inbox = Sender<(String, Option<String>, Vec<u8>)>;

    fn record(_: RawSubscription, msg: Option<MessageHandle<'_>>, closure: Option<&Closure>) {
        let (Some(msg), Some(closure)) = (msg, closure) else {
            return;
        };
        if let Some(tx) = closure.downcast_ref::<Inbox>() {
            let _ = tx.send((
                msg.subject().unwrap_or_default().to_owned(),
                msg.reply().map(str::to_owned),
                msg.data().unwrap_or_default().to_vec(),
            ));
        }
    }

    fn connect(engine: &MemoryEngine) -> RawConnection {
        let opts = engine.options_create().unwrap();
        let conn = engine.connect(opts).unwrap();
        engine.options_destroy(opts);
        conn
    }

    fn subscribe(
        engine: &MemoryEngine,
        conn: RawConnection,
        subject: &str,
        queue: Option<&str>,
    ) -> (RawSubscription, Receiver<(String, Option<String>, Vec<u8>)>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let closure: Closure = Arc::new(tx);
        let sub = match queue {
            Some(q) => engine.queue_subscribe(conn, subject, q, record, closure),
            None => engine.subscribe(conn, subject, record, closure),
        }
        .unwrap();
        (sub, rx)
    }

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn test_publish_reaches_matching_subscribers() {
        let engine = MemoryEngine::new();
        let conn = connect(&engine);
        let (_a, rx_a) = subscribe(&engine, conn, "test.*", None);
        let (_b, rx_b) = subscribe(&engine, conn, "other", None);

        engine.publish(conn, "test.pubsub", b"hello").unwrap();
        let (subject, reply, data) = rx_a.recv_timeout(WAIT).unwrap();
        assert_eq!(subject, "test.pubsub");
        assert_eq!(reply, None);
        assert_eq!(data, b"hello");
        assert!(rx_b.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(engine.stats().publishes, 1);
    }

    #[test]
    fn test_delivery_preserves_order() {
        let engine = MemoryEngine::new();
        let conn = connect(&engine);
        let (_sub, rx) = subscribe(&engine, conn, "seq", None);
        for i in 0..50u8 {
            engine.publish(conn, "seq", &[i]).unwrap();
        }
        for i in 0..50u8 {
            assert_eq!(rx.recv_timeout(WAIT).unwrap().2, vec![i]);
        }
    }

    #[test]
    fn test_queue_group_round_robin() {
        let engine = MemoryEngine::new();
        let conn = connect(&engine);
        let (_a, rx_a) = subscribe(&engine, conn, "work", Some("workers"));
        let (_b, rx_b) = subscribe(&engine, conn, "work", Some("workers"));
        for _ in 0..4 {
            engine.publish(conn, "work", b"job").unwrap();
        }
        for rx in [&rx_a, &rx_b] {
            rx.recv_timeout(WAIT).unwrap();
            rx.recv_timeout(WAIT).unwrap();
            assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        }
    }

    #[test]
    fn test_unsubscribe_stops_delivery_and_twice_is_invalid() {
        let engine = MemoryEngine::new();
        let conn = connect(&engine);
        let (sub, rx) = subscribe(&engine, conn, "a", None);
        assert_eq!(engine.live_subscriptions(), 1);
        engine.unsubscribe(sub).unwrap();
        assert_eq!(engine.unsubscribe(sub), Err(Status::InvalidSubscription));
        assert_eq!(engine.drain(sub), Err(Status::InvalidSubscription));
        engine.publish(conn, "a", b"late").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(engine.live_subscriptions(), 0);
        engine.subscription_destroy(sub);
        assert_eq!(engine.stats().subscriptions_destroyed, 1);
        assert_eq!(
            engine.unsubscribe(RawSubscription(9999)),
            Err(Status::InvalidSubscription)
        );
    }

    #[test]
    fn test_drain_flushes_queued_messages() {
        let engine = MemoryEngine::new();
        let conn = connect(&engine);
        let (sub, rx) = subscribe(&engine, conn, "d", None);
        engine.publish(conn, "d", b"1").unwrap();
        engine.publish(conn, "d", b"2").unwrap();
        engine.drain(sub).unwrap();
        engine.publish(conn, "d", b"3").unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap().2, b"1");
        assert_eq!(rx.recv_timeout(WAIT).unwrap().2, b"2");
        // sender dropped once the delivery thread finishes
        assert!(rx.recv_timeout(WAIT).is_err());
    }

    #[test]
    fn test_closure_released_after_last_delivery() {
        let engine = MemoryEngine::new();
        let conn = connect(&engine);
        let closure: Closure = Arc::new(());
        let sub = engine
            .subscribe(conn, "c", record, Arc::clone(&closure))
            .unwrap();
        engine.publish(conn, "c", b"1").unwrap();
        engine.subscription_destroy(sub);
        let deadline = Instant::now() + WAIT;
        while Arc::strong_count(&closure) > 1 {
            assert!(Instant::now() < deadline, "closure still held");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_request_reply() {
        let engine = Arc::new(MemoryEngine::new());
        let conn = connect(&engine);
        let (_sub, rx) = subscribe(&engine, conn, "echo", None);
        let responder = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let (_, reply, data) = rx.recv_timeout(WAIT).unwrap();
                engine.publish(conn, &reply.unwrap(), &data).unwrap();
            })
        };
        let reply = engine.request(conn, "echo", b"ping", 2_000).unwrap();
        assert_eq!(reply.handle().data(), Some(&b"ping"[..]));
        assert!(reply.handle().subject().unwrap().starts_with(INBOX_PREFIX));
        responder.join().unwrap();
    }

    #[test]
    fn test_request_failures() {
        let engine = MemoryEngine::new();
        let conn = connect(&engine);
        assert_eq!(
            engine.request(conn, "nobody", b"", 100).unwrap_err(),
            Status::NoResponders
        );
        assert_eq!(
            engine.request(conn, "nobody", b"", 0).unwrap_err(),
            Status::InvalidTimeout
        );

        let (_sub, _rx) = subscribe(&engine, conn, "silent", None);
        let start = Instant::now();
        assert_eq!(
            engine.request(conn, "silent", b"", 100).unwrap_err(),
            Status::Timeout
        );
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_auth_and_faults() {
        let engine = MemoryEngine::new();
        engine.require_user("alice", "secret");
        let opts = engine.options_create().unwrap();
        assert_eq!(engine.connect(opts), Err(Status::AuthFailed));
        engine.options_set_user_info(opts, "alice", "secret").unwrap();
        engine.fail_next_connect(Status::NoServer);
        assert_eq!(engine.connect(opts), Err(Status::NoServer));
        let conn = engine.connect(opts).unwrap();

        engine.fail_next_publish(Status::MaxPayload);
        assert_eq!(engine.publish(conn, "a", b"x"), Err(Status::MaxPayload));
        engine.fail_next_subscribe(Status::NotPermitted);
        assert_eq!(
            engine.subscribe(conn, "a", record, Arc::new(())),
            Err(Status::NotPermitted)
        );
        assert_eq!(engine.publish(conn, "", b"x"), Err(Status::InvalidSubject));
        assert_eq!(
            engine.options_set_url(opts, "localhost"),
            Err(Status::InvalidArg)
        );
    }

    #[test]
    fn test_missing_credentials_file() {
        let engine = MemoryEngine::new();
        let opts = engine.options_create().unwrap();
        engine
            .options_set_credentials_file(opts, Path::new("/nonexistent/user.creds"))
            .unwrap();
        assert_eq!(engine.connect(opts), Err(Status::IoError));
    }

    #[test]
    fn test_kill_connections_closes_everything() {
        let engine = MemoryEngine::new();
        let conn = connect(&engine);
        let (_sub, _rx) = subscribe(&engine, conn, "a", None);
        engine.kill_connections();
        assert_eq!(engine.connection_status(conn), ConnStatus::Closed);
        assert_eq!(engine.live_subscriptions(), 0);
        assert_eq!(engine.publish(conn, "a", b"x"), Err(Status::ConnectionClosed));
        engine.connection_destroy(conn);
        let stats = engine.stats();
        assert_eq!(stats.closes, 1);
        assert_eq!(stats.connections_destroyed, 1);
    }
}
