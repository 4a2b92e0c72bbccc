//! Connection state and the single point through which it changes.

use std::{fmt, sync::Arc};

use nats_core::{ConnectionHandle, NatsError};
use tokio::sync::{Mutex, MutexGuard, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::metrics;

const EVENT_CAPACITY: usize = 64;

/// Connection lifecycle state, failure cause included.
///
/// Equality compares the kind only: two `Failed` states are equal whatever
/// their causes.
#[derive(Debug, Clone)]
pub enum ConnectionState {
    /// Never connected.
    Idle,
    /// Connect in flight.
    Connecting,
    /// Connected and usable.
    Connected,
    /// Graceful shutdown in progress.
    Closing,
    /// Shut down. `run()` may connect again.
    Closed,
    /// Connect failed or the connection died. Terminal.
    Failed(NatsError),
}

impl ConnectionState {
    /// Cause-free projection.
    pub fn kind(&self) -> ClientState {
        match self {
            ConnectionState::Idle => ClientState::Idle,
            ConnectionState::Connecting => ClientState::Connecting,
            ConnectionState::Connected => ClientState::Connected,
            ConnectionState::Closing => ClientState::Closing,
            ConnectionState::Closed => ClientState::Closed,
            ConnectionState::Failed(_) => ClientState::Failed,
        }
    }
}

impl PartialEq for ConnectionState {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind()
    }
}

impl Eq for ConnectionState {}

/// Public view of the connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    /// Never connected.
    Idle,
    /// Connect in flight.
    Connecting,
    /// Connected and usable.
    Connected,
    /// Graceful shutdown in progress.
    Closing,
    /// Shut down.
    Closed,
    /// Connect failed or the connection died.
    Failed,
}

impl ClientState {
    fn gauge(self) -> i64 {
        match self {
            ClientState::Idle => 0,
            ClientState::Connecting => 1,
            ClientState::Connected => 2,
            ClientState::Closing => 3,
            ClientState::Closed => 4,
            ClientState::Failed => 5,
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClientState::Idle => "idle",
            ClientState::Connecting => "connecting",
            ClientState::Connected => "connected",
            ClientState::Closing => "closing",
            ClientState::Closed => "closed",
            ClientState::Failed => "failed",
        })
    }
}

#[derive(Debug)]
struct Slot {
    state: ConnectionState,
    conn: Option<Arc<ConnectionHandle>>,
    shutdown: CancellationToken,
    // bumped by every run that enters `Connecting`
    attempt: u64,
}

/// Owner of the connection state.
///
/// Every read and write goes through [`StateHolder::lock`]. Transitions are
/// broadcast while the lock is held, so observers see them in the same total
/// order in which they happened.
#[derive(Debug)]
pub(crate) struct StateHolder {
    slot: Mutex<Slot>,
    events: broadcast::Sender<ClientState>,
}

impl StateHolder {
    pub(crate) fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            slot: Mutex::new(Slot {
                state: ConnectionState::Idle,
                conn: None,
                shutdown: CancellationToken::new(),
                attempt: 0,
            }),
            events,
        }
    }

    pub(crate) async fn lock(&self) -> StateGuard<'_> {
        StateGuard {
            slot: self.slot.lock().await,
            events: &self.events,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ClientState> {
        self.events.subscribe()
    }
}

pub(crate) struct StateGuard<'a> {
    slot: MutexGuard<'a, Slot>,
    events: &'a broadcast::Sender<ClientState>,
}

impl StateGuard<'_> {
    pub(crate) fn state(&self) -> &ConnectionState {
        &self.slot.state
    }

    pub(crate) fn set(&mut self, state: ConnectionState) {
        let from = self.slot.state.kind();
        let to = state.kind();
        self.slot.state = state;
        if from != to {
            debug!(%from, %to, "NATS connection state transition");
            metrics::NATS_CONNECTION_STATE.set(to.gauge());
            // no receivers is fine
            let _ = self.events.send(to);
        }
    }

    pub(crate) fn conn(&self) -> Option<Arc<ConnectionHandle>> {
        self.slot.conn.clone()
    }

    pub(crate) fn set_conn(&mut self, conn: Arc<ConnectionHandle>) {
        self.slot.conn = Some(conn);
    }

    pub(crate) fn take_conn(&mut self) -> Option<Arc<ConnectionHandle>> {
        self.slot.conn.take()
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.slot.shutdown.clone()
    }

    /// Fresh token for a new run. The previous one stays cancelled.
    pub(crate) fn renew_shutdown_token(&mut self) -> CancellationToken {
        if self.slot.shutdown.is_cancelled() {
            self.slot.shutdown = CancellationToken::new();
        }
        self.slot.shutdown.clone()
    }

    /// Start a new connect attempt, superseding any older one still in
    /// flight.
    pub(crate) fn begin_attempt(&mut self) -> u64 {
        self.slot.attempt += 1;
        self.slot.attempt
    }

    /// Whether `attempt` is the latest one and the client is still waiting
    /// for it.
    pub(crate) fn is_connecting(&self, attempt: u64) -> bool {
        self.slot.attempt == attempt && self.slot.state == ConnectionState::Connecting
    }
}
