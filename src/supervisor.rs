//! Connection supervisor
//!
//! Finds the port the Crownstone USB dongle is attached to, connects to it and
//! keeps the connection alive.
//!
//! ```text
//! Idle --discover--> Discovering --pick candidate--> Connecting
//! Connecting --open ok--> Handshaking --ack--> Ready
//! Connecting --open fails / no candidates left--> Failed --backoff--> Discovering
//! Handshaking --nack/timeout--> Connecting (next candidate)
//! Ready --link lost--> Discovering
//! ```
//!
//! None of the failures are errors to the caller: an absent or lost device is
//! retried until it shows up or [`ConnectionSupervisor::stop`] is called.
//!
//! Every run of the state machine belongs to a session generation. `stop` and
//! `initialize` start a new generation, and any continuation that finds its
//! generation outdated exits without touching the state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::{Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::connection::{CandidatePort, Connector, PortDiscovery, Transport};
use crate::error::Error;
use crate::events::{Event, EventBus, EventPayload, Topic};
use crate::packets::{UartTxType, DEFAULT_BAUD_RATE};
use crate::Result;

/// Delay before discovering ports again after running out of candidates
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// State of the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not started, or stopped
    Idle,
    /// Enumerating candidate ports
    Discovering,
    /// Opening a port
    Connecting,
    /// Waiting for the device to answer the handshake
    Handshaking,
    /// Connected and handshaken
    Ready,
    /// Out of candidates, waiting before discovering again
    Failed,
}

/// Position in the candidate list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptCursor {
    /// Index of the candidate being tried
    pub index: usize,
    /// Port of the last attempt
    pub port: Option<String>,
}

/// Supervisor configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Port to try first, see [`ConnectionSupervisor::initialize`]
    pub port: Option<String>,
    /// Baud rate used to open ports
    pub baud_rate: u32,
    /// Delay between running out of candidates and discovering again
    pub retry_delay: Duration,
    /// Runtime to run the link watch on, defaults to the runtime of the
    /// first `initialize` call
    pub runtime: Option<Handle>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            retry_delay: DEFAULT_RETRY_DELAY,
            runtime: None,
        }
    }
}

enum Attempt {
    Ready,
    HandshakeFailed,
    OpenFailed,
    /// Superseded by `stop` or a newer `initialize`
    Stale,
}

struct Session {
    state: ConnectionState,
    candidates: Option<Vec<CandidatePort>>,
    cursor: AttemptCursor,
    transport: Option<Arc<dyn Transport>>,
    active_port: Option<String>,
    baud_rate: u32,
    watch: Option<JoinHandle<()>>,
    runtime: Option<Handle>,
}

impl Session {
    fn close_transport(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        self.active_port = None;
    }

    /// Forget everything learned about the ports
    fn clear(&mut self) {
        self.close_transport();
        self.candidates = None;
        self.cursor = AttemptCursor::default();
    }
}

struct Shared {
    session: Mutex<Session>,
    running: AtomicBool,
    generation: AtomicU64,
    discovery: Arc<dyn PortDiscovery>,
    connector: Arc<dyn Connector>,
    bus: EventBus,
    port: Option<String>,
    retry_delay: Duration,
}

/// Discovers, connects and reconnects the link to the device
///
/// Cloning yields another handle to the same supervisor.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    shared: Arc<Shared>,
}

impl ConnectionSupervisor {
    /// Create an idle supervisor; nothing happens until it is initialized
    pub fn new(
        bus: EventBus,
        config: SupervisorConfig,
        discovery: Arc<dyn PortDiscovery>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                session: Mutex::new(Session {
                    state: ConnectionState::Idle,
                    candidates: None,
                    cursor: AttemptCursor::default(),
                    transport: None,
                    active_port: None,
                    baud_rate: config.baud_rate,
                    watch: None,
                    runtime: config.runtime,
                }),
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                discovery,
                connector,
                bus,
                port: config.port,
                retry_delay: config.retry_delay,
            }),
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.shared.session.lock()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.shared.running.load(Ordering::SeqCst)
            && self.shared.generation.load(Ordering::SeqCst) == generation
    }

    /// Port given in the [`SupervisorConfig`]
    pub fn configured_port(&self) -> Option<&str> {
        self.shared.port.as_deref()
    }

    /// Initialize with the configured port and baud rate
    pub async fn start(&self) {
        let baud_rate = self.session().baud_rate;
        self.initialize(self.configured_port(), baud_rate).await
    }

    /// Connect to the device, returning once the connection is ready
    ///
    /// A `port` found among the candidates is connected without a
    /// handshake. A `port` that is not among them is tried anyway, with a
    /// handshake. Without a `port` the candidates are tried in order,
    /// starting at the attempt cursor.
    ///
    /// When no candidate works the supervisor waits, discovers the ports
    /// again and starts over, for as long as it is not stopped. Returns
    /// early when [`stop`](Self::stop) or another `initialize` supersedes
    /// this call.
    pub async fn initialize(&self, port: Option<&str>, baud_rate: u32) {
        self.shared.running.store(true, Ordering::SeqCst);
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

        {
            let mut session = self.session();
            if let Some(watch) = session.watch.take() {
                watch.abort();
            }
            session.close_transport();
            session.baud_rate = baud_rate;
            session.state = ConnectionState::Discovering;
            if session.runtime.is_none() {
                session.runtime = Handle::try_current().ok();
            }
        }

        self.run(generation, port.map(str::to_owned)).await
    }

    /// Forget the ports and the connection, then [`initialize`](Self::initialize)
    pub async fn reset(&self) {
        let baud_rate = {
            let mut session = self.session();
            session.clear();
            session.state = ConnectionState::Discovering;
            session.baud_rate
        };

        self.initialize(None, baud_rate).await
    }

    /// Stop supervising and close the connection
    ///
    /// Safe to call in any state, any number of times. A link loss after
    /// this does not trigger a reconnect.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.generation.fetch_add(1, Ordering::SeqCst);

        let mut session = self.session();
        if let Some(watch) = session.watch.take() {
            watch.abort();
        }
        session.close_transport();
        session.state = ConnectionState::Idle;
    }

    /// Whether the connection is ready
    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Current state of the connection
    pub fn state(&self) -> ConnectionState {
        self.session().state
    }

    /// Port of the ready connection
    pub fn active_port(&self) -> Option<String> {
        self.session().active_port.clone()
    }

    /// Candidate being tried, and the port of the last attempt
    pub fn attempt_cursor(&self) -> AttemptCursor {
        self.session().cursor.clone()
    }

    /// Candidates found by the last discovery
    pub fn candidates(&self) -> Vec<CandidatePort> {
        self.session().candidates.clone().unwrap_or_default()
    }

    fn ready_transport(&self) -> Result<Arc<dyn Transport>> {
        let session = self.session();
        match session.state {
            ConnectionState::Ready => session.transport.clone().ok_or(Error::NotConnected),
            _ => Err(Error::NotConnected),
        }
    }

    /// Write raw bytes to the ready connection
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.ready_transport()?.write(data).await
    }

    /// Send a message to the ready connection
    pub async fn send(&self, op_code: UartTxType, payload: &[u8]) -> Result<()> {
        self.ready_transport()?.send(op_code, payload).await
    }

    async fn run(&self, generation: u64, port: Option<String>) {
        if let Some(port) = port {
            let known = self.session().candidates.is_some();
            if !known {
                self.discover(generation).await;
            }

            let found = {
                let mut session = self.session();
                let index = session
                    .candidates
                    .as_ref()
                    .and_then(|candidates| candidates.iter().position(|c| c.device == port));
                if let Some(index) = index {
                    session.cursor.index = index;
                }
                index.is_some()
            };

            match self.attempt(generation, &port, !found).await {
                Attempt::Ready | Attempt::Stale => return,
                Attempt::HandshakeFailed => {}
                Attempt::OpenFailed => self.backoff(generation).await,
            }
        }

        loop {
            if !self.is_current(generation) {
                return;
            }

            let (known, next) = {
                let session = self.session();
                let index = session.cursor.index;
                let next = session
                    .candidates
                    .as_ref()
                    .map(|candidates| candidates.get(index).map(|c| c.device.clone()));
                (next.is_some(), next.flatten())
            };

            match next {
                Some(port) => match self.attempt(generation, &port, true).await {
                    Attempt::Ready | Attempt::Stale => return,
                    Attempt::HandshakeFailed => {}
                    Attempt::OpenFailed => self.backoff(generation).await,
                },
                None if known => {
                    tracing::debug!("No Crownstone USB connected? Retrying...");
                    self.backoff(generation).await;
                }
                None => self.discover(generation).await,
            }
        }
    }

    async fn discover(&self, generation: u64) {
        {
            let mut session = self.session();
            if !self.is_current(generation) {
                return;
            }
            session.state = ConnectionState::Discovering;
        }

        let candidates = match self.shared.discovery.enumerate().await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!("Port discovery failed: {}", e);
                Vec::new()
            }
        };
        tracing::debug!("Found {} candidate ports", candidates.len());

        let mut session = self.session();
        if self.is_current(generation) {
            session.candidates = Some(candidates);
            session.cursor = AttemptCursor::default();
        }
    }

    async fn backoff(&self, generation: u64) {
        {
            let mut session = self.session();
            if !self.is_current(generation) {
                return;
            }
            session.close_transport();
            session.state = ConnectionState::Failed;
        }

        tokio::time::sleep(self.shared.retry_delay).await;

        {
            let mut session = self.session();
            if !self.is_current(generation) {
                return;
            }
            session.clear();
        }
        self.discover(generation).await;
    }

    async fn attempt(&self, generation: u64, port: &str, handshake: bool) -> Attempt {
        let baud_rate = {
            let mut session = self.session();
            if !self.is_current(generation) {
                return Attempt::Stale;
            }
            session.state = ConnectionState::Connecting;
            session.cursor.port = Some(port.to_string());
            session.baud_rate
        };

        tracing::debug!("Connecting to {} at {} baud", port, baud_rate);
        let transport = match self.shared.connector.open(port, baud_rate).await {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!("Failed to open {}: {}", port, e);
                return Attempt::OpenFailed;
            }
        };

        {
            let mut session = self.session();
            if !self.is_current(generation) {
                transport.close();
                return Attempt::Stale;
            }
            session.transport = Some(transport.clone());
        }

        if let Err(e) = transport.confirm_started().await {
            tracing::warn!("Transport for {} did not start: {}", port, e);
            return if self.is_current(generation) {
                Attempt::OpenFailed
            } else {
                Attempt::Stale
            };
        }

        {
            let mut session = self.session();
            if !self.is_current(generation) {
                return Attempt::Stale;
            }
            if handshake {
                session.state = ConnectionState::Handshaking;
            }
        }

        if handshake {
            let accepted = transport.handshake().await;

            let mut session = self.session();
            if !self.is_current(generation) {
                return Attempt::Stale;
            }
            if !accepted {
                tracing::debug!("Handshake with {} failed", port);
                session.close_transport();
                session.cursor.index += 1;
                return Attempt::HandshakeFailed;
            }
        }

        self.establish(generation, port, transport.link_lost())
    }

    fn establish(&self, generation: u64, port: &str, link_lost: BoxFuture<'static, ()>) -> Attempt {
        {
            let mut session = self.session();
            if !self.is_current(generation) {
                return Attempt::Stale;
            }
            session.active_port = Some(port.to_string());
            session.state = ConnectionState::Ready;

            match session.runtime.clone() {
                Some(runtime) => {
                    let watch = Self::watch(
                        Arc::downgrade(&self.shared),
                        generation,
                        port.to_string(),
                        link_lost,
                        &runtime,
                    );
                    // A previous watch is the task running this recovery
                    session.watch = Some(watch);
                }
                None => tracing::warn!("No runtime to watch the connection to {} on", port),
            }
        }

        tracing::info!("Connection established to {}", port);
        self.shared.bus.emit(Event::new(
            Topic::ConnectionEstablished,
            EventPayload::Port(port.to_string()),
        ));
        Attempt::Ready
    }

    /// Wait for the link to be lost, then reconnect
    ///
    /// The reconnect runs on the watch task itself, so `stop` can abort it.
    fn watch(
        shared: Weak<Shared>,
        generation: u64,
        port: String,
        link_lost: BoxFuture<'static, ()>,
        runtime: &Handle,
    ) -> JoinHandle<()> {
        runtime.spawn(async move {
            link_lost.await;

            let Some(shared) = shared.upgrade() else {
                return;
            };
            let supervisor = ConnectionSupervisor { shared };
            if !supervisor.is_current(generation) {
                return;
            }

            tracing::info!("Connection to {} lost", port);
            supervisor.shared.bus.emit(Event::new(
                Topic::ConnectionLost,
                EventPayload::Port(port),
            ));
            supervisor.recover(generation).await;
        })
    }

    async fn recover(&self, generation: u64) {
        {
            let mut session = self.session();
            if !self.is_current(generation) {
                return;
            }
            session.clear();
            session.state = ConnectionState::Discovering;
        }

        self.run(generation, None).await
    }
}
