//! Event bus for Crownstone UART communication
//!
//! Components publish typed events on a topic; every handler registered for
//! that topic is invoked synchronously, in registration order, on the
//! caller's context. Nothing is retained: an event emitted while no one is
//! subscribed is gone.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::decoders::{Decoded, MeshState};
use crate::error::Error;
use crate::packets::{UartMessage, WrapperFrame};
use crate::Result;

/// Topics published on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    // Transport and framing
    NewRawFrame,
    NewMessage,

    // Connection lifecycle
    ConnectionEstablished,
    ConnectionLost,

    // Replies and results
    Hello,
    Result,
    MeshResult,
    MeshResultFinal,
    StateUpdate,

    // Logging
    Log,
    LogArray,
    RawUartText,

    // Asset filters
    AssetMacReport,
    AssetIdReport,

    // Developer telemetry
    OwnId,
    OwnMac,
    AdcConfig,
    AdcRestarted,
    CurrentData,
    VoltageData,
    FilteredCurrent,
    FilteredVoltage,
    CalculatedPower,
    NewServiceData,
}

impl Topic {
    /// Stable topic name
    pub fn name(&self) -> &'static str {
        match self {
            Topic::NewRawFrame => "new-raw-frame",
            Topic::NewMessage => "new-message",
            Topic::ConnectionEstablished => "connection-established",
            Topic::ConnectionLost => "connection-lost",
            Topic::Hello => "hello",
            Topic::Result => "result",
            Topic::MeshResult => "mesh-result",
            Topic::MeshResultFinal => "mesh-result-final",
            Topic::StateUpdate => "state-update",
            Topic::Log => "log",
            Topic::LogArray => "log-array",
            Topic::RawUartText => "raw-uart-text",
            Topic::AssetMacReport => "asset-mac-report",
            Topic::AssetIdReport => "asset-id-report",
            Topic::OwnId => "own-id",
            Topic::OwnMac => "own-mac",
            Topic::AdcConfig => "adc-config",
            Topic::AdcRestarted => "adc-restarted",
            Topic::CurrentData => "current-data",
            Topic::VoltageData => "voltage-data",
            Topic::FilteredCurrent => "filtered-current",
            Topic::FilteredVoltage => "filtered-voltage",
            Topic::CalculatedPower => "calculated-power",
            Topic::NewServiceData => "new-service-data",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Payload data for events
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// No payload
    None,
    /// Undecoded frame from the transport
    Frame(WrapperFrame),
    /// Validated protocol message
    Message(UartMessage),
    /// Port identifier of a connection
    Port(String),
    /// Hello reply
    Hello(HelloPacket),
    /// Result of a command
    Result(ResultPacket),
    /// Result of a command relayed by another Crownstone
    MeshResult { source_id: u8, result: ResultPacket },
    /// State of a Crownstone in the mesh
    StateUpdate(MeshState),
    /// Binary log record
    Log(LogRecord),
    /// Binary log array
    LogArray(LogArrayRecord),
    /// Text sent over the UART
    UartText(UartText),
    /// Asset MAC report
    AssetMacReport(AssetMacReport),
    /// Asset id report
    AssetIdReport(AssetIdReport),
    /// Own Crownstone id
    CrownstoneId(u8),
    /// Own MAC address
    MacAddress(String),
    /// Collaborator decoded value
    Decoded(Decoded),
}

/// Hello reply sent by the Crownstone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloPacket {
    /// Short id of the sphere the Crownstone belongs to
    pub sphere_uid: u8,
    /// Whether UART encryption is required
    pub encryption_required: bool,
    /// Whether the Crownstone has been set up
    pub has_been_set_up: bool,
    /// Whether the Crownstone runs in hub mode
    pub hub_mode: bool,
    /// Whether the Crownstone reports an error
    pub has_error: bool,
}

/// Result of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultPacket {
    /// Command the result belongs to
    pub command_type: u16,
    /// Result code
    pub result_code: u16,
    /// Command specific result data
    pub payload: Vec<u8>,
}

/// Header shared by binary log records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogHeader {
    /// Hash of the source file name
    pub file_name_hash: u32,
    /// Line number in the source file
    pub line_number: u16,
    /// Log level
    pub level: u8,
    /// Whether the log ends a line
    pub new_line: bool,
}

/// Binary log record with its format arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub header: LogHeader,
    pub args: Vec<Vec<u8>>,
}

/// Binary log array
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogArrayRecord {
    pub header: LogHeader,
    pub element_type: u8,
    pub element_size: u8,
    pub elements: Vec<Vec<u8>>,
}

/// Text sent over the UART, along with its raw bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UartText {
    pub text: String,
    pub raw: Vec<u8>,
}

/// Asset seen by a Crownstone, identified by MAC address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetMacReport {
    /// MAC address as `AA:BB:CC:DD:EE:FF`
    pub mac_address: String,
    /// RSSI in dBm
    pub rssi: i8,
    /// Advertising channel
    pub channel: u8,
}

/// Asset seen by a Crownstone, identified by a short asset id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetIdReport {
    pub asset_id: [u8; 3],
    /// Bitmask of the filters the asset passed
    pub filter_bitmask: u8,
    pub rssi: i8,
    pub channel: u8,
}

/// An event published on the bus
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Topic
    pub topic: Topic,
    /// Event payload
    pub payload: EventPayload,
}

impl Event {
    /// Create a new event
    pub fn new(topic: Topic, payload: EventPayload) -> Self {
        Self { topic, payload }
    }
}

/// Handle of a registered handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    id: u64,
    topic: Topic,
}

impl Subscription {
    /// Topic the handler is registered for
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

/// Callback type for event subscriptions
pub type EventHandler = Arc<dyn Fn(Event) -> Result<()> + Send + Sync>;

struct SubscriptionEntry {
    id: u64,
    topic: Topic,
    handler: EventHandler,
}

struct Registry {
    entries: Mutex<Vec<SubscriptionEntry>>,
    next_id: AtomicU64,
}

/// Topic keyed publish/subscribe registry
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Registry>,
}

impl EventBus {
    /// Create a new, empty bus
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Registry {
                entries: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a handler for a topic
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(Event) -> Result<()> + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);

        self.inner.entries.lock().push(SubscriptionEntry {
            id,
            topic,
            handler: Arc::new(handler),
        });

        Subscription { id, topic }
    }

    /// Remove a registration. Removing twice is a no-op.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.inner
            .entries
            .lock()
            .retain(|entry| entry.id != subscription.id);
    }

    /// Remove every registration
    pub fn clear(&self) {
        self.inner.entries.lock().clear();
    }

    /// Number of handlers registered for a topic
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.inner
            .entries
            .lock()
            .iter()
            .filter(|entry| entry.topic == topic)
            .count()
    }

    /// Deliver an event to every handler of its topic
    ///
    /// Handlers run before this returns. A failing handler is logged and
    /// does not keep the others from running.
    pub fn emit(&self, event: Event) {
        // Handlers may subscribe or emit themselves, so never call them with
        // the registry locked.
        let handlers: Vec<(u64, EventHandler)> = self
            .inner
            .entries
            .lock()
            .iter()
            .filter(|entry| entry.topic == event.topic)
            .map(|entry| (entry.id, entry.handler.clone()))
            .collect();

        for (id, handler) in handlers {
            if let Err(e) = handler(event.clone()) {
                tracing::error!(topic = %event.topic, subscription = id, "Event handler failed: {}", e);
            }
        }
    }

    /// Register a one-shot style waiter for the next event on a topic
    ///
    /// The waiter is registered immediately, so events emitted between this
    /// call and [`EventWaiter::wait`] are not missed.
    pub fn waiter(&self, topic: Topic) -> EventWaiter {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(topic, move |event| {
            tx.send(event).map_err(|e| Error::Channel(e.to_string()))
        });

        EventWaiter {
            bus: self.clone(),
            subscription,
            rx,
        }
    }

    /// Wait for the next event on a topic
    pub async fn wait_for_event(&self, topic: Topic, timeout: Duration) -> Option<Event> {
        self.waiter(topic).wait(timeout).await
    }

    /// Stream of all future events on a topic
    pub fn stream(&self, topic: Topic) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(topic, move |event| {
            tx.send(event).map_err(|e| Error::Channel(e.to_string()))
        });

        EventStream {
            bus: self.clone(),
            subscription,
            inner: UnboundedReceiverStream::new(rx),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.inner.entries.lock().len())
            .finish()
    }
}

/// Pending wait for an event; unregisters itself when dropped
pub struct EventWaiter {
    bus: EventBus,
    subscription: Subscription,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventWaiter {
    /// Wait for the next event, `None` on timeout
    pub async fn wait(&mut self, timeout: Duration) -> Option<Event> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .ok()
            .flatten()
    }
}

impl Drop for EventWaiter {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.subscription);
    }
}

/// Stream of events on one topic; unregisters itself when dropped
pub struct EventStream {
    bus: EventBus,
    subscription: Subscription,
    inner: UnboundedReceiverStream<Event>,
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.subscription);
    }
}
