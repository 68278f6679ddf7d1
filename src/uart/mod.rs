//! Main Crownstone UART client implementation

use std::sync::Arc;

use crate::connection::{Connector, PortDiscovery};
use crate::decoders::PayloadDecoder;
use crate::events::*;
use crate::packets::UartTxType;
use crate::reader::FrameDispatcher;
use crate::supervisor::{ConnectionSupervisor, SupervisorConfig};
use crate::Result;

#[cfg(feature = "serial")]
pub mod serial;

/// Client for a Crownstone USB dongle
///
/// Wires the event bus, the frame dispatcher and the connection supervisor
/// together. Dropping the client stops the connection.
pub struct CrownstoneUart {
    /// Event bus shared by all components
    bus: EventBus,
    /// Turns frames into events
    dispatcher: Arc<FrameDispatcher>,
    /// Owns the connection
    supervisor: ConnectionSupervisor,
}

impl CrownstoneUart {
    /// Create a client from its collaborators
    pub fn new(
        bus: EventBus,
        config: SupervisorConfig,
        discovery: Arc<dyn PortDiscovery>,
        connector: Arc<dyn Connector>,
        decoder: Arc<dyn PayloadDecoder>,
    ) -> Self {
        let dispatcher = Arc::new(FrameDispatcher::with_decoder(bus.clone(), decoder));
        dispatcher.attach();

        let supervisor = ConnectionSupervisor::new(bus.clone(), config, discovery, connector);

        Self {
            bus,
            dispatcher,
            supervisor,
        }
    }

    /// Connect to the dongle, see [`ConnectionSupervisor::initialize`]
    ///
    /// Without a `port` the one in the [`SupervisorConfig`] is used, if any.
    /// Returns whether the connection is ready, which is `false` only when
    /// the client was stopped while connecting.
    pub async fn initialize_usb(&self, port: Option<&str>, baud_rate: u32) -> bool {
        let port = port.or(self.supervisor.configured_port());
        self.supervisor.initialize(port, baud_rate).await;
        self.supervisor.is_ready()
    }

    /// Stop the connection
    pub fn stop(&self) {
        self.supervisor.stop();
    }

    /// Check if the connection is ready
    pub fn is_ready(&self) -> bool {
        self.supervisor.is_ready()
    }

    /// Get the event bus
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Get the connection supervisor
    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    /// Subscribe to events on a topic
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(Event) -> Result<()> + Send + Sync + 'static,
    {
        self.bus.subscribe(topic, handler)
    }

    /// Unsubscribe a handler
    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.bus.unsubscribe(subscription)
    }

    /// Stream the events on a topic
    pub fn stream(&self, topic: Topic) -> EventStream {
        self.bus.stream(topic)
    }

    /// Write raw bytes to the dongle
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.supervisor.write(data).await
    }

    /// Send a message to the dongle, framed by the connection
    pub async fn send(&self, op_code: UartTxType, payload: &[u8]) -> Result<()> {
        self.supervisor.send(op_code, payload).await
    }
}

impl Drop for CrownstoneUart {
    fn drop(&mut self) {
        self.supervisor.stop();
        self.dispatcher.detach();
    }
}
