//! Lists the serial ports a Crownstone USB dongle may be attached to, and
//! shows how a message from the dongle turns into an event

use crownstone_uart::connection::{PortDiscovery, SerialPortDiscovery};
use crownstone_uart::{EventBus, EventPayload, FrameDispatcher, Topic, UartMessage, WrapperFrame};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let ports = SerialPortDiscovery.enumerate().await?;
    println!("Found {} candidate ports:", ports.len());
    for port in &ports {
        println!("  - {}", port.device);
    }

    // Feed a CROWNSTONE_ID message through the dispatcher
    let bus = EventBus::new();
    let dispatcher = Arc::new(FrameDispatcher::new(bus.clone()));
    dispatcher.attach();

    let _sub = bus.subscribe(Topic::OwnId, |event| {
        if let EventPayload::CrownstoneId(id) = event.payload {
            println!("\nDongle reports Crownstone id {}", id);
        }
        Ok(())
    });

    let message = UartMessage::new(0, 50002u16, vec![7]);
    dispatcher.parse(WrapperFrame::plain(message.to_bytes()));

    Ok(())
}
