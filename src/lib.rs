//! crownstone-uart - Rust library for talking to the Crownstone USB dongle
//!
//! This library provides an async driver for the UART link to a Crownstone
//! USB dongle: it finds the port the dongle is attached to, keeps the
//! connection alive and publishes every message the dongle sends as a typed
//! event on an [`EventBus`].
//!
//! The byte level framing of the link is supplied by the application as a
//! [`FrameCodec`](connection::FrameCodec).
//!
//! # Serial Example
//!
//! ```no_run
//! use crownstone_uart::connection::FrameCodec;
//! use crownstone_uart::supervisor::SupervisorConfig;
//! use crownstone_uart::{CrownstoneUart, EventPayload, Topic, DEFAULT_BAUD_RATE};
//! use std::sync::Arc;
//!
//! async fn run(codec: Arc<dyn FrameCodec>) {
//!     let uart = CrownstoneUart::serial(codec, SupervisorConfig::default());
//!
//!     uart.subscribe(Topic::OwnId, |event| {
//!         if let EventPayload::CrownstoneId(id) = event.payload {
//!             println!("Connected to Crownstone {}", id);
//!         }
//!         Ok(())
//!     });
//!
//!     // Returns once a dongle answered
//!     uart.initialize_usb(None, DEFAULT_BAUD_RATE).await;
//!
//!     uart.stop();
//! }
//! ```

pub mod connection;
pub mod decoders;
pub mod error;
pub mod events;
pub mod packets;
pub mod parsing;
pub mod reader;
pub mod supervisor;

mod uart;

pub use error::Error;
pub use events::{Event, EventBus, EventPayload, Subscription, Topic};
pub use packets::{OpCode, UartMessage, UartTxType, WrapperFrame, DEFAULT_BAUD_RATE};
pub use reader::FrameDispatcher;
pub use supervisor::{ConnectionState, ConnectionSupervisor};
pub use uart::CrownstoneUart;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;
