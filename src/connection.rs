//! Connection types for Crownstone UART communication
//!
//! The supervisor only talks to the link through the traits in this module:
//! [`PortDiscovery`] lists candidate ports, [`Connector`] opens one and
//! [`Transport`] is the open link. The byte level framing is supplied by the
//! application as a [`FrameCodec`].
//!
//! With the `serial` feature enabled this module also provides the
//! `tokio-serial` backed implementations.

use async_trait::async_trait;
use bytes::BytesMut;
use futures::future::BoxFuture;
use std::sync::Arc;

use crate::packets::{UartTxType, WrapperFrame};
use crate::Result;

#[cfg(feature = "serial")]
use {
    crate::error::Error,
    crate::events::{Event, EventBus, EventPayload, Topic},
    crate::packets::UartMessage,
    std::time::Duration,
    tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, WriteHalf},
    tokio::sync::watch,
    tokio_serial::SerialStream,
};

/// A port the device may be attached to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CandidatePort {
    /// Identifier used to open the port, e.g. `/dev/ttyACM0`
    pub device: String,
}

impl CandidatePort {
    /// Create a candidate for the given device identifier
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }
}

/// Lists the ports the device may be attached to
#[async_trait]
pub trait PortDiscovery: Send + Sync {
    /// Enumerate candidate ports, in the order they should be tried
    async fn enumerate(&self) -> Result<Vec<CandidatePort>>;
}

/// Opens transports
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a port, failing with a connection error if that is not possible
    async fn open(&self, port: &str, baud_rate: u32) -> Result<Arc<dyn Transport>>;
}

/// An open link to the device
#[async_trait]
pub trait Transport: Send + Sync {
    /// Wait until the transport can send and receive
    async fn confirm_started(&self) -> Result<()>;

    /// Check the device answers; failure is a `false`, never an error
    async fn handshake(&self) -> bool;

    /// Resolves once, when the link is determined lost
    fn link_lost(&self) -> BoxFuture<'static, ()>;

    /// Write raw bytes to the link
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Frame and write a message with the given opcode
    async fn send(&self, op_code: UartTxType, payload: &[u8]) -> Result<()>;

    /// Tear the link down. Closing twice is a no-op.
    fn close(&self);
}

/// Byte level framing of the link
pub trait FrameCodec: Send + Sync {
    /// Take the next complete frame off the front of the buffer
    ///
    /// Returns `Ok(None)` when more bytes are needed. An implementation
    /// returning an error must have consumed the offending bytes.
    fn decode(&self, buffer: &mut BytesMut) -> Result<Option<WrapperFrame>>;

    /// Encode a frame for writing
    fn encode(&self, frame: &WrapperFrame) -> Vec<u8>;
}

/// Default time to wait for the hello reply
#[cfg(feature = "serial")]
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(500);

/// Discovers ports using the operating system's serial port list
#[cfg(feature = "serial")]
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialPortDiscovery;

#[cfg(feature = "serial")]
#[async_trait]
impl PortDiscovery for SerialPortDiscovery {
    async fn enumerate(&self) -> Result<Vec<CandidatePort>> {
        let ports = tokio_serial::available_ports()?;
        Ok(ports
            .into_iter()
            .map(|info| CandidatePort::new(info.port_name))
            .collect())
    }
}

/// Settings of serial transports
#[cfg(feature = "serial")]
#[derive(Debug, Clone)]
pub struct SerialSettings {
    /// How long to wait for the hello reply
    pub handshake_timeout: Duration,
    /// Device id put in outgoing messages
    pub device_id: u8,
}

#[cfg(feature = "serial")]
impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            device_id: 0,
        }
    }
}

/// Opens [`SerialTransport`]s publishing their frames on a bus
#[cfg(feature = "serial")]
pub struct SerialConnector {
    bus: EventBus,
    codec: Arc<dyn FrameCodec>,
    settings: SerialSettings,
}

#[cfg(feature = "serial")]
impl SerialConnector {
    /// Create a connector with the default [`SerialSettings`]
    pub fn new(bus: EventBus, codec: Arc<dyn FrameCodec>) -> Self {
        Self::with_settings(bus, codec, SerialSettings::default())
    }

    /// Create a connector with custom settings
    pub fn with_settings(bus: EventBus, codec: Arc<dyn FrameCodec>, settings: SerialSettings) -> Self {
        Self {
            bus,
            codec,
            settings,
        }
    }
}

#[cfg(feature = "serial")]
#[async_trait]
impl Connector for SerialConnector {
    async fn open(&self, port: &str, baud_rate: u32) -> Result<Arc<dyn Transport>> {
        use tokio_serial::SerialPortBuilderExt;

        let stream = tokio_serial::new(port, baud_rate)
            .open_native_async()
            .map_err(|e| Error::connection(format!("Failed to open serial port {}: {}", port, e)))?;

        Ok(Arc::new(SerialTransport::start(
            stream,
            self.bus.clone(),
            self.codec.clone(),
            self.settings.clone(),
        )))
    }
}

/// Serial port transport
///
/// A background task reads the port, decodes frames with the codec and
/// publishes them on [`Topic::NewRawFrame`]. End of stream or a read error
/// marks the link lost.
#[cfg(feature = "serial")]
pub struct SerialTransport {
    bus: EventBus,
    codec: Arc<dyn FrameCodec>,
    settings: SerialSettings,
    writer: tokio::sync::Mutex<Option<WriteHalf<SerialStream>>>,
    alive: Arc<watch::Sender<bool>>,
    read_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[cfg(feature = "serial")]
impl SerialTransport {
    fn start(
        stream: SerialStream,
        bus: EventBus,
        codec: Arc<dyn FrameCodec>,
        settings: SerialSettings,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (alive, _) = watch::channel(true);
        let alive = Arc::new(alive);

        let read_task = tokio::spawn(read_frames(
            reader,
            bus.clone(),
            codec.clone(),
            alive.clone(),
        ));

        Self {
            bus,
            codec,
            settings,
            writer: tokio::sync::Mutex::new(Some(writer)),
            alive,
            read_task: parking_lot::Mutex::new(Some(read_task)),
        }
    }

    /// Send a hello and wait for the reply
    async fn hello(&self) -> Result<()> {
        // Register before writing so a fast reply is not missed
        let mut waiter = self.bus.waiter(Topic::Hello);
        self.send(UartTxType::Hello, &[]).await?;

        match waiter.wait(self.settings.handshake_timeout).await {
            Some(_) => Ok(()),
            None => Err(Error::timeout(format!(
                "hello reply after {:?}",
                self.settings.handshake_timeout
            ))),
        }
    }
}

#[cfg(feature = "serial")]
#[async_trait]
impl Transport for SerialTransport {
    async fn confirm_started(&self) -> Result<()> {
        if *self.alive.borrow() {
            Ok(())
        } else {
            Err(Error::connection("Serial transport stopped before it started"))
        }
    }

    async fn handshake(&self) -> bool {
        match self.hello().await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Handshake failed: {}", e);
                false
            }
        }
    }

    fn link_lost(&self) -> BoxFuture<'static, ()> {
        let mut alive = self.alive.subscribe();
        Box::pin(async move {
            let _ = alive.wait_for(|alive| !*alive).await;
        })
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(Error::NotConnected)?;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn send(&self, op_code: UartTxType, payload: &[u8]) -> Result<()> {
        let frame = encode_message(self.codec.as_ref(), self.settings.device_id, op_code, payload);
        self.write(&frame).await
    }

    fn close(&self) {
        if let Some(task) = self.read_task.lock().take() {
            task.abort();
        }
        self.alive.send_replace(false);
        // A write in flight keeps its half until the transport is dropped
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }
}

#[cfg(feature = "serial")]
impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Wrap a message in a plain frame and encode it for the wire
#[cfg(feature = "serial")]
fn encode_message(
    codec: &dyn FrameCodec,
    device_id: u8,
    op_code: UartTxType,
    payload: &[u8],
) -> Vec<u8> {
    let message = UartMessage::new(device_id, op_code, payload.to_vec());
    codec.encode(&WrapperFrame::plain(message.to_bytes()))
}

#[cfg(feature = "serial")]
async fn read_frames<R>(
    mut reader: R,
    bus: EventBus,
    codec: Arc<dyn FrameCodec>,
    alive: Arc<watch::Sender<bool>>,
) where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(4096);
    let mut read_buf = [0u8; 1024];

    loop {
        match reader.read(&mut read_buf).await {
            Ok(0) => {
                tracing::info!("Serial port closed");
                break;
            }
            Ok(n) => {
                buffer.extend_from_slice(&read_buf[..n]);

                loop {
                    match codec.decode(&mut buffer) {
                        Ok(Some(frame)) => {
                            bus.emit(Event::new(Topic::NewRawFrame, EventPayload::Frame(frame)))
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!("Dropping undecodable bytes: {}", e);
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Serial read failed: {}", e);
                break;
            }
        }
    }

    alive.send_replace(false);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_port() {
        let port = CandidatePort::new("/dev/ttyACM0");
        assert_eq!(port.device, "/dev/ttyACM0");
        assert_eq!(port, CandidatePort::new(String::from("/dev/ttyACM0")));
    }

    #[cfg(feature = "serial")]
    mod serial {
        use super::super::*;
        use bytes::Buf;
        use parking_lot::Mutex;
        use tokio::io::AsyncWriteExt;

        /// `[LEN][MAJOR][MINOR][TYPE][PAYLOAD...]`, LEN counting everything after it.
        /// A zero length byte is rejected.
        struct LengthCodec;

        impl FrameCodec for LengthCodec {
            fn decode(&self, buffer: &mut BytesMut) -> Result<Option<WrapperFrame>> {
                let Some(&len) = buffer.first() else {
                    return Ok(None);
                };
                if len == 0 {
                    buffer.advance(1);
                    return Err(Error::decode("zero length frame"));
                }
                if len < 3 {
                    buffer.advance(1 + len as usize);
                    return Err(Error::decode("frame shorter than its header"));
                }
                if buffer.len() < 1 + len as usize {
                    return Ok(None);
                }
                let frame = buffer.split_to(1 + len as usize);
                Ok(Some(WrapperFrame {
                    protocol_major: frame[1],
                    protocol_minor: frame[2],
                    message_type: frame[3].into(),
                    payload: frame[4..].to_vec(),
                }))
            }

            fn encode(&self, frame: &WrapperFrame) -> Vec<u8> {
                let mut bytes = vec![
                    (frame.payload.len() + 3) as u8,
                    frame.protocol_major,
                    frame.protocol_minor,
                    frame.message_type.into(),
                ];
                bytes.extend_from_slice(&frame.payload);
                bytes
            }
        }

        fn collect_frames(bus: &EventBus) -> Arc<Mutex<Vec<WrapperFrame>>> {
            let frames = Arc::new(Mutex::new(Vec::new()));
            let sink = frames.clone();
            bus.subscribe(Topic::NewRawFrame, move |event| {
                if let EventPayload::Frame(frame) = event.payload {
                    sink.lock().push(frame);
                }
                Ok(())
            });
            frames
        }

        #[test]
        fn test_serial_settings_default() {
            let settings = SerialSettings::default();
            assert_eq!(settings.handshake_timeout, Duration::from_millis(500));
            assert_eq!(settings.device_id, 0);
        }

        #[test]
        fn test_encode_message_frames_header_and_payload() {
            let bytes = encode_message(&LengthCodec, 3, UartTxType::Control, &[0xAA, 0xBB]);

            let mut buffer = BytesMut::from(&bytes[..]);
            let frame = LengthCodec.decode(&mut buffer).unwrap().unwrap();
            assert!(buffer.is_empty());

            let message = UartMessage::parse(&frame.payload).unwrap();
            assert_eq!(message.device_id, 3);
            assert_eq!(u16::from(message.op_code), 10);
            assert_eq!(message.payload, vec![0xAA, 0xBB]);
        }

        #[tokio::test]
        async fn test_read_frames_across_chunks() {
            let bus = EventBus::new();
            let frames = collect_frames(&bus);
            let (alive, _) = watch::channel(true);
            let alive = Arc::new(alive);

            let (mut device, host) = tokio::io::duplex(64);
            let task = tokio::spawn(read_frames(
                host,
                bus.clone(),
                Arc::new(LengthCodec),
                alive.clone(),
            ));

            let first = LengthCodec.encode(&WrapperFrame::plain(vec![0x00, 0x52, 0xC3, 0x07]));
            let second = LengthCodec.encode(&WrapperFrame::plain(vec![0x00, 0xB5, 0xC3]));
            device.write_all(&first[..3]).await.unwrap();
            device.flush().await.unwrap();
            tokio::task::yield_now().await;
            device.write_all(&first[3..]).await.unwrap();
            device.write_all(&second).await.unwrap();
            drop(device);

            task.await.unwrap();
            let frames = frames.lock();
            assert_eq!(frames.len(), 2);
            assert_eq!(frames[0].payload, vec![0x00, 0x52, 0xC3, 0x07]);
            assert_eq!(frames[1].payload, vec![0x00, 0xB5, 0xC3]);
            assert!(!*alive.borrow());
        }

        #[tokio::test]
        async fn test_read_frames_skips_undecodable_bytes() {
            let bus = EventBus::new();
            let frames = collect_frames(&bus);
            let (alive, _) = watch::channel(true);

            let (mut device, host) = tokio::io::duplex(64);
            let task = tokio::spawn(read_frames(
                host,
                bus.clone(),
                Arc::new(LengthCodec),
                Arc::new(alive),
            ));

            let mut bytes = vec![0x00, 0x00];
            bytes.extend(LengthCodec.encode(&WrapperFrame::plain(vec![1, 2, 3])));
            device.write_all(&bytes).await.unwrap();
            drop(device);

            task.await.unwrap();
            assert_eq!(frames.lock().len(), 1);
        }

        #[tokio::test]
        async fn test_end_of_stream_marks_link_lost() {
            let (alive, mut watcher) = watch::channel(true);
            let (device, host) = tokio::io::duplex(8);
            let task = tokio::spawn(read_frames(
                host,
                EventBus::new(),
                Arc::new(LengthCodec),
                Arc::new(alive),
            ));

            drop(device);
            task.await.unwrap();
            watcher.wait_for(|alive| !*alive).await.unwrap();
        }
    }
}
