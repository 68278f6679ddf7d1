//! Frame reader: validates incoming frames and turns messages into events
//!
//! Two levels of fan-out. [`FrameDispatcher::parse`] consumes frames from
//! [`Topic::NewRawFrame`], checks the protocol version and message type and
//! republishes the inner message on [`Topic::NewMessage`].
//! [`FrameDispatcher::handle`] consumes those messages and emits at most one
//! typed event per message, chosen by opcode.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::decoders::{DefaultDecoder, PayloadDecoder};
use crate::error::Error;
use crate::events::*;
use crate::packets::{MessageType, OpCode, UartMessage, WrapperFrame, PROTOCOL_MAJOR};
use crate::parsing::*;
use crate::Result;

/// Timestamp format of ASCII console log lines
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Sink for the firmware's ASCII console output
pub type ConsoleWriter = Arc<dyn Fn(&str) + Send + Sync>;

fn stdout_console() -> ConsoleWriter {
    Arc::new(|line| {
        let _ = writeln!(std::io::stdout().lock(), "{}", line);
    })
}

/// Validates frames and dispatches messages as typed events
pub struct FrameDispatcher {
    bus: EventBus,
    decoder: Arc<dyn PayloadDecoder>,
    console: ConsoleWriter,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl FrameDispatcher {
    /// Create a dispatcher using the [`DefaultDecoder`]
    pub fn new(bus: EventBus) -> Self {
        Self::with_decoder(bus, Arc::new(DefaultDecoder))
    }

    /// Create a dispatcher with custom telemetry decoders
    pub fn with_decoder(bus: EventBus, decoder: Arc<dyn PayloadDecoder>) -> Self {
        Self {
            bus,
            decoder,
            console: stdout_console(),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Replace the sink ASCII console logs are written to
    pub fn with_console(mut self, console: ConsoleWriter) -> Self {
        self.console = console;
        self
    }

    /// Subscribe to the raw frame and message topics
    ///
    /// Attaching an already attached dispatcher does nothing.
    pub fn attach(self: &Arc<Self>) {
        let mut subscriptions = self.subscriptions.lock();
        if !subscriptions.is_empty() {
            return;
        }

        let dispatcher = Arc::downgrade(self);
        subscriptions.push(self.bus.subscribe(Topic::NewRawFrame, move |event| {
            match dispatcher.upgrade() {
                Some(dispatcher) => dispatcher.on_raw_frame(event),
                None => Ok(()),
            }
        }));

        let dispatcher = Arc::downgrade(self);
        subscriptions.push(self.bus.subscribe(Topic::NewMessage, move |event| {
            match dispatcher.upgrade() {
                Some(dispatcher) => dispatcher.on_message(event),
                None => Ok(()),
            }
        }));
    }

    /// Drop the subscriptions made by [`attach`](Self::attach)
    pub fn detach(&self) {
        for subscription in self.subscriptions.lock().drain(..) {
            self.bus.unsubscribe(&subscription);
        }
    }

    fn on_raw_frame(&self, event: Event) -> Result<()> {
        match event.payload {
            EventPayload::Frame(frame) => {
                self.parse(frame);
                Ok(())
            }
            other => Err(Error::contract(format!(
                "{} carries {:?} instead of a wrapper frame",
                Topic::NewRawFrame,
                other
            ))),
        }
    }

    fn on_message(&self, event: Event) -> Result<()> {
        match event.payload {
            EventPayload::Message(message) => {
                self.handle(message);
                Ok(())
            }
            other => Err(Error::contract(format!(
                "{} carries {:?} instead of a message",
                Topic::NewMessage,
                other
            ))),
        }
    }

    /// Validate a frame and publish its message on [`Topic::NewMessage`]
    pub fn parse(&self, frame: WrapperFrame) {
        if frame.protocol_major != PROTOCOL_MAJOR {
            tracing::warn!(
                "Unknown protocol: {}.{}",
                frame.protocol_major,
                frame.protocol_minor
            );
            return;
        }

        match frame.message_type {
            MessageType::PlainMessage => match UartMessage::parse(&frame.payload) {
                Ok(message) => self.emit(Topic::NewMessage, EventPayload::Message(message)),
                Err(e) => tracing::warn!("Dropping frame: {}", e),
            },
            MessageType::EncryptedMessage => {
                tracing::info!("Received encrypted message: decryption is not implemented");
            }
            MessageType::Unknown(message_type) => {
                tracing::warn!("Unknown message type: {}", message_type);
            }
        }
    }

    /// Dispatch a message to the event for its opcode
    ///
    /// Decode failures are logged here and never escape, so one bad message
    /// does not stop the ones after it.
    pub fn handle(&self, message: UartMessage) {
        let op_code = message.op_code;
        if let Err(e) = self.dispatch(message) {
            tracing::warn!("Parse error for {:?}: {}", op_code, e);
        }
    }

    fn emit(&self, topic: Topic, payload: EventPayload) {
        self.bus.emit(Event::new(topic, payload));
    }

    fn dispatch(&self, message: UartMessage) -> Result<()> {
        let payload = message.payload.as_slice();

        match message.op_code {
            OpCode::Hello => {
                self.emit(Topic::Hello, EventPayload::Hello(parse_hello(payload)?));
            }

            OpCode::ResultPacket => {
                let result = parse_result_packet(payload)?;
                self.emit(Topic::Result, EventPayload::Result(result));
            }

            OpCode::SessionNonce
            | OpCode::Heartbeat
            | OpCode::Status
            | OpCode::SessionNonceMissing
            | OpCode::PresenceChange
            | OpCode::FactoryReset
            | OpCode::Booted
            | OpCode::HubData
            | OpCode::ExternalStatePart0
            | OpCode::ExternalStatePart1
            | OpCode::RssiPingMessage
            | OpCode::InternalEvent
            | OpCode::MeshCmdTime
            | OpCode::MeshProfileLocation
            | OpCode::MeshSetBehaviourSettings
            | OpCode::MeshTrackedDeviceRegister
            | OpCode::MeshTrackedDeviceToken
            | OpCode::MeshSyncRequest
            | OpCode::MeshTrackedDeviceHeartbeat
            | OpCode::AdvertisingEnabled
            | OpCode::MeshEnabled
            | OpCode::FirmwareState => {
                tracing::debug!("Received {:?}", message.op_code);
            }

            OpCode::ErrReplyParsingFailed
            | OpCode::ErrReplyStatus
            | OpCode::ErrReplySessionNonceMissing
            | OpCode::ErrReplyDecryptionFailed
            | OpCode::ErrorReply(_) => {
                tracing::debug!(
                    "Received error reply {:?} ({})",
                    message.op_code,
                    u16::from(message.op_code)
                );
            }

            OpCode::UartMessage => {
                let text = UartText {
                    text: bytes_to_latin1(payload),
                    raw: payload.to_vec(),
                };
                self.emit(Topic::RawUartText, EventPayload::UartText(text));
            }

            OpCode::OwnServiceData => {
                let decoded = self.decoder.service_data(payload)?;
                self.emit(Topic::NewServiceData, EventPayload::Decoded(decoded));
            }

            OpCode::MeshServiceData => match self.decoder.mesh_service_data(payload)? {
                Some(state) => {
                    tracing::debug!("Received service data of crownstone {}", state.crownstone_id);
                    self.emit(Topic::StateUpdate, EventPayload::StateUpdate(state));
                }
                None => tracing::debug!("Received service data without crownstone id"),
            },

            OpCode::MeshResult => {
                if payload.len() > 1 {
                    let result = parse_result_packet(&payload[1..])?;
                    self.emit(
                        Topic::MeshResult,
                        EventPayload::MeshResult {
                            source_id: payload[0],
                            result,
                        },
                    );
                }
            }

            OpCode::MeshAckAllResult => {
                let result = parse_result_packet(payload)?;
                self.emit(Topic::MeshResultFinal, EventPayload::Result(result));
            }

            OpCode::Log => {
                tracing::debug!("Received binary log: {:?}", payload);
                self.emit(Topic::Log, EventPayload::Log(parse_log(payload)?));
            }

            OpCode::LogArray => {
                tracing::debug!("Received binary log array: {:?}", payload);
                let log = parse_log_array(payload)?;
                self.emit(Topic::LogArray, EventPayload::LogArray(log));
            }

            OpCode::AssetMacRssiReport => {
                tracing::debug!("Received asset MAC report: {:?}", payload);
                let report = parse_asset_mac_report(payload)?;
                self.emit(Topic::AssetMacReport, EventPayload::AssetMacReport(report));
            }

            OpCode::AssetIdRssiReport => {
                tracing::debug!("Received asset id report: {:?}", payload);
                let report = parse_asset_id_report(payload)?;
                self.emit(Topic::AssetIdReport, EventPayload::AssetIdReport(report));
            }

            OpCode::CrownstoneId => {
                let id = self.decoder.crownstone_id(payload)?;
                self.emit(Topic::OwnId, EventPayload::CrownstoneId(id));
            }

            OpCode::MacAddress => match self.decoder.mac_address(payload)? {
                Some(address) => self.emit(Topic::OwnMac, EventPayload::MacAddress(address)),
                None => tracing::warn!("Invalid MAC address: {:?}", payload),
            },

            OpCode::AdcConfig => {
                let config = self.decoder.adc_config(payload)?;
                self.emit(Topic::AdcConfig, EventPayload::Decoded(config));
            }

            OpCode::AdcRestart => {
                self.emit(Topic::AdcRestarted, EventPayload::None);
            }

            OpCode::PowerLogCurrent => {
                let samples = self.decoder.current_samples(payload)?;
                self.emit(Topic::CurrentData, EventPayload::Decoded(samples));
            }

            OpCode::PowerLogVoltage => {
                let samples = self.decoder.voltage_samples(payload)?;
                self.emit(Topic::VoltageData, EventPayload::Decoded(samples));
            }

            OpCode::PowerLogFilteredCurrent => {
                let samples = self.decoder.current_samples(payload)?;
                self.emit(Topic::FilteredCurrent, EventPayload::Decoded(samples));
            }

            OpCode::PowerLogFilteredVoltage => {
                let samples = self.decoder.voltage_samples(payload)?;
                self.emit(Topic::FilteredVoltage, EventPayload::Decoded(samples));
            }

            OpCode::PowerLogPower => {
                let power = self.decoder.power_calculation(payload)?;
                self.emit(Topic::CalculatedPower, EventPayload::Decoded(power));
            }

            OpCode::AsciiLog => {
                let timestamp = chrono::Local::now().format(TIMESTAMP_FORMAT);
                let line = format!("ASCII LOG: [{}] {}", timestamp, ascii_only(payload));
                (self.console)(line.trim_end());
            }

            OpCode::Unknown(code) => {
                tracing::debug!("Unknown opcode: {}", code);
            }
        }

        Ok(())
    }
}

impl Drop for FrameDispatcher {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoders::{Decoded, MeshState};
    use crate::packets::UartTxType;
    use std::collections::BTreeMap;

    const ALL_TOPICS: [Topic; 24] = [
        Topic::NewRawFrame,
        Topic::NewMessage,
        Topic::ConnectionEstablished,
        Topic::ConnectionLost,
        Topic::Hello,
        Topic::Result,
        Topic::MeshResult,
        Topic::MeshResultFinal,
        Topic::StateUpdate,
        Topic::Log,
        Topic::LogArray,
        Topic::RawUartText,
        Topic::AssetMacReport,
        Topic::AssetIdReport,
        Topic::OwnId,
        Topic::OwnMac,
        Topic::AdcConfig,
        Topic::AdcRestarted,
        Topic::CurrentData,
        Topic::VoltageData,
        Topic::FilteredCurrent,
        Topic::FilteredVoltage,
        Topic::CalculatedPower,
        Topic::NewServiceData,
    ];

    struct Harness {
        bus: EventBus,
        dispatcher: Arc<FrameDispatcher>,
        events: Arc<Mutex<Vec<Event>>>,
        console: Arc<Mutex<Vec<String>>>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_decoder(Arc::new(DefaultDecoder))
        }

        fn with_decoder(decoder: Arc<dyn PayloadDecoder>) -> Self {
            let bus = EventBus::new();
            let console = Arc::new(Mutex::new(Vec::new()));
            let sink = console.clone();
            let dispatcher = Arc::new(
                FrameDispatcher::with_decoder(bus.clone(), decoder)
                    .with_console(Arc::new(move |line| sink.lock().push(line.to_string()))),
            );

            let events = Arc::new(Mutex::new(Vec::new()));
            for topic in ALL_TOPICS {
                let events = events.clone();
                bus.subscribe(topic, move |event| {
                    events.lock().push(event);
                    Ok(())
                });
            }
            dispatcher.attach();

            Self {
                bus,
                dispatcher,
                events,
                console,
            }
        }

        fn send_frame(&self, frame: WrapperFrame) {
            self.bus
                .emit(Event::new(Topic::NewRawFrame, EventPayload::Frame(frame)));
        }

        fn send(&self, op_code: u16, payload: &[u8]) {
            let message = UartMessage::new(0, op_code, payload.to_vec());
            self.send_frame(WrapperFrame::plain(message.to_bytes()));
        }

        fn topics(&self) -> Vec<Topic> {
            self.events.lock().iter().map(|e| e.topic).collect()
        }

        /// Events emitted past the message level
        fn downstream(&self) -> Vec<Event> {
            self.events
                .lock()
                .iter()
                .filter(|e| !matches!(e.topic, Topic::NewRawFrame | Topic::NewMessage))
                .cloned()
                .collect()
        }
    }

    struct RecordDecoder;

    impl PayloadDecoder for RecordDecoder {
        fn current_samples(&self, payload: &[u8]) -> Result<Decoded> {
            let samples = payload
                .chunks_exact(2)
                .map(|c| Decoded::Int(i16::from_le_bytes([c[0], c[1]]) as i64))
                .collect();
            let mut fields = BTreeMap::new();
            fields.insert("samples".to_string(), Decoded::List(samples));
            Ok(Decoded::Record(fields))
        }

        fn power_calculation(&self, payload: &[u8]) -> Result<Decoded> {
            if payload.len() < 4 {
                return Err(Error::decode("power calculation too short"));
            }
            Ok(Decoded::Float(
                i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as f64
                    / 1000.0,
            ))
        }
    }

    #[test]
    fn test_valid_frame_emits_new_message() {
        let h = Harness::new();
        h.send(50002, &[0x07]);

        let events = h.events.lock();
        assert_eq!(events[0].topic, Topic::NewRawFrame);
        assert_eq!(events[1].topic, Topic::NewMessage);
        match &events[1].payload {
            EventPayload::Message(msg) => {
                assert_eq!(msg.op_code, OpCode::CrownstoneId);
                assert_eq!(msg.payload, vec![0x07]);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_crownstone_id_emits_own_id() {
        let h = Harness::new();
        h.send(50002, &[0x07]);

        let downstream = h.downstream();
        assert_eq!(downstream.len(), 1);
        assert_eq!(downstream[0].topic, Topic::OwnId);
        assert_eq!(downstream[0].payload, EventPayload::CrownstoneId(7));
    }

    #[test]
    fn test_invalid_mac_address_emits_nothing() {
        let h = Harness::new();
        h.send(50003, &[0, 0, 0, 0, 0, 0]);
        h.send(50003, &[0x01, 0x02]);
        assert!(h.downstream().is_empty());
    }

    #[test]
    fn test_mac_address_emits_own_mac() {
        let h = Harness::new();
        h.send(50003, &[0xAB, 0x89, 0x67, 0x45, 0x23, 0x01]);

        let downstream = h.downstream();
        assert_eq!(downstream.len(), 1);
        assert_eq!(downstream[0].topic, Topic::OwnMac);
        assert_eq!(
            downstream[0].payload,
            EventPayload::MacAddress("01:23:45:67:89:AB".to_string())
        );
    }

    #[test]
    fn test_unsupported_protocol_major_is_dropped() {
        let h = Harness::new();
        for major in [0u8, 2, 255] {
            let mut frame = WrapperFrame::plain(UartMessage::new(0, 50002u16, vec![7]).to_bytes());
            frame.protocol_major = major;
            h.send_frame(frame);
        }
        assert_eq!(h.topics(), vec![Topic::NewRawFrame; 3]);
    }

    #[test]
    fn test_encrypted_message_is_dropped() {
        let h = Harness::new();
        let payloads: [&[u8]; 3] = [&[], &[0x00, 0x52, 0xC3, 0x07], &[0xFF; 32]];
        for payload in payloads {
            let mut frame = WrapperFrame::plain(payload.to_vec());
            frame.message_type = MessageType::EncryptedMessage;
            h.send_frame(frame);
        }
        assert_eq!(h.topics(), vec![Topic::NewRawFrame; 3]);
    }

    #[test]
    fn test_unknown_message_type_is_dropped() {
        let h = Harness::new();
        let mut frame = WrapperFrame::plain(UartMessage::new(0, 0u16, vec![1, 0]).to_bytes());
        frame.message_type = MessageType::Unknown(3);
        h.send_frame(frame);
        assert_eq!(h.topics(), vec![Topic::NewRawFrame]);
    }

    #[test]
    fn test_malformed_message_is_dropped() {
        let h = Harness::new();
        h.send_frame(WrapperFrame::plain(vec![0x00, 0x01]));
        assert_eq!(h.topics(), vec![Topic::NewRawFrame]);
    }

    #[test]
    fn test_non_frame_payload_is_contract_violation() {
        let bus = EventBus::new();
        let dispatcher = FrameDispatcher::new(bus);

        let result = dispatcher.on_raw_frame(Event::new(Topic::NewRawFrame, EventPayload::None));
        assert!(matches!(result, Err(Error::Contract(_))));

        let result = dispatcher.on_message(Event::new(
            Topic::NewMessage,
            EventPayload::Frame(WrapperFrame::plain(vec![])),
        ));
        assert!(matches!(result, Err(Error::Contract(_))));
    }

    #[test]
    fn test_unknown_and_error_reply_opcodes_are_silent() {
        let h = Harness::new();
        for code in 0..=u16::MAX {
            if matches!(OpCode::from(code), OpCode::Unknown(_) | OpCode::ErrorReply(_)) {
                h.dispatcher.handle(UartMessage::new(0, code, vec![1, 2, 3]));
            }
        }
        assert!(h.events.lock().is_empty());
    }

    #[test]
    fn test_error_reply_9950_is_silent() {
        let h = Harness::new();
        h.send(9950, &[]);
        h.send(9900, &[]);
        h.send(12345, &[]);
        assert!(h.downstream().is_empty());
    }

    #[test]
    fn test_ignored_opcodes_are_silent() {
        let h = Harness::new();
        for code in [1u16, 2, 3, 10001, 10004, 10005, 10006, 10007, 10103, 10107, 40000, 40120, 50000, 50001, 60000] {
            h.send(code, &[0x01, 0x02]);
        }
        assert!(h.downstream().is_empty());
    }

    #[test]
    fn test_hello() {
        let h = Harness::new();
        h.send(UartTxType::Hello as u16, &[0x05, 0x02]);

        let downstream = h.downstream();
        assert_eq!(downstream.len(), 1);
        match &downstream[0].payload {
            EventPayload::Hello(hello) => {
                assert_eq!(hello.sphere_uid, 5);
                assert!(hello.has_been_set_up);
                assert!(!hello.encryption_required);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_result_packets() {
        let h = Harness::new();
        let result = [0x14, 0x00, 0x00, 0x00, 0x01, 0x00, 0x09];
        h.send(10, &result);
        h.send(10106, &result);

        let mut mesh = vec![0x0C];
        mesh.extend_from_slice(&result);
        h.send(10105, &mesh);

        let expected = ResultPacket {
            command_type: 20,
            result_code: 0,
            payload: vec![0x09],
        };
        let downstream = h.downstream();
        assert_eq!(downstream.len(), 3);
        assert_eq!(downstream[0].topic, Topic::Result);
        assert_eq!(downstream[0].payload, EventPayload::Result(expected.clone()));
        assert_eq!(downstream[1].topic, Topic::MeshResultFinal);
        assert_eq!(downstream[2].topic, Topic::MeshResult);
        assert_eq!(
            downstream[2].payload,
            EventPayload::MeshResult {
                source_id: 12,
                result: expected
            }
        );
    }

    #[test]
    fn test_mesh_result_needs_more_than_one_byte() {
        let h = Harness::new();
        h.send(10105, &[0x0C]);
        assert!(h.downstream().is_empty());
    }

    #[test]
    fn test_decode_failure_does_not_stop_stream() {
        let h = Harness::new();
        h.send(10, &[0x14]); // truncated result packet
        h.send(50002, &[0x03]);

        let downstream = h.downstream();
        assert_eq!(downstream.len(), 1);
        assert_eq!(downstream[0].payload, EventPayload::CrownstoneId(3));
    }

    #[test]
    fn test_uart_text_keeps_all_bytes() {
        let h = Harness::new();
        h.send(10000, &[b'h', b'i', 0xE9]);

        let downstream = h.downstream();
        assert_eq!(downstream[0].topic, Topic::RawUartText);
        assert_eq!(
            downstream[0].payload,
            EventPayload::UartText(UartText {
                text: "hi\u{e9}".to_string(),
                raw: vec![b'h', b'i', 0xE9],
            })
        );
    }

    #[test]
    fn test_logs() {
        let h = Harness::new();
        h.send(10200, &[1, 0, 0, 0, 7, 0, 2, 1, 1, 1, 0x2A]);
        h.send(10201, &[1, 0, 0, 0, 7, 0, 2, 0, 1, 1, 0x01, 0x02]);

        let topics: Vec<Topic> = h.downstream().iter().map(|e| e.topic).collect();
        assert_eq!(topics, vec![Topic::Log, Topic::LogArray]);
    }

    #[test]
    fn test_asset_reports() {
        let h = Harness::new();
        h.send(10300, &[0xAB, 0x89, 0x67, 0x45, 0x23, 0x01, 0xC4, 37]);
        h.send(10301, &[0x01, 0x02, 0x03, 0x01, 0xC4, 38]);

        let downstream = h.downstream();
        assert_eq!(downstream.len(), 2);
        match &downstream[0].payload {
            EventPayload::AssetMacReport(report) => {
                assert_eq!(report.mac_address, "01:23:45:67:89:AB");
                assert_eq!(report.rssi, -60);
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert_eq!(downstream[1].topic, Topic::AssetIdReport);
    }

    #[test]
    fn test_adc_restart() {
        let h = Harness::new();
        h.send(50101, &[]);

        let downstream = h.downstream();
        assert_eq!(downstream.len(), 1);
        assert_eq!(downstream[0].topic, Topic::AdcRestarted);
        assert_eq!(downstream[0].payload, EventPayload::None);
    }

    #[test]
    fn test_power_log_topics() {
        let h = Harness::new();
        for code in [50100u16, 50200, 50201, 50202, 50203, 50204, 10002] {
            h.send(code, &[0x01, 0x00]);
        }

        let topics: Vec<Topic> = h.downstream().iter().map(|e| e.topic).collect();
        assert_eq!(
            topics,
            vec![
                Topic::AdcConfig,
                Topic::CurrentData,
                Topic::VoltageData,
                Topic::FilteredCurrent,
                Topic::FilteredVoltage,
                Topic::CalculatedPower,
                Topic::NewServiceData,
            ]
        );
    }

    #[test]
    fn test_custom_decoder_values_are_emitted() {
        let h = Harness::with_decoder(Arc::new(RecordDecoder));
        h.send(50202, &[0x01, 0x00, 0xFF, 0xFF]);
        h.send(50204, &[0xE8, 0x03, 0x00, 0x00]);

        let downstream = h.downstream();
        assert_eq!(downstream[0].topic, Topic::FilteredCurrent);
        let EventPayload::Decoded(samples) = &downstream[0].payload else {
            panic!("unexpected payload {:?}", downstream[0].payload);
        };
        assert_eq!(
            samples.field("samples"),
            Some(&Decoded::List(vec![Decoded::Int(1), Decoded::Int(-1)]))
        );
        assert_eq!(downstream[1].payload, EventPayload::Decoded(Decoded::Float(1.0)));
    }

    #[test]
    fn test_custom_decoder_failure_is_isolated() {
        let h = Harness::with_decoder(Arc::new(RecordDecoder));
        h.send(50204, &[0x01]);
        h.send(50101, &[]);

        let topics: Vec<Topic> = h.downstream().iter().map(|e| e.topic).collect();
        assert_eq!(topics, vec![Topic::AdcRestarted]);
    }

    #[test]
    fn test_mesh_service_data_emits_state_update() {
        let h = Harness::new();
        h.send(10102, &[0x01, 0x04, 0x64]);
        h.send(10102, &[0x01]);

        let downstream = h.downstream();
        assert_eq!(downstream.len(), 1);
        assert_eq!(
            downstream[0].payload,
            EventPayload::StateUpdate(MeshState {
                crownstone_id: 4,
                state: Decoded::Bytes(vec![0x01, 0x04, 0x64]),
            })
        );
    }

    #[test]
    fn test_ascii_log_goes_to_console() {
        let h = Harness::new();
        h.send(50300, &[b'b', b'o', 0xFF, b'o', b't', b'\n']);

        assert!(h.downstream().is_empty());
        let console = h.console.lock();
        assert_eq!(console.len(), 1);
        assert!(console[0].starts_with("ASCII LOG: ["));
        assert!(console[0].ends_with("] boot"));
    }

    #[test]
    fn test_detach_stops_processing() {
        let h = Harness::new();
        h.dispatcher.detach();
        h.send(50002, &[0x07]);
        assert_eq!(h.topics(), vec![Topic::NewRawFrame]);
    }

    #[test]
    fn test_attach_twice_dispatches_once() {
        let h = Harness::new();
        h.dispatcher.attach();
        h.send(50002, &[0x07]);
        assert_eq!(h.downstream().len(), 1);
    }

    #[test]
    fn test_dropping_dispatcher_unsubscribes() {
        let bus = EventBus::new();
        let dispatcher = Arc::new(FrameDispatcher::new(bus.clone()));
        dispatcher.attach();
        assert_eq!(bus.subscriber_count(Topic::NewRawFrame), 1);

        drop(dispatcher);
        assert_eq!(bus.subscriber_count(Topic::NewRawFrame), 0);
        assert_eq!(bus.subscriber_count(Topic::NewMessage), 0);
    }
}
