//! Packet types and protocol constants for Crownstone UART communication

use crate::error::Error;
use crate::Result;

/// The only protocol major version this library understands
pub const PROTOCOL_MAJOR: u8 = 1;

/// Protocol minor version used for outgoing frames
pub const PROTOCOL_MINOR: u8 = 0;

/// Default baud rate of the Crownstone USB dongle
pub const DEFAULT_BAUD_RATE: u32 = 230_400;

/// Size of the message header: device id (1) + opcode (2)
pub const MESSAGE_HEADER_SIZE: usize = 3;

/// Type of the message carried by a wrapper frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Plain, unencrypted message
    PlainMessage,
    /// Encrypted message (decryption is not supported)
    EncryptedMessage,
    /// Any other type byte
    Unknown(u8),
}

impl From<u8> for MessageType {
    fn from(value: u8) -> Self {
        match value {
            0 => MessageType::PlainMessage,
            128 => MessageType::EncryptedMessage,
            other => MessageType::Unknown(other),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::PlainMessage => 0,
            MessageType::EncryptedMessage => 128,
            MessageType::Unknown(other) => other,
        }
    }
}

/// One frame as delivered by the transport, before version validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapperFrame {
    /// Protocol major version
    pub protocol_major: u8,
    /// Protocol minor version
    pub protocol_minor: u8,
    /// Message type
    pub message_type: MessageType,
    /// Inner message bytes
    pub payload: Vec<u8>,
}

impl WrapperFrame {
    /// Wrap a plain message using the supported protocol version
    pub fn plain(payload: Vec<u8>) -> Self {
        Self {
            protocol_major: PROTOCOL_MAJOR,
            protocol_minor: PROTOCOL_MINOR,
            message_type: MessageType::PlainMessage,
            payload,
        }
    }
}

/// A protocol message: opcode plus payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UartMessage {
    /// Id of the device the message belongs to
    pub device_id: u8,
    /// Message opcode
    pub op_code: OpCode,
    /// Opcode specific payload
    pub payload: Vec<u8>,
}

impl UartMessage {
    /// Create a new message
    pub fn new(device_id: u8, op_code: impl Into<u16>, payload: Vec<u8>) -> Self {
        Self {
            device_id,
            op_code: OpCode::from(op_code.into()),
            payload,
        }
    }

    /// Parse a message from the payload of a wrapper frame
    ///
    /// Format: `[DEVICE_ID][OPCODE_L][OPCODE_H][PAYLOAD...]`
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < MESSAGE_HEADER_SIZE {
            return Err(Error::protocol(format!(
                "Message too short: {} bytes",
                data.len()
            )));
        }

        Ok(Self {
            device_id: data[0],
            op_code: OpCode::from(u16::from_le_bytes([data[1], data[2]])),
            payload: data[MESSAGE_HEADER_SIZE..].to_vec(),
        })
    }

    /// Serialize the message into its wire layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(MESSAGE_HEADER_SIZE + self.payload.len());
        bytes.push(self.device_id);
        bytes.extend_from_slice(&u16::from(self.op_code).to_le_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// Opcodes sent by the host to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum UartTxType {
    Hello = 0,
    SessionNonce = 1,
    Heartbeat = 2,
    Status = 3,
    GetMacAddress = 4,
    Control = 10,
    HubDataReply = 11,
}

impl From<UartTxType> for u16 {
    fn from(value: UartTxType) -> Self {
        value as u16
    }
}

/// Opcodes received from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    // Replies
    Hello,
    SessionNonce,
    Heartbeat,
    Status,
    ResultPacket,

    // Error replies
    ErrReplyParsingFailed,
    ErrReplyStatus,
    ErrReplySessionNonceMissing,
    ErrReplyDecryptionFailed,
    /// Any other code in the reserved error reply range
    ErrorReply(u16),

    // Events
    UartMessage,
    SessionNonceMissing,
    OwnServiceData,
    PresenceChange,
    FactoryReset,
    Booted,
    HubData,
    MeshServiceData,
    ExternalStatePart0,
    ExternalStatePart1,
    MeshResult,
    MeshAckAllResult,
    RssiPingMessage,
    Log,
    LogArray,

    // Asset filter events
    AssetMacRssiReport,
    AssetIdRssiReport,

    // Developer events
    InternalEvent,
    MeshCmdTime,
    MeshProfileLocation,
    MeshSetBehaviourSettings,
    MeshTrackedDeviceRegister,
    MeshTrackedDeviceToken,
    MeshSyncRequest,
    MeshTrackedDeviceHeartbeat,

    // Debug build events
    AdvertisingEnabled,
    MeshEnabled,
    CrownstoneId,
    MacAddress,
    AdcConfig,
    AdcRestart,
    PowerLogCurrent,
    PowerLogVoltage,
    PowerLogFilteredCurrent,
    PowerLogFilteredVoltage,
    PowerLogPower,
    AsciiLog,
    FirmwareState,

    /// Opcode not known to this library
    Unknown(u16),
}

impl From<u16> for OpCode {
    fn from(value: u16) -> Self {
        match value {
            0 => OpCode::Hello,
            1 => OpCode::SessionNonce,
            2 => OpCode::Heartbeat,
            3 => OpCode::Status,
            10 => OpCode::ResultPacket,
            9900 => OpCode::ErrReplyParsingFailed,
            9901 => OpCode::ErrReplyStatus,
            9902 => OpCode::ErrReplySessionNonceMissing,
            9903 => OpCode::ErrReplyDecryptionFailed,
            10000 => OpCode::UartMessage,
            10001 => OpCode::SessionNonceMissing,
            10002 => OpCode::OwnServiceData,
            10004 => OpCode::PresenceChange,
            10005 => OpCode::FactoryReset,
            10006 => OpCode::Booted,
            10007 => OpCode::HubData,
            10102 => OpCode::MeshServiceData,
            10103 => OpCode::ExternalStatePart0,
            10104 => OpCode::ExternalStatePart1,
            10105 => OpCode::MeshResult,
            10106 => OpCode::MeshAckAllResult,
            10107 => OpCode::RssiPingMessage,
            10200 => OpCode::Log,
            10201 => OpCode::LogArray,
            10300 => OpCode::AssetMacRssiReport,
            10301 => OpCode::AssetIdRssiReport,
            40000 => OpCode::InternalEvent,
            40103 => OpCode::MeshCmdTime,
            40110 => OpCode::MeshProfileLocation,
            40111 => OpCode::MeshSetBehaviourSettings,
            40112 => OpCode::MeshTrackedDeviceRegister,
            40113 => OpCode::MeshTrackedDeviceToken,
            40114 => OpCode::MeshSyncRequest,
            40120 => OpCode::MeshTrackedDeviceHeartbeat,
            50000 => OpCode::AdvertisingEnabled,
            50001 => OpCode::MeshEnabled,
            50002 => OpCode::CrownstoneId,
            50003 => OpCode::MacAddress,
            50100 => OpCode::AdcConfig,
            50101 => OpCode::AdcRestart,
            50200 => OpCode::PowerLogCurrent,
            50201 => OpCode::PowerLogVoltage,
            50202 => OpCode::PowerLogFilteredCurrent,
            50203 => OpCode::PowerLogFilteredVoltage,
            50204 => OpCode::PowerLogPower,
            50300 => OpCode::AsciiLog,
            60000 => OpCode::FirmwareState,
            code if code > 9900 && code < 10000 => OpCode::ErrorReply(code),
            code => OpCode::Unknown(code),
        }
    }
}

impl From<OpCode> for u16 {
    fn from(value: OpCode) -> Self {
        match value {
            OpCode::Hello => 0,
            OpCode::SessionNonce => 1,
            OpCode::Heartbeat => 2,
            OpCode::Status => 3,
            OpCode::ResultPacket => 10,
            OpCode::ErrReplyParsingFailed => 9900,
            OpCode::ErrReplyStatus => 9901,
            OpCode::ErrReplySessionNonceMissing => 9902,
            OpCode::ErrReplyDecryptionFailed => 9903,
            OpCode::ErrorReply(code) => code,
            OpCode::UartMessage => 10000,
            OpCode::SessionNonceMissing => 10001,
            OpCode::OwnServiceData => 10002,
            OpCode::PresenceChange => 10004,
            OpCode::FactoryReset => 10005,
            OpCode::Booted => 10006,
            OpCode::HubData => 10007,
            OpCode::MeshServiceData => 10102,
            OpCode::ExternalStatePart0 => 10103,
            OpCode::ExternalStatePart1 => 10104,
            OpCode::MeshResult => 10105,
            OpCode::MeshAckAllResult => 10106,
            OpCode::RssiPingMessage => 10107,
            OpCode::Log => 10200,
            OpCode::LogArray => 10201,
            OpCode::AssetMacRssiReport => 10300,
            OpCode::AssetIdRssiReport => 10301,
            OpCode::InternalEvent => 40000,
            OpCode::MeshCmdTime => 40103,
            OpCode::MeshProfileLocation => 40110,
            OpCode::MeshSetBehaviourSettings => 40111,
            OpCode::MeshTrackedDeviceRegister => 40112,
            OpCode::MeshTrackedDeviceToken => 40113,
            OpCode::MeshSyncRequest => 40114,
            OpCode::MeshTrackedDeviceHeartbeat => 40120,
            OpCode::AdvertisingEnabled => 50000,
            OpCode::MeshEnabled => 50001,
            OpCode::CrownstoneId => 50002,
            OpCode::MacAddress => 50003,
            OpCode::AdcConfig => 50100,
            OpCode::AdcRestart => 50101,
            OpCode::PowerLogCurrent => 50200,
            OpCode::PowerLogVoltage => 50201,
            OpCode::PowerLogFilteredCurrent => 50202,
            OpCode::PowerLogFilteredVoltage => 50203,
            OpCode::PowerLogPower => 50204,
            OpCode::AsciiLog => 50300,
            OpCode::FirmwareState => 60000,
            OpCode::Unknown(code) => code,
        }
    }
}
