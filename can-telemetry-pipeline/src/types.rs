//! Core types for the telemetry pipeline
//!
//! This module defines the values that flow between stages: raw datagrams, decoded
//! transport messages, CAN frames and decoded signals. Every value is owned by exactly
//! one stage at a time and moves across connectors by value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Timestamp type used throughout the pipeline
pub type Timestamp = DateTime<Utc>;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Extended (29-bit) identifier flag carried in the wire identifier
pub const CAN_EFF_FLAG: u32 = 0x8000_0000;
/// Remote transmission request flag
pub const CAN_RTR_FLAG: u32 = 0x4000_0000;
/// Error frame flag
pub const CAN_ERR_FLAG: u32 = 0x2000_0000;
/// Mask for a 29-bit identifier
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;
/// Mask for an 11-bit identifier
pub const CAN_SFF_MASK: u32 = 0x0000_07FF;

/// Maximum payload of a classic CAN frame
pub const CAN_MAX_DLEN: usize = 8;

/// Errors that can occur in the pipeline
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Failed to load schema: {0}")]
    SchemaError(String),

    #[error("Invalid signal definition: {0}")]
    InvalidSignalDefinition(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Column '{column}' breaks row ordering: symbol columns must precede all other columns")]
    ColumnOrder { column: String },

    #[error("Stage '{stage}' failed to initialize: {source}")]
    StageInit {
        stage: String,
        #[source]
        source: Box<TelemetryError>,
    },

    #[error("Sink error: {0}")]
    SinkError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// One UDP datagram as received by the ingress
#[derive(Debug, Clone, PartialEq)]
pub struct RawDatagram {
    /// Monotonic arrival counter assigned by the ingress
    pub arrival: u64,
    /// Sender address
    pub source: Option<SocketAddr>,
    /// Reception time
    pub received_at: Timestamp,
    /// Undecoded payload bytes
    pub payload: Vec<u8>,
}

impl RawDatagram {
    /// Create a datagram stamped with the current time
    pub fn new(arrival: u64, payload: Vec<u8>) -> Self {
        Self {
            arrival,
            source: None,
            received_at: Utc::now(),
            payload,
        }
    }
}

/// Raw classic CAN frame carried inside a transport message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawCanFrame {
    /// Wire identifier, including the EFF/RTR/ERR flag bits
    pub id: u32,
    /// Data length code (0-8)
    pub len: u8,
    /// Payload buffer; only the first `len` bytes are valid
    pub data: [u8; CAN_MAX_DLEN],
}

impl RawCanFrame {
    /// Build a frame from a payload slice, truncating anything beyond 8 bytes
    pub fn new(id: u32, payload: &[u8]) -> Self {
        let len = payload.len().min(CAN_MAX_DLEN);
        let mut data = [0u8; CAN_MAX_DLEN];
        data[..len].copy_from_slice(&payload[..len]);
        Self {
            id,
            len: len as u8,
            data,
        }
    }

    /// CAN identifier without flag bits (11-bit or 29-bit)
    pub fn can_id(&self) -> u32 {
        if self.is_extended() {
            self.id & CAN_EFF_MASK
        } else {
            self.id & CAN_SFF_MASK
        }
    }

    /// True if this is an extended (29-bit) CAN ID
    pub fn is_extended(&self) -> bool {
        self.id & CAN_EFF_FLAG != 0
    }

    /// True if this is a remote frame
    pub fn is_remote(&self) -> bool {
        self.id & CAN_RTR_FLAG != 0
    }

    /// True if this is an error frame
    pub fn is_error(&self) -> bool {
        self.id & CAN_ERR_FLAG != 0
    }

    /// Valid payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// A decoded Cannelloni datagram: a sequence number and the CAN frames it carried
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportMessage {
    /// Sender sequence number, wraps at 256
    pub sequence_number: u8,
    /// Frames in wire order
    pub frames: Vec<RawCanFrame>,
    /// Reception time of the carrying datagram; not part of the wire format
    pub received_at: Option<Timestamp>,
}

impl TransportMessage {
    pub fn new(sequence_number: u8) -> Self {
        Self {
            sequence_number,
            frames: Vec::new(),
            received_at: None,
        }
    }

    pub fn with_frames(sequence_number: u8, frames: Vec<RawCanFrame>) -> Self {
        Self {
            sequence_number,
            frames,
            received_at: None,
        }
    }

    /// Builder method: stamp the message with its datagram's reception time
    pub fn with_received_at(mut self, timestamp: Timestamp) -> Self {
        self.received_at = Some(timestamp);
        self
    }

    pub fn push(&mut self, frame: RawCanFrame) {
        self.frames.push(frame);
    }
}

/// How a signal's raw bits are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Flag,
    Integer,
    Float,
    Enum,
}

/// Destination table bucket for a decoded signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalTable {
    Flag,
    Int,
    Float,
    Enum,
    Unknown,
}

impl SignalTable {
    /// Sink table name
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalTable::Flag => "flag_signals",
            SignalTable::Int => "int_signals",
            SignalTable::Float => "float_signals",
            SignalTable::Enum => "enum_signals",
            SignalTable::Unknown => "unknown_signals",
        }
    }
}

impl From<ValueType> for SignalTable {
    fn from(value_type: ValueType) -> Self {
        match value_type {
            ValueType::Flag => SignalTable::Flag,
            ValueType::Integer => SignalTable::Int,
            ValueType::Float => SignalTable::Float,
            ValueType::Enum => SignalTable::Enum,
        }
    }
}

/// Typed signal value
#[derive(Debug, Clone, PartialEq)]
pub enum SignalValue {
    Flag(bool),
    Integer(i64),
    Float(f64),
    /// Label from the signal's value table
    Enum(String),
}

impl SignalValue {
    /// The value type this value belongs to
    pub fn value_type(&self) -> ValueType {
        match self {
            SignalValue::Flag(_) => ValueType::Flag,
            SignalValue::Integer(_) => ValueType::Integer,
            SignalValue::Float(_) => ValueType::Float,
            SignalValue::Enum(_) => ValueType::Enum,
        }
    }
}

/// A signal extracted from one CAN frame
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSignal {
    /// CAN identifier of the frame the signal came from
    pub frame_id: u32,
    /// Signal name from the schema
    pub name: String,
    /// Raw bits before any conversion
    pub raw_value: u64,
    pub value_type: ValueType,
    pub value: SignalValue,
    pub table: SignalTable,
}

/// All signals decoded from one transport message
#[derive(Debug, Clone, PartialEq)]
pub struct SignalBatch {
    pub sequence_number: u8,
    /// Reception time of the datagram the signals came from
    pub received_at: Timestamp,
    pub signals: Vec<DecodedSignal>,
}

impl SignalBatch {
    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_frame_identifiers() {
        let standard = RawCanFrame::new(0x123, &[1, 2, 3]);
        assert_eq!(standard.can_id(), 0x123);
        assert!(!standard.is_extended());
        assert_eq!(standard.payload(), &[1, 2, 3]);

        let extended = RawCanFrame::new(CAN_EFF_FLAG | 0x18FE_F100, &[]);
        assert!(extended.is_extended());
        assert_eq!(extended.can_id(), 0x18FE_F100);
        assert_eq!(extended.len, 0);
    }

    #[test]
    fn test_raw_frame_truncates_payload() {
        let frame = RawCanFrame::new(1, &[0xAA; 12]);
        assert_eq!(frame.len, 8);
        assert_eq!(frame.payload().len(), 8);
    }

    #[test]
    fn test_signal_table_names() {
        assert_eq!(SignalTable::from(ValueType::Flag).as_str(), "flag_signals");
        assert_eq!(SignalTable::from(ValueType::Integer).as_str(), "int_signals");
        assert_eq!(SignalTable::from(ValueType::Float).as_str(), "float_signals");
        assert_eq!(SignalTable::from(ValueType::Enum).as_str(), "enum_signals");
        assert_eq!(SignalTable::Unknown.as_str(), "unknown_signals");
    }

    #[test]
    fn test_signal_value_types() {
        assert_eq!(SignalValue::Integer(42).value_type(), ValueType::Integer);
        assert_eq!(SignalValue::Enum("third".into()).value_type(), ValueType::Enum);
    }

    #[test]
    fn test_transport_message_keeps_arrival_time() {
        let datagram = RawDatagram::new(0, vec![]);
        let message = TransportMessage::new(9).with_received_at(datagram.received_at);
        assert_eq!(message.received_at, Some(datagram.received_at));
        assert_eq!(TransportMessage::new(9).received_at, None);
    }
}
