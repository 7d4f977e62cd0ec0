//! Signal database
//!
//! Holds the frame → signal definitions mapping the decoder reads from. The database is
//! built once at startup and shared read-only afterwards.

use crate::types::{Result, TelemetryError, ValueType};
use std::collections::HashMap;

/// Source of signal definitions, keyed by CAN identifier
pub trait SchemaProvider: Send + Sync {
    /// Ordered signal definitions for a frame; empty when the frame is unknown
    fn lookup(&self, frame_id: u32) -> &[SignalDefinition];
}

/// A complete CAN message definition
#[derive(Debug, Clone)]
pub struct MessageDefinition {
    /// CAN identifier without flag bits
    pub id: u32,
    /// Message name
    pub name: String,
    /// All signals in this message
    pub signals: Vec<SignalDefinition>,
}

/// A CAN signal definition
#[derive(Debug, Clone, PartialEq)]
pub struct SignalDefinition {
    /// CAN identifier of the owning frame
    pub frame_id: u32,
    /// Signal name
    pub name: String,
    /// Start bit: LSB for little-endian, MSB for big-endian (DBC numbering)
    pub start_bit: u16,
    /// Length in bits (1-64)
    pub length: u16,
    pub byte_order: ByteOrder,
    /// Two's complement raw value
    pub signed: bool,
    /// Scale factor to convert raw value to physical value
    pub scale: f64,
    /// Offset to add after scaling
    pub offset: f64,
    pub value_type: ValueType,
    /// Enum labels keyed by the raw bit pattern (signed table values masked to `length`)
    pub enum_values: HashMap<u64, String>,
    /// True if this signal selects which multiplexed signals are present
    pub is_multiplexor: bool,
    /// Set for signals that are only present for some multiplexor values
    pub multiplexer: Option<MultiplexerInfo>,
}

/// Byte order for signal extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Little-endian (Intel format)
    LittleEndian,
    /// Big-endian (Motorola format)
    BigEndian,
}

/// Multiplexer information for multiplexed signals
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiplexerInfo {
    /// Multiplexor value(s) for which this signal is active
    pub multiplexer_values: Vec<u64>,
}

impl SignalDefinition {
    /// Unsigned little-endian integer signal with unit scaling
    pub fn new(frame_id: u32, name: impl Into<String>, start_bit: u16, length: u16) -> Self {
        Self {
            frame_id,
            name: name.into(),
            start_bit,
            length,
            byte_order: ByteOrder::LittleEndian,
            signed: false,
            scale: 1.0,
            offset: 0.0,
            value_type: ValueType::Integer,
            enum_values: HashMap::new(),
            is_multiplexor: false,
            multiplexer: None,
        }
    }

    /// Builder method: use Motorola byte order
    pub fn big_endian(mut self) -> Self {
        self.byte_order = ByteOrder::BigEndian;
        self
    }

    /// Builder method: interpret the raw value as two's complement
    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    /// Builder method: set scale and offset
    pub fn with_scaling(mut self, scale: f64, offset: f64) -> Self {
        self.scale = scale;
        self.offset = offset;
        self
    }

    pub fn with_value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }

    /// Builder method: make this an enum signal with the given labels
    pub fn with_enum_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = (u64, S)>,
        S: Into<String>,
    {
        self.enum_values = values.into_iter().map(|(k, v)| (k, v.into())).collect();
        self.value_type = ValueType::Enum;
        self
    }

    /// Builder method: only decode this signal for the given multiplexor values
    pub fn multiplexed_on(mut self, values: Vec<u64>) -> Self {
        self.multiplexer = Some(MultiplexerInfo {
            multiplexer_values: values,
        });
        self
    }

    /// Builder method: mark as the message's multiplexor
    pub fn as_multiplexor(mut self) -> Self {
        self.is_multiplexor = true;
        self
    }

    /// Reject layouts the decoder cannot extract
    pub fn validate(&self) -> Result<()> {
        if self.length == 0 || self.length > 64 {
            return Err(TelemetryError::InvalidSignalDefinition(format!(
                "signal '{}' has length {} (must be 1-64 bits)",
                self.name, self.length
            )));
        }
        if self.start_bit >= 512 {
            return Err(TelemetryError::InvalidSignalDefinition(format!(
                "signal '{}' starts at bit {}",
                self.name, self.start_bit
            )));
        }
        Ok(())
    }
}

/// Choose how a signal's value is represented
///
/// Signals with a value table are enums, single-bit signals are flags, signals with a
/// fractional scale or offset are floats and everything else is an integer.
pub fn infer_value_type(length: u16, scale: f64, offset: f64, has_value_table: bool) -> ValueType {
    if has_value_table {
        ValueType::Enum
    } else if length == 1 && scale == 1.0 && offset == 0.0 {
        ValueType::Flag
    } else if scale.fract() != 0.0 || offset.fract() != 0.0 {
        ValueType::Float
    } else {
        ValueType::Integer
    }
}

/// The unified signal database
#[derive(Debug, Default)]
pub struct SignalDatabase {
    /// Message definitions by CAN ID
    messages: HashMap<u32, MessageDefinition>,
}

impl SignalDatabase {
    /// Create a new empty signal database
    pub fn new() -> Self {
        Self {
            messages: HashMap::new(),
        }
    }

    /// Build a database from message definitions
    pub fn from_messages(messages: impl IntoIterator<Item = MessageDefinition>) -> Self {
        let mut db = Self::new();
        for message in messages {
            db.add_message(message);
        }
        db
    }

    /// Add a message definition. Invalid signals are dropped with a warning; a later
    /// definition for the same CAN ID replaces the earlier one.
    pub fn add_message(&mut self, mut message: MessageDefinition) {
        message.signals.retain(|signal| match signal.validate() {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Skipping signal in message '{}': {}", message.name, e);
                false
            }
        });

        if let Some(previous) = self.messages.insert(message.id, message) {
            log::warn!(
                "Message 0x{:X} '{}' redefined, keeping the later definition",
                previous.id,
                previous.name
            );
        }
    }

    /// Get database statistics
    pub fn stats(&self) -> DatabaseStats {
        let num_signals = self.messages.values().map(|m| m.signals.len()).sum();
        let num_enum_signals = self
            .messages
            .values()
            .flat_map(|m| m.signals.iter())
            .filter(|s| s.value_type == ValueType::Enum)
            .count();

        DatabaseStats {
            num_messages: self.messages.len(),
            num_signals,
            num_enum_signals,
        }
    }
}

impl SchemaProvider for SignalDatabase {
    fn lookup(&self, frame_id: u32) -> &[SignalDefinition] {
        self.messages
            .get(&frame_id)
            .map(|m| m.signals.as_slice())
            .unwrap_or(&[])
    }
}

/// Database statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Total number of message definitions
    pub num_messages: usize,
    /// Total number of signal definitions
    pub num_signals: usize,
    /// Signals decoded through a value table
    pub num_enum_signals: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_message() -> MessageDefinition {
        MessageDefinition {
            id: 0x123,
            name: "EngineData".to_string(),
            signals: vec![
                SignalDefinition::new(0x123, "EngineSpeed", 0, 16),
                SignalDefinition::new(0x123, "Gear", 16, 4).with_enum_values([(1, "first"), (2, "second")]),
            ],
        }
    }

    #[test]
    fn test_empty_database() {
        let db = SignalDatabase::new();
        let stats = db.stats();
        assert_eq!(stats.num_messages, 0);
        assert_eq!(stats.num_signals, 0);
        assert!(db.lookup(0x123).is_empty());
    }

    #[test]
    fn test_add_message() {
        let db = SignalDatabase::from_messages([engine_message()]);

        let stats = db.stats();
        assert_eq!(stats.num_messages, 1);
        assert_eq!(stats.num_signals, 2);
        assert_eq!(stats.num_enum_signals, 1);

        let signals = db.lookup(0x123);
        assert_eq!(signals[0].name, "EngineSpeed");
        assert_eq!(signals[1].name, "Gear");
    }

    #[test]
    fn test_invalid_signals_are_skipped() {
        let mut message = engine_message();
        message.signals.push(SignalDefinition::new(0x123, "TooWide", 0, 65));
        message.signals.push(SignalDefinition::new(0x123, "Empty", 0, 0));

        let db = SignalDatabase::from_messages([message]);
        assert_eq!(db.lookup(0x123).len(), 2);
    }

    #[test]
    fn test_infer_value_type() {
        assert_eq!(infer_value_type(1, 1.0, 0.0, false), ValueType::Flag);
        assert_eq!(infer_value_type(1, 1.0, 0.0, true), ValueType::Enum);
        assert_eq!(infer_value_type(16, 0.01, 0.0, false), ValueType::Float);
        assert_eq!(infer_value_type(8, 1.0, -40.0, false), ValueType::Integer);
        assert_eq!(infer_value_type(8, 1.0, 0.5, false), ValueType::Float);
    }
}
