//! DBC file parser
//!
//! Parses Vector DBC files and converts them into the signal database the decoder uses.

use crate::signals::database::{
    infer_value_type, ByteOrder, MessageDefinition, MultiplexerInfo, SignalDatabase,
    SignalDefinition,
};
use crate::types::{Result, TelemetryError, CAN_EFF_MASK};
use std::collections::HashMap;
use std::path::Path;

/// Set on DBC message ids that denote extended (29-bit) frames
const DBC_EXTENDED_ID_FLAG: u32 = 0x8000_0000;

/// Parse a DBC file and return message definitions
pub fn parse_dbc_file(path: &Path) -> Result<Vec<MessageDefinition>> {
    log::info!("Parsing DBC file: {:?}", path);

    let bytes = std::fs::read(path).map_err(|e| {
        TelemetryError::SchemaError(format!("Failed to read file {:?}: {}", path, e))
    })?;

    // Fall back to Latin-1 for files exported by Windows tools
    let dbc_content = match String::from_utf8(bytes) {
        Ok(content) => content,
        Err(e) => {
            log::warn!("DBC file is not UTF-8, trying Latin-1 encoding");
            e.into_bytes().iter().map(|&b| b as char).collect()
        }
    };

    let source_filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown.dbc");

    let messages = parse_dbc_str(&dbc_content, source_filename)?;
    log::info!("Parsed {} messages from {:?}", messages.len(), path);
    Ok(messages)
}

/// Parse DBC text; `source` names the input in error messages
pub fn parse_dbc_str(content: &str, source: &str) -> Result<Vec<MessageDefinition>> {
    let dbc = can_dbc::DBC::from_slice(content.as_bytes()).map_err(|e| {
        TelemetryError::SchemaError(format!("Failed to parse DBC {}: {:?}", source, e))
    })?;

    Ok(dbc
        .messages()
        .iter()
        .map(|dbc_msg| convert_message(&dbc, dbc_msg))
        .collect())
}

/// Load a DBC file into a database, logging failures and returning an empty database
///
/// A missing schema leaves the pipeline running; every frame then decodes to nothing.
pub fn load_dbc_or_empty(path: Option<&Path>) -> SignalDatabase {
    let Some(path) = path else {
        log::warn!("No DBC file configured, all frames will be treated as unknown");
        return SignalDatabase::new();
    };

    match parse_dbc_file(path) {
        Ok(messages) => {
            let db = SignalDatabase::from_messages(messages);
            let stats = db.stats();
            log::info!(
                "Signal database ready: {} messages, {} signals ({} enums)",
                stats.num_messages,
                stats.num_signals,
                stats.num_enum_signals
            );
            db
        }
        Err(e) => {
            log::error!("Failed to load DBC file {:?}: {}", path, e);
            SignalDatabase::new()
        }
    }
}

/// Strip the DBC extended flag so ids match the frame's `can_id()`
fn normalize_message_id(raw: u32) -> u32 {
    if raw & DBC_EXTENDED_ID_FLAG != 0 {
        raw & CAN_EFF_MASK
    } else {
        raw
    }
}

/// Key a value table entry by the raw bit pattern the decoder extracts
///
/// DBC value tables store signed values (`VAL_ ... -1 "reverse"`); the decoder sees the
/// low `length` bits of their two's complement form.
fn value_table_key(value: f64, length: u64) -> u64 {
    let bits = value as i64 as u64;
    if length >= 64 {
        bits
    } else {
        bits & ((1u64 << length) - 1)
    }
}

/// Convert a can-dbc message to our MessageDefinition
fn convert_message(dbc: &can_dbc::DBC, dbc_msg: &can_dbc::Message) -> MessageDefinition {
    let raw_id = dbc_msg.message_id().0;
    let id = normalize_message_id(raw_id);

    let signals = dbc_msg
        .signals()
        .iter()
        .map(|dbc_sig| {
            let length = *dbc_sig.signal_size();
            let enum_values = dbc
                .value_descriptions_for_signal(can_dbc::MessageId(raw_id), dbc_sig.name())
                .map(|descriptions| {
                    descriptions
                        .iter()
                        .map(|d| (value_table_key(*d.a(), length), d.b().to_string()))
                        .collect::<HashMap<u64, String>>()
                })
                .unwrap_or_default();
            convert_signal(id, dbc_sig, enum_values)
        })
        .collect();

    MessageDefinition {
        id,
        name: dbc_msg.message_name().to_string(),
        signals,
    }
}

/// Convert a can-dbc signal to our SignalDefinition
fn convert_signal(
    frame_id: u32,
    dbc_sig: &can_dbc::Signal,
    enum_values: HashMap<u64, String>,
) -> SignalDefinition {
    let byte_order = match *dbc_sig.byte_order() {
        can_dbc::ByteOrder::LittleEndian => ByteOrder::LittleEndian,
        can_dbc::ByteOrder::BigEndian => ByteOrder::BigEndian,
    };

    let (is_multiplexor, multiplexer) = match *dbc_sig.multiplexer_indicator() {
        can_dbc::MultiplexIndicator::Multiplexor => (true, None),
        can_dbc::MultiplexIndicator::MultiplexedSignal(switch_value) => (
            false,
            Some(MultiplexerInfo {
                multiplexer_values: vec![switch_value],
            }),
        ),
        _ => (false, None),
    };

    // Out-of-range sizes are saturated here and rejected by the database
    let length = u16::try_from(*dbc_sig.signal_size()).unwrap_or(u16::MAX);
    let start_bit = u16::try_from(*dbc_sig.start_bit()).unwrap_or(u16::MAX);
    let scale = *dbc_sig.factor();
    let offset = *dbc_sig.offset();

    SignalDefinition {
        frame_id,
        name: dbc_sig.name().to_string(),
        start_bit,
        length,
        byte_order,
        signed: matches!(*dbc_sig.value_type(), can_dbc::ValueType::Signed),
        scale,
        offset,
        value_type: infer_value_type(length, scale, offset, !enum_values.is_empty()),
        enum_values,
        is_multiplexor,
        multiplexer,
    }
}
