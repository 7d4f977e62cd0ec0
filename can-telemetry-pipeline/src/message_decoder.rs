//! Message Decoding Engine
//!
//! Extracts signal values from raw CAN frames based on signal definitions
//! from the signal database. Handles bit extraction, endianness, multiplexing,
//! and typed value conversion.

use crate::signals::database::{ByteOrder, SignalDefinition};
use crate::types::{DecodedSignal, RawCanFrame, SignalTable, SignalValue, ValueType};

/// Label used for enum raw values missing from the value table
pub const UNKNOWN_ENUM_LABEL: &str = "unknown";

/// Message decoder - extracts signals from CAN frames
pub struct MessageDecoder;

impl MessageDecoder {
    /// Decode every applicable signal of a frame
    ///
    /// Signals the frame's payload does not cover are skipped, as are multiplexed
    /// signals whose switch value does not match the frame's multiplexor.
    pub fn decode_frame(frame: &RawCanFrame, signals: &[SignalDefinition]) -> Vec<DecodedSignal> {
        let data = frame.payload();

        let multiplexer_value = signals
            .iter()
            .find(|s| s.is_multiplexor)
            .and_then(|mux| Self::extract_raw(data, mux));

        let mut decoded = Vec::with_capacity(signals.len());
        for signal in signals {
            if let Some(ref mux_info) = signal.multiplexer {
                match multiplexer_value {
                    Some(current) if mux_info.multiplexer_values.contains(&current) => {}
                    _ => continue,
                }
            }

            if let Some(value) = Self::decode_signal(data, signal) {
                decoded.push(value);
            }
        }
        decoded
    }

    /// Decode a single signal from CAN frame data
    pub fn decode_signal(data: &[u8], signal: &SignalDefinition) -> Option<DecodedSignal> {
        let Some(raw_value) = Self::extract_raw(data, signal) else {
            log::debug!(
                "Signal '{}' ({}+{} bits) not covered by {}-byte frame 0x{:X}",
                signal.name,
                signal.start_bit,
                signal.length,
                data.len(),
                signal.frame_id
            );
            return None;
        };

        Some(DecodedSignal {
            frame_id: signal.frame_id,
            name: signal.name.clone(),
            raw_value,
            value_type: signal.value_type,
            value: Self::typed_value(raw_value, signal),
            table: SignalTable::from(signal.value_type),
        })
    }

    /// Convert a raw value according to the signal's value type
    pub fn typed_value(raw_value: u64, signal: &SignalDefinition) -> SignalValue {
        match signal.value_type {
            ValueType::Flag => SignalValue::Flag(raw_value != 0),
            ValueType::Integer => {
                let raw = Self::raw_as_i64(raw_value, signal);
                if signal.scale == 1.0 && signal.offset == 0.0 {
                    SignalValue::Integer(raw)
                } else {
                    SignalValue::Integer((raw as f64 * signal.scale + signal.offset).round() as i64)
                }
            }
            ValueType::Float => {
                let raw = if signal.signed {
                    Self::sign_extend(raw_value, signal.length as usize) as f64
                } else {
                    raw_value as f64
                };
                SignalValue::Float(raw * signal.scale + signal.offset)
            }
            ValueType::Enum => match signal.enum_values.get(&raw_value) {
                Some(label) => SignalValue::Enum(label.clone()),
                None => {
                    log::debug!(
                        "Signal '{}' raw value {} has no enum label",
                        signal.name,
                        raw_value
                    );
                    SignalValue::Enum(UNKNOWN_ENUM_LABEL.to_string())
                }
            },
        }
    }

    fn raw_as_i64(raw_value: u64, signal: &SignalDefinition) -> i64 {
        if signal.signed {
            Self::sign_extend(raw_value, signal.length as usize)
        } else {
            raw_value as i64
        }
    }

    /// Extract the raw bits of a signal; `None` when the data is too short
    pub fn extract_raw(data: &[u8], signal: &SignalDefinition) -> Option<u64> {
        let start_bit = signal.start_bit as usize;
        let length = signal.length as usize;
        if length == 0 || length > 64 {
            return None;
        }

        match signal.byte_order {
            ByteOrder::LittleEndian => Self::extract_little_endian(data, start_bit, length),
            ByteOrder::BigEndian => Self::extract_big_endian(data, start_bit, length),
        }
    }

    /// Extract signal with little-endian (Intel) byte order
    ///
    /// Little-endian format:
    /// - Start bit points to the LSB (least significant bit)
    /// - Bits are numbered from LSB to MSB within each byte
    /// - Byte 0 is the first byte in the CAN frame
    fn extract_little_endian(data: &[u8], start_bit: usize, length: usize) -> Option<u64> {
        if start_bit + length > data.len() * 8 {
            return None;
        }

        let mut result: u64 = 0;
        for i in 0..length {
            let bit_pos = start_bit + i;
            let bit_value = (data[bit_pos / 8] >> (bit_pos % 8)) & 0x01;
            result |= (bit_value as u64) << i;
        }
        Some(result)
    }

    /// Extract signal with big-endian (Motorola) byte order
    ///
    /// DBC numbers bits LSB-first within each byte (bit 0 = LSB of byte 0). The start
    /// bit is the signal's MSB; walking toward the LSB moves down within a byte and
    /// continues at bit 7 of the next byte (the "sawtooth").
    fn extract_big_endian(data: &[u8], start_bit: usize, length: usize) -> Option<u64> {
        let mut result: u64 = 0;
        let mut bit_pos = start_bit;

        for _ in 0..length {
            let byte_idx = bit_pos / 8;
            if byte_idx >= data.len() {
                return None;
            }
            let bit_value = (data[byte_idx] >> (bit_pos % 8)) & 0x01;
            result = (result << 1) | bit_value as u64;

            bit_pos = if bit_pos % 8 == 0 { bit_pos + 15 } else { bit_pos - 1 };
        }
        Some(result)
    }

    /// Sign-extend a value from N bits to 64 bits
    ///
    /// If the value's MSB is 1, fill the upper bits with 1s.
    fn sign_extend(value: u64, bit_length: usize) -> i64 {
        if bit_length == 0 || bit_length >= 64 {
            return value as i64;
        }

        let sign_bit = 1u64 << (bit_length - 1);
        if (value & sign_bit) != 0 {
            let mask = !0u64 << bit_length;
            (value | mask) as i64
        } else {
            value as i64
        }
    }
}
