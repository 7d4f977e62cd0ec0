//! Cannelloni datagram codec
//!
//! Cannelloni tunnels CAN frames over UDP. Each datagram carries a small header and a
//! batch of frames:
//!
//! ```text
//! +---------+---------+----------+-------------+
//! | version | op_code | sequence | frame count |   5 bytes, count is big-endian u16
//! +---------+---------+----------+-------------+
//! | can_id (u32 BE) | len (u8) | data[len]      |   repeated `frame count` times
//! +------------------------------------------- +
//! ```
//!
//! The identifier keeps the SocketCAN flag bits (EFF/RTR/ERR). Remote frames carry their
//! DLC in `len` but no data bytes. Only classic CAN frames (0-8 data bytes) are
//! accepted; a datagram that does not parse completely is rejected as a whole.

use crate::stage::Handler;
use crate::types::{
    RawCanFrame, RawDatagram, Result, TelemetryError, TransportMessage, CAN_MAX_DLEN, CAN_RTR_FLAG,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

/// Protocol version this codec speaks
pub const CANNELLONI_VERSION: u8 = 2;

/// Size of the datagram header in bytes
pub const HEADER_SIZE: usize = 5;

/// Size of a frame header (identifier + length) in bytes
pub const FRAME_HEADER_SIZE: usize = 5;

/// Set in the length byte of CAN FD frames
const CANFD_FRAME_FLAG: u8 = 0x80;

/// Datagram operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Data = 0,
    Ack = 1,
    Nack = 2,
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(OpCode::Data),
            1 => Ok(OpCode::Ack),
            2 => Ok(OpCode::Nack),
            other => Err(other),
        }
    }
}

fn malformed(reason: impl Into<String>) -> TelemetryError {
    TelemetryError::MalformedFrame(reason.into())
}

/// Stateless encoder/decoder for Cannelloni datagrams
pub struct CannelloniCodec;

impl CannelloniCodec {
    /// Decode a datagram into a transport message
    pub fn decode(payload: &[u8]) -> Result<TransportMessage> {
        if payload.len() < HEADER_SIZE {
            return Err(malformed(format!(
                "datagram of {} bytes is shorter than the {}-byte header",
                payload.len(),
                HEADER_SIZE
            )));
        }

        let mut cursor = Cursor::new(payload);
        let version = cursor.read_u8()?;
        let op_code = cursor.read_u8()?;
        let sequence_number = cursor.read_u8()?;
        let count = cursor.read_u16::<BigEndian>()? as usize;

        if version != CANNELLONI_VERSION {
            return Err(malformed(format!("unsupported protocol version {}", version)));
        }
        match OpCode::try_from(op_code) {
            Ok(OpCode::Data) => {}
            Ok(other) => return Err(malformed(format!("{:?} datagram carries no frames", other))),
            Err(code) => return Err(malformed(format!("unknown op code {}", code))),
        }

        let mut frames = Vec::with_capacity(count.min(payload.len() / FRAME_HEADER_SIZE));
        for index in 0..count {
            frames.push(Self::decode_frame(&mut cursor, index, count)?);
        }

        let trailing = payload.len() - cursor.position() as usize;
        if trailing > 0 {
            return Err(malformed(format!(
                "{} trailing bytes after {} frames",
                trailing, count
            )));
        }

        Ok(TransportMessage::with_frames(sequence_number, frames))
    }

    fn decode_frame(cursor: &mut Cursor<&[u8]>, index: usize, count: usize) -> Result<RawCanFrame> {
        let truncated = |what: &str| malformed(format!("frame {}/{} truncated in {}", index + 1, count, what));

        let id = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| truncated("identifier"))?;
        let len = cursor.read_u8().map_err(|_| truncated("length"))?;

        if len & CANFD_FRAME_FLAG != 0 {
            return Err(malformed(format!(
                "frame {}/{} is a CAN FD frame, only classic CAN is supported",
                index + 1,
                count
            )));
        }
        if len as usize > CAN_MAX_DLEN {
            return Err(malformed(format!(
                "frame {}/{} has data length {} (max {})",
                index + 1,
                count,
                len,
                CAN_MAX_DLEN
            )));
        }

        let mut data = [0u8; CAN_MAX_DLEN];
        if id & CAN_RTR_FLAG == 0 {
            cursor
                .read_exact(&mut data[..len as usize])
                .map_err(|_| truncated("payload"))?;
        }

        Ok(RawCanFrame { id, len, data })
    }

    /// Data bytes a frame occupies on the wire
    fn wire_data_len(frame: &RawCanFrame) -> usize {
        if frame.is_remote() {
            0
        } else {
            (frame.len as usize).min(CAN_MAX_DLEN)
        }
    }

    /// Number of bytes `encode` will produce
    pub fn encoded_len(message: &TransportMessage) -> usize {
        HEADER_SIZE
            + message
                .frames
                .iter()
                .map(|f| FRAME_HEADER_SIZE + Self::wire_data_len(f))
                .sum::<usize>()
    }

    /// Encode a transport message as a DATA datagram
    pub fn encode(message: &TransportMessage) -> Result<Vec<u8>> {
        let count = u16::try_from(message.frames.len()).map_err(|_| {
            TelemetryError::InvalidConfig(format!(
                "{} frames do not fit in one datagram",
                message.frames.len()
            ))
        })?;

        let mut buf = Vec::with_capacity(Self::encoded_len(message));
        buf.write_u8(CANNELLONI_VERSION)?;
        buf.write_u8(OpCode::Data as u8)?;
        buf.write_u8(message.sequence_number)?;
        buf.write_u16::<BigEndian>(count)?;

        for frame in &message.frames {
            buf.write_u32::<BigEndian>(frame.id)?;
            buf.write_u8(frame.len.min(CAN_MAX_DLEN as u8))?;
            buf.extend_from_slice(&frame.data[..Self::wire_data_len(frame)]);
        }

        Ok(buf)
    }
}

/// Stage handler turning raw datagrams into transport messages
#[derive(Debug, Default)]
pub struct CannelloniDecoder;

impl CannelloniDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Handler for CannelloniDecoder {
    type In = RawDatagram;
    type Out = TransportMessage;

    fn handle(&self, datagram: RawDatagram) -> Result<Option<TransportMessage>> {
        match CannelloniCodec::decode(&datagram.payload) {
            Ok(message) => {
                log::trace!(
                    "Datagram #{} decoded: sequence {} with {} frames",
                    datagram.arrival,
                    message.sequence_number,
                    message.frames.len()
                );
                Ok(Some(message.with_received_at(datagram.received_at)))
            }
            Err(e) => {
                log::debug!(
                    "Datagram #{} ({} bytes from {:?}) rejected",
                    datagram.arrival,
                    datagram.payload.len(),
                    datagram.source
                );
                Err(e)
            }
        }
    }
}
