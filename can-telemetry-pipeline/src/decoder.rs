//! Signal decoder stage handler
//!
//! Turns reordered transport messages into batches of typed signals by looking every
//! frame up in the schema and running the message decoding engine over it.

use crate::message_decoder::MessageDecoder;
use crate::signals::{SchemaProvider, SignalDatabase};
use crate::stage::Handler;
use crate::types::{DecodedSignal, Result, SignalBatch, TransportMessage};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Decodes transport messages against a shared schema
pub struct Decoder {
    schema: Arc<dyn SchemaProvider>,
    unknown_frames: AtomicU64,
    skipped_frames: AtomicU64,
}

impl Decoder {
    /// Create a decoder reading frame layouts from `schema`
    pub fn new(schema: Arc<dyn SchemaProvider>) -> Self {
        Self {
            schema,
            unknown_frames: AtomicU64::new(0),
            skipped_frames: AtomicU64::new(0),
        }
    }

    /// Create a decoder owning a loaded signal database
    pub fn with_database(database: SignalDatabase) -> Self {
        Self::new(Arc::new(database))
    }

    /// Decode every frame of a message, in frame order
    ///
    /// Frames with no schema entry contribute nothing. Error and remote frames carry no
    /// signal data and are skipped.
    pub fn decode_message(&self, message: &TransportMessage) -> Vec<DecodedSignal> {
        let mut signals = Vec::new();

        for frame in &message.frames {
            if frame.is_error() || frame.is_remote() {
                self.skipped_frames.fetch_add(1, Ordering::Relaxed);
                log::trace!("Skipping error/remote frame 0x{:08X}", frame.id);
                continue;
            }

            let definitions = self.schema.lookup(frame.can_id());
            if definitions.is_empty() {
                self.unknown_frames.fetch_add(1, Ordering::Relaxed);
                log::trace!(
                    "No definition for frame 0x{:X} in sequence {}",
                    frame.can_id(),
                    message.sequence_number
                );
                continue;
            }

            signals.extend(MessageDecoder::decode_frame(frame, definitions));
        }

        signals
    }

    /// Frames seen without a schema entry
    pub fn unknown_frames(&self) -> u64 {
        self.unknown_frames.load(Ordering::Relaxed)
    }
}

impl Handler for Decoder {
    type In = TransportMessage;
    type Out = SignalBatch;

    fn handle(&self, message: TransportMessage) -> Result<Option<SignalBatch>> {
        let signals = self.decode_message(&message);
        if signals.is_empty() {
            return Ok(None);
        }

        Ok(Some(SignalBatch {
            sequence_number: message.sequence_number,
            received_at: message.received_at.unwrap_or_else(Utc::now),
            signals,
        }))
    }

    fn close(&mut self) {
        log::info!(
            "Decoder saw {} unknown and {} error/remote frames",
            self.unknown_frames(),
            self.skipped_frames.load(Ordering::Relaxed)
        );
    }
}
