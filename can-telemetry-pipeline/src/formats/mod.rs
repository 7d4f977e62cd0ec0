//! Transport formats
//!
//! Codecs for the datagram formats that carry CAN traffic into the pipeline.

pub mod cannelloni;

// Re-export codec types
pub use cannelloni::{CannelloniCodec, CannelloniDecoder, OpCode, CANNELLONI_VERSION};
