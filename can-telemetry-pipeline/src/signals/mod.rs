//! Signal database and DBC parser
//!
//! This module contains the DBC loader and the signal database the decoder looks frame
//! layouts up in.

pub mod database;
pub mod dbc;

// Re-export key types for convenience
pub use database::{
    infer_value_type, ByteOrder, DatabaseStats, MessageDefinition, MultiplexerInfo,
    SchemaProvider, SignalDatabase, SignalDefinition,
};
pub use dbc::{load_dbc_or_empty, parse_dbc_file, parse_dbc_str};
