//! CAN Telemetry Pipeline Library
//!
//! Turns CAN traffic tunnelled over UDP (Cannelloni) into ordered, decoded, typed
//! signal rows for a column-oriented time-series sink.
//!
//! # Architecture
//!
//! The pipeline is a chain of stages connected by bounded queues:
//!
//! ```text
//! UdpSource -> CannelloniDecoder -> ReorderStage -> Decoder -> RowMapper -> RowSink
//! ```
//!
//! - [`Connector`] is the bounded FIFO between two stages. A full connector blocks its
//!   producer, so backpressure reaches the socket.
//! - Stages run in Single mode (one worker, order kept) or Pool mode (several workers
//!   sharing the input). The reorder stage is always Single.
//! - [`ReorderStage`] restores the sender's order from the 8-bit sequence number and
//!   recovers when a datagram never arrives.
//! - Frame layouts come from a [`SchemaProvider`], normally a [`SignalDatabase`] loaded
//!   from a DBC file.
//! - Every blocking call observes one shared [`CancellationToken`].
//!
//! # Example Usage
//!
//! ```no_run
//! use can_telemetry_pipeline::{
//!     load_dbc_or_empty, CancellationToken, CannelloniDecoder, CollectingSink, Connector,
//!     Decoder, Pipeline, ProcessorStage, ReorderConfig, ReorderStage, RowMapper,
//!     SinkHandler, SourceStage, StageConfig, UdpSource,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let datagrams = Arc::new(Connector::new(2048));
//! let messages = Arc::new(Connector::new(2048));
//! let ordered = Arc::new(Connector::new(2048));
//! let signals = Arc::new(Connector::new(2048));
//! let rows = Arc::new(Connector::new(2048));
//!
//! let database = load_dbc_or_empty(Some(Path::new("bus.dbc")));
//!
//! let mut pipeline = Pipeline::new();
//! pipeline.add_stage(SourceStage::new(
//!     "udp",
//!     UdpSource::new("127.0.0.1:20000".parse().unwrap()),
//!     datagrams.clone(),
//! ));
//! pipeline.add_stage(ProcessorStage::new(
//!     CannelloniDecoder::new(),
//!     datagrams,
//!     messages.clone(),
//!     StageConfig::new("cannelloni"),
//! ));
//! pipeline.add_stage(ReorderStage::new(messages, ordered.clone(), ReorderConfig::default()));
//! pipeline.add_stage(ProcessorStage::new(
//!     Decoder::with_database(database),
//!     ordered,
//!     signals.clone(),
//!     StageConfig::new("can"),
//! ));
//! pipeline.add_stage(ProcessorStage::new(RowMapper::new(), signals, rows.clone(), StageConfig::new("rows")));
//! pipeline.add_stage(ProcessorStage::sink(
//!     SinkHandler::new(CollectingSink::new()),
//!     rows,
//!     StageConfig::new("sink"),
//! ));
//!
//! let cancel = CancellationToken::new();
//! pipeline.init().unwrap();
//! pipeline.run(&cancel).unwrap();
//! ```

// Public modules
pub mod cancel;
pub mod config;
pub mod connector;
pub mod decoder;
pub mod formats;
pub mod ingress;
pub mod message_decoder;
pub mod pipeline;
pub mod reorder;
pub mod rows;
pub mod signals;
pub mod sink;
pub mod stage;
pub mod types;

// Re-export main types for convenience
pub use cancel::CancellationToken;
pub use config::{PoolConfig, ReorderConfig, RunningMode, StageConfig};
pub use connector::{Connector, DequeueError, EnqueueError, EnqueueMode};
pub use decoder::Decoder;
pub use formats::{CannelloniCodec, CannelloniDecoder, OpCode};
pub use ingress::UdpSource;
pub use message_decoder::MessageDecoder;
pub use pipeline::Pipeline;
pub use reorder::{ReorderBuffer, ReorderStage, ReorderStats};
pub use rows::{Column, ColumnValue, RowBatch, RowMapper, SinkRow};
pub use signals::{
    load_dbc_or_empty, ByteOrder, DatabaseStats, MessageDefinition, SchemaProvider,
    SignalDatabase, SignalDefinition,
};
pub use sink::{CollectingSink, JsonLinesSink, RowSink, SinkHandler, SinkTarget};
pub use stage::{Handler, ProcessorStage, Source, SourceStage, Stage, StatsSnapshot};
pub use types::{
    DecodedSignal, RawCanFrame, RawDatagram, Result, SignalBatch, SignalTable, SignalValue,
    TelemetryError, Timestamp, TransportMessage, ValueType,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
