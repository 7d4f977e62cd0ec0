//! Row sinks
//!
//! A [`RowSink`] receives finished row batches. [`JsonLinesSink`] writes one JSON object
//! per row to a file or stdout; [`CollectingSink`] keeps rows in memory.

use crate::rows::{RowBatch, SinkRow};
use crate::stage::Handler;
use crate::types::{Result, TelemetryError};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Destination for sink rows
pub trait RowSink: Send + Sync {
    /// Acquire the underlying resource. Failure is fatal to the pipeline.
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    /// Write one batch of rows
    fn write(&self, rows: &[SinkRow]) -> Result<()>;

    fn close(&mut self) {}
}

/// Where a [`JsonLinesSink`] writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkTarget {
    Stdout,
    /// Appends to the file, creating it if needed
    File(PathBuf),
}

/// Writes each row as one line of JSON
pub struct JsonLinesSink {
    target: SinkTarget,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    rows_written: AtomicU64,
}

impl JsonLinesSink {
    pub fn new(target: SinkTarget) -> Self {
        Self {
            target,
            writer: Mutex::new(None),
            rows_written: AtomicU64::new(0),
        }
    }

    pub fn stdout() -> Self {
        Self::new(SinkTarget::Stdout)
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::new(SinkTarget::File(path.into()))
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::Relaxed)
    }

    /// Serialize a batch as JSON lines; nothing reaches the output if any row fails
    fn encode_rows(rows: &[SinkRow]) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(rows.len() * 128);
        for row in rows {
            serde_json::to_writer(&mut buf, row)?;
            buf.push(b'\n');
        }
        Ok(buf)
    }
}

impl RowSink for JsonLinesSink {
    fn open(&mut self) -> Result<()> {
        let writer: Box<dyn Write + Send> = match &self.target {
            SinkTarget::Stdout => Box::new(BufWriter::new(io::stdout())),
            SinkTarget::File(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| {
                        TelemetryError::SinkError(format!("cannot open {:?}: {}", path, e))
                    })?;
                log::info!("Writing rows to {:?}", path);
                Box::new(BufWriter::new(file))
            }
        };
        *self.writer.lock() = Some(writer);
        Ok(())
    }

    fn write(&self, rows: &[SinkRow]) -> Result<()> {
        let lines = Self::encode_rows(rows)?;

        let mut guard = self.writer.lock();
        let writer = guard
            .as_mut()
            .ok_or_else(|| TelemetryError::SinkError("sink is not open".to_string()))?;

        writer.write_all(&lines)?;
        writer.flush()?;

        self.rows_written.fetch_add(rows.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut writer) = self.writer.lock().take() {
            if let Err(e) = writer.flush() {
                log::warn!("Failed to flush sink output: {}", e);
            }
        }
        log::info!("JSON lines sink wrote {} rows", self.rows_written());
    }
}

/// Keeps every row in memory
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    rows: Arc<Mutex<Vec<SinkRow>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all rows written so far
    pub fn rows(&self) -> Vec<SinkRow> {
        self.rows.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

impl RowSink for CollectingSink {
    fn write(&self, rows: &[SinkRow]) -> Result<()> {
        self.rows.lock().extend_from_slice(rows);
        Ok(())
    }
}

/// Terminal handler forwarding row batches to a [`RowSink`]
pub struct SinkHandler<S: RowSink> {
    sink: S,
}

impl<S: RowSink> SinkHandler<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

impl<S: RowSink> Handler for SinkHandler<S> {
    type In = RowBatch;
    type Out = ();

    fn init(&mut self) -> Result<()> {
        self.sink.open()
    }

    fn handle(&self, batch: RowBatch) -> Result<Option<()>> {
        self.sink.write(&batch.rows).map_err(|e| {
            TelemetryError::SinkError(format!(
                "batch {} ({} rows) not written: {}",
                batch.sequence_number,
                batch.rows.len(),
                e
            ))
        })?;
        Ok(Some(()))
    }

    fn close(&mut self) {
        self.sink.close();
    }
}
