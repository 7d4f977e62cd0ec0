//! Stage execution model
//!
//! A stage owns a handler and the connectors around it. The pipeline drives every stage
//! through the same lifecycle:
//!
//! 1. `init` - one-time setup (bind a socket, open a sink). Failure aborts the pipeline.
//! 2. `run` - the read/handle/write loop, until the input is closed or the token is
//!    cancelled. Per-item handler errors are logged and the item is dropped.
//! 3. `close` - always called, even when `init` failed.
//!
//! Handlers plug into generic stages through two small traits: [`Handler`] for stages
//! with an input (processors and sinks) and [`Source`] for generators.

use crate::cancel::CancellationToken;
use crate::config::RunningMode;
use crate::types::Result;
use std::sync::atomic::{AtomicU64, Ordering};

mod processor;
mod source;

pub use processor::ProcessorStage;
pub use source::SourceStage;

/// Lifecycle interface the pipeline drives
pub trait Stage: Send {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    fn running_mode(&self) -> RunningMode {
        RunningMode::Single
    }

    /// One-time setup
    fn init(&mut self) -> Result<()>;

    /// Process items until the input is exhausted or `cancel` fires
    fn run(&mut self, cancel: &CancellationToken);

    /// Release resources. Must tolerate being called after a failed or skipped `init`.
    fn close(&mut self);
}

/// Item handler for stages with an input connector
///
/// `handle` takes `&self` so pool workers can share one handler; handlers that need
/// mutable state keep it behind their own synchronisation.
pub trait Handler: Send + Sync {
    type In: Send;
    type Out: Send;

    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Transform one item. `Ok(None)` consumes the item without emitting anything.
    fn handle(&self, input: Self::In) -> Result<Option<Self::Out>>;

    fn close(&mut self) {}
}

/// Item generator for stages without an input connector
pub trait Source: Send {
    type Out: Send;

    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Produce the next item. `Ok(None)` means nothing arrived yet; the stage checks
    /// cancellation and polls again, so implementations should not block for long.
    fn poll(&mut self) -> Result<Option<Self::Out>>;

    fn close(&mut self) {}
}

/// Per-stage item counters
#[derive(Debug, Default)]
pub struct StageStats {
    received: AtomicU64,
    emitted: AtomicU64,
    dropped: AtomicU64,
}

impl StageStats {
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emitted(&self) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`StageStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub emitted: u64,
    pub dropped: u64,
}
