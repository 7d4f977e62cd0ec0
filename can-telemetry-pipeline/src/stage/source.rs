//! Generator stage that runs a [`Source`] into a connector

use super::{Source, Stage, StageStats, StatsSnapshot};
use crate::cancel::CancellationToken;
use crate::connector::{Connector, EnqueueError};
use crate::types::Result;
use std::sync::Arc;
use std::time::Duration;

/// Pause after a failed poll so a broken source does not spin
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Stage with no input connector, always single-worker
pub struct SourceStage<S: Source> {
    name: String,
    source: S,
    output: Arc<Connector<S::Out>>,
    stats: StageStats,
}

impl<S: Source> SourceStage<S> {
    pub fn new(name: impl Into<String>, source: S, output: Arc<Connector<S::Out>>) -> Self {
        Self {
            name: name.into(),
            source,
            output,
            stats: StageStats::default(),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl<S: Source> Stage for SourceStage<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self) -> Result<()> {
        self.source.init()
    }

    fn run(&mut self, cancel: &CancellationToken) {
        log::info!("[{}] running", self.name);

        while !cancel.is_cancelled() {
            let item = match self.source.poll() {
                Ok(Some(item)) => item,
                Ok(None) => continue,
                Err(e) => {
                    self.stats.record_dropped();
                    log::warn!("[{}] poll failed: {}", self.name, e);
                    cancel.wait_timeout(ERROR_BACKOFF);
                    continue;
                }
            };
            self.stats.record_received();

            match self.output.enqueue(item, cancel) {
                Ok(()) => self.stats.record_emitted(),
                Err(EnqueueError::Full(_)) => {
                    self.stats.record_dropped();
                    log::warn!("[{}] output connector full, dropping item", self.name);
                }
                Err(EnqueueError::Closed(_)) | Err(EnqueueError::Cancelled(_)) => break,
            }
        }

        self.output.close();
    }

    fn close(&mut self) {
        self.source.close();
        let stats = self.stats.snapshot();
        log::info!(
            "[{}] closed: received={} emitted={} dropped={}",
            self.name,
            stats.received,
            stats.emitted,
            stats.dropped
        );
    }
}
