//! Generic stage that runs a [`Handler`] between two connectors

use super::{Handler, Stage, StageStats, StatsSnapshot};
use crate::cancel::CancellationToken;
use crate::config::{RunningMode, StageConfig};
use crate::connector::{Connector, DequeueError, EnqueueError};
use crate::types::Result;
use std::sync::Arc;

/// Stage reading from one connector and, unless it is a sink, writing to another
pub struct ProcessorStage<H: Handler> {
    config: StageConfig,
    handler: H,
    input: Arc<Connector<H::In>>,
    output: Option<Arc<Connector<H::Out>>>,
    stats: StageStats,
}

impl<H: Handler> ProcessorStage<H> {
    /// Create a stage that forwards handler output to `output`
    pub fn new(
        handler: H,
        input: Arc<Connector<H::In>>,
        output: Arc<Connector<H::Out>>,
        config: StageConfig,
    ) -> Self {
        Self {
            config,
            handler,
            input,
            output: Some(output),
            stats: StageStats::default(),
        }
    }

    /// Create a terminal stage; handler output is discarded
    pub fn sink(handler: H, input: Arc<Connector<H::In>>, config: StageConfig) -> Self {
        Self {
            config,
            handler,
            input,
            output: None,
            stats: StageStats::default(),
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn worker_loop(&self, worker: usize, cancel: &CancellationToken) {
        log::trace!("[{}] worker {} started", self.config.name, worker);

        while !cancel.is_cancelled() {
            let item = match self.input.dequeue(cancel) {
                Ok(item) => item,
                Err(DequeueError::Closed) => {
                    log::debug!("[{}] worker {} input closed", self.config.name, worker);
                    break;
                }
                Err(_) => break,
            };
            self.stats.record_received();

            match self.handler.handle(item) {
                Ok(Some(out)) => {
                    if !self.emit(out, cancel) {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    self.stats.record_dropped();
                    log::warn!("[{}] dropping item: {}", self.config.name, e);
                }
            }
        }

        log::trace!("[{}] worker {} stopped", self.config.name, worker);
    }

    /// Returns false when the worker should stop
    fn emit(&self, out: H::Out, cancel: &CancellationToken) -> bool {
        let Some(output) = &self.output else {
            self.stats.record_emitted();
            return true;
        };

        match output.enqueue(out, cancel) {
            Ok(()) => {
                self.stats.record_emitted();
                true
            }
            Err(EnqueueError::Full(_)) => {
                self.stats.record_dropped();
                log::warn!("[{}] output connector full, dropping item", self.config.name);
                true
            }
            Err(EnqueueError::Closed(_)) => {
                self.stats.record_dropped();
                log::warn!("[{}] output connector closed, stopping", self.config.name);
                false
            }
            Err(EnqueueError::Cancelled(_)) => false,
        }
    }
}

impl<H: Handler> Stage for ProcessorStage<H> {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn running_mode(&self) -> RunningMode {
        self.config.running_mode
    }

    fn init(&mut self) -> Result<()> {
        self.config.validate()?;

        if self.config.running_mode == RunningMode::Pool {
            let target = self.config.pool.target_capacity();
            if self.input.capacity() < target {
                log::warn!(
                    "[{}] input capacity {} is below the pool target of {} ({} workers x {} queue depth)",
                    self.config.name,
                    self.input.capacity(),
                    target,
                    self.config.pool.max_workers,
                    self.config.pool.queue_depth_per_worker
                );
            }
        }

        self.handler.init()
    }

    fn run(&mut self, cancel: &CancellationToken) {
        let workers = self.config.worker_count().max(1);
        log::info!("[{}] running with {} worker(s)", self.config.name, workers);

        let this = &*self;
        std::thread::scope(|scope| {
            for worker in 1..workers {
                scope.spawn(move || this.worker_loop(worker, cancel));
            }
            this.worker_loop(0, cancel);
        });

        if let Some(output) = &self.output {
            output.close();
        }
    }

    fn close(&mut self) {
        self.handler.close();
        let stats = self.stats.snapshot();
        log::info!(
            "[{}] closed: received={} emitted={} dropped={}",
            self.config.name,
            stats.received,
            stats.emitted,
            stats.dropped
        );
    }
}
