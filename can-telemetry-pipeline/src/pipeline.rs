//! Pipeline orchestration
//!
//! The pipeline owns every stage, initialises them in insertion order, runs each on its
//! own thread and closes all of them on teardown.

use crate::cancel::CancellationToken;
use crate::stage::Stage;
use crate::types::{Result, TelemetryError};

/// Ordered collection of stages sharing one cancellation token
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
    initialized: bool,
    closed: bool,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage; stages are initialised in the order they are added
    pub fn add_stage<S: Stage + 'static>(&mut self, stage: S) {
        self.stages.push(Box::new(stage));
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Initialise every stage. The first failure closes all stages and is returned.
    pub fn init(&mut self) -> Result<()> {
        let mut failure = None;
        for stage in self.stages.iter_mut() {
            log::debug!("Initializing stage '{}'", stage.name());
            if let Err(e) = stage.init() {
                failure = Some((stage.name().to_string(), e));
                break;
            }
        }

        if let Some((name, e)) = failure {
            log::error!("Stage '{}' failed to initialize: {}", name, e);
            self.close();
            return Err(TelemetryError::StageInit {
                stage: name,
                source: Box::new(e),
            });
        }

        self.initialized = true;
        log::info!("Pipeline initialized with {} stage(s)", self.stages.len());
        Ok(())
    }

    /// Run all stages until they finish or `cancel` fires. Blocks the caller.
    pub fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        if !self.initialized || self.closed {
            return Err(TelemetryError::InvalidConfig(
                "pipeline must be initialized before it runs".to_string(),
            ));
        }

        std::thread::scope(|scope| {
            for stage in self.stages.iter_mut() {
                let name = stage.name().to_string();
                let spawned = std::thread::Builder::new()
                    .name(name.clone())
                    .spawn_scoped(scope, move || stage.run(cancel));
                if let Err(e) = spawned {
                    log::error!("Failed to spawn thread for stage '{}': {}", name, e);
                    cancel.cancel();
                }
            }
        });

        log::info!("Pipeline stopped");
        Ok(())
    }

    /// Close every stage. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        for stage in self.stages.iter_mut() {
            stage.close();
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.close();
    }
}
