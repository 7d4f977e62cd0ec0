//! Stage configuration types
//!
//! This module defines the configuration the library needs to build stages. Loading
//! it from files or the environment is left to the application layer.

use crate::types::{Result, TelemetryError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// How a stage schedules its handler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunningMode {
    /// One worker, items processed strictly in arrival order
    #[default]
    Single,
    /// Several workers sharing the input connector, order not preserved
    Pool,
}

impl FromStr for RunningMode {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(RunningMode::Single),
            "pool" => Ok(RunningMode::Pool),
            other => Err(TelemetryError::InvalidConfig(format!(
                "unknown running mode '{}' (expected 'single' or 'pool')",
                other
            ))),
        }
    }
}

/// Worker pool sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of concurrent workers
    #[serde(default = "default_workers")]
    pub max_workers: usize,

    /// Target queue depth per worker, used to size the input connector
    #[serde(default = "default_queue_depth")]
    pub queue_depth_per_worker: usize,
}

pub(crate) fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_queue_depth() -> usize {
    64
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_workers(),
            queue_depth_per_worker: default_queue_depth(),
        }
    }
}

impl PoolConfig {
    /// Input capacity the pool wants to keep every worker busy
    pub fn target_capacity(&self) -> usize {
        self.max_workers.saturating_mul(self.queue_depth_per_worker)
    }
}

/// Configuration shared by every stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Name used in logs
    pub name: String,

    #[serde(default)]
    pub running_mode: RunningMode,

    #[serde(default)]
    pub pool: PoolConfig,
}

impl StageConfig {
    /// Create a single-worker stage configuration
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            running_mode: RunningMode::Single,
            pool: PoolConfig::default(),
        }
    }

    /// Builder method: set the running mode
    pub fn with_running_mode(mut self, mode: RunningMode) -> Self {
        self.running_mode = mode;
        self
    }

    /// Builder method: switch to pool mode with the given sizing
    pub fn with_pool(mut self, max_workers: usize, queue_depth_per_worker: usize) -> Self {
        self.running_mode = RunningMode::Pool;
        self.pool = PoolConfig {
            max_workers,
            queue_depth_per_worker,
        };
        self
    }

    /// Number of worker threads the stage will spawn
    pub fn worker_count(&self) -> usize {
        match self.running_mode {
            RunningMode::Single => 1,
            RunningMode::Pool => self.pool.max_workers,
        }
    }

    /// Check the configuration is runnable
    pub fn validate(&self) -> Result<()> {
        if self.running_mode == RunningMode::Pool && self.pool.max_workers == 0 {
            return Err(TelemetryError::InvalidConfig(format!(
                "stage '{}' requests a pool with zero workers",
                self.name
            )));
        }
        Ok(())
    }
}

/// Configuration of the reorder stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorderConfig {
    /// Stage settings; the running mode must stay `Single`
    pub stage: StageConfig,

    /// How long the stage waits for a missing sequence number before giving up on it
    pub reset_timeout: Duration,

    /// Largest forward distance from the expected sequence number that is buffered
    pub window: u8,

    /// Sequence number expected first; `None` synchronises on the first arrival
    pub initial_sequence: Option<u8>,
}

impl Default for ReorderConfig {
    fn default() -> Self {
        Self {
            stage: StageConfig::new("reorder"),
            reset_timeout: Duration::from_millis(100),
            window: 64,
            initial_sequence: None,
        }
    }
}

impl ReorderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: set the stall reset timeout
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Builder method: set the disorder window
    pub fn with_window(mut self, window: u8) -> Self {
        self.window = window;
        self
    }

    /// Builder method: expect this sequence number first
    pub fn with_initial_sequence(mut self, sequence: u8) -> Self {
        self.initial_sequence = Some(sequence);
        self
    }

    /// Reordering is sequential; pool mode and degenerate windows are rejected
    pub fn validate(&self) -> Result<()> {
        if self.stage.running_mode == RunningMode::Pool {
            return Err(TelemetryError::InvalidConfig(format!(
                "stage '{}' reorders messages and cannot run in pool mode",
                self.stage.name
            )));
        }
        if self.window == 0 || self.window > 128 {
            return Err(TelemetryError::InvalidConfig(format!(
                "reorder window must be within 1..=128, got {}",
                self.window
            )));
        }
        if self.reset_timeout.is_zero() {
            return Err(TelemetryError::InvalidConfig(
                "reorder reset timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_mode_from_str() {
        assert_eq!("Pool".parse::<RunningMode>().unwrap(), RunningMode::Pool);
        assert_eq!(" single ".parse::<RunningMode>().unwrap(), RunningMode::Single);
        assert!("parallel".parse::<RunningMode>().is_err());
    }

    #[test]
    fn test_stage_config_builder() {
        let config = StageConfig::new("decoder").with_pool(4, 32);

        assert_eq!(config.running_mode, RunningMode::Pool);
        assert_eq!(config.worker_count(), 4);
        assert_eq!(config.pool.target_capacity(), 128);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_single_mode_has_one_worker() {
        let config = StageConfig::new("codec");
        assert_eq!(config.worker_count(), 1);
    }

    #[test]
    fn test_zero_worker_pool_rejected() {
        let config = StageConfig::new("decoder").with_pool(0, 64);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reorder_rejects_pool_mode() {
        let mut config = ReorderConfig::new();
        assert!(config.validate().is_ok());

        config.stage = config.stage.with_running_mode(RunningMode::Pool);
        assert!(matches!(
            config.validate(),
            Err(TelemetryError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_reorder_window_bounds() {
        assert!(ReorderConfig::new().with_window(0).validate().is_err());
        assert!(ReorderConfig::new().with_window(129).validate().is_err());
        assert!(ReorderConfig::new().with_window(128).validate().is_ok());
    }
}
