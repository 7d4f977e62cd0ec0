//! Configuration loading and parsing
//!
//! Settings are layered: built-in defaults, then the TOML file, then environment
//! variables.

use anyhow::{bail, Context, Result};
use can_telemetry_pipeline::{ReorderConfig, RunningMode, StageConfig};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Used when neither `--config` nor `CONFIG_PATH` is given
pub const DEFAULT_CONFIG_PATH: &str = "/app/config/config.toml";

/// Main application configuration (loaded from config.toml)
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    /// Capacity of every connector between stages
    pub connector_size: usize,
    pub udp: UdpConfig,
    pub cannelloni: StageSettings,
    pub rob: RobConfig,
    pub can: CanConfig,
    pub rows: StageSettings,
    pub sink: SinkConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct UdpConfig {
    pub ip_addr: String,
    pub port: u16,
}

/// Scheduling settings shared by the pooled stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StageSettings {
    pub running_mode: RunningMode,
    pub max_workers: usize,
    pub target_queue_depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RobConfig {
    pub reset_timeout_ms: u64,
    pub window: u8,
    pub running_mode: RunningMode,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CanConfig {
    #[serde(flatten)]
    pub stage: StageSettings,
    pub dbc_file_path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SinkConfig {
    #[serde(flatten)]
    pub stage: StageSettings,
    /// JSON lines output file; stdout when unset
    pub output_path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service_name: "sc-telemetry".to_string(),
            connector_size: 2048,
            udp: UdpConfig::default(),
            cannelloni: StageSettings::default(),
            rob: RobConfig::default(),
            can: CanConfig::default(),
            rows: StageSettings::default(),
            sink: SinkConfig::default(),
        }
    }
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            ip_addr: "127.0.0.1".to_string(),
            port: 20_000,
        }
    }
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            running_mode: RunningMode::Pool,
            max_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            target_queue_depth: 64,
        }
    }
}

impl Default for RobConfig {
    fn default() -> Self {
        Self {
            reset_timeout_ms: 100,
            window: 64,
            running_mode: RunningMode::Single,
        }
    }
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            stage: StageSettings::default(),
            dbc_file_path: PathBuf::from("/app/can/bus.dbc"),
        }
    }
}

impl StageSettings {
    /// Library stage configuration under `name`
    pub fn to_stage_config(&self, name: &str) -> StageConfig {
        match self.running_mode {
            RunningMode::Single => StageConfig::new(name),
            RunningMode::Pool => StageConfig::new(name).with_pool(self.max_workers, self.target_queue_depth),
        }
    }

    fn apply_env(&mut self, prefix: &str, lookup: &impl Fn(&str) -> Option<String>) -> Result<()> {
        env_override(lookup, &format!("{prefix}RUNNING_MODE"), &mut self.running_mode)?;
        env_override(lookup, &format!("{prefix}MAX_WORKERS"), &mut self.max_workers)?;
        env_override(lookup, &format!("{prefix}TARGET_QUEUE_DEPTH"), &mut self.target_queue_depth)?;
        Ok(())
    }
}

/// Replace `target` with the parsed value of `key` when it is set
fn env_override<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: Display,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid value '{}' for {}", raw, key))?;
        log::debug!("{} overridden from environment", key);
    }
    Ok(())
}

impl AppConfig {
    /// Load defaults, the config file and the process environment
    ///
    /// An explicit `path` must exist; otherwise `CONFIG_PATH` or the default location
    /// is tried and a missing file is only logged.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => load_config(path)?,
            None => {
                let path = std::env::var("CONFIG_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
                if path.exists() {
                    load_config(&path)?
                } else {
                    log::info!("Config file {:?} does not exist, using defaults", path);
                    AppConfig::default()
                }
            }
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides read through `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        env_override(&lookup, "SERVICE_NAME", &mut self.service_name)?;
        env_override(&lookup, "CONNECTOR_SIZE", &mut self.connector_size)?;
        env_override(&lookup, "UDP_IP_ADDR", &mut self.udp.ip_addr)?;
        env_override(&lookup, "UDP_PORT", &mut self.udp.port)?;
        self.cannelloni.apply_env("CANNELLONI_", &lookup)?;
        env_override(&lookup, "ROB_RESET_TIMEOUT_MS", &mut self.rob.reset_timeout_ms)?;
        env_override(&lookup, "ROB_WINDOW", &mut self.rob.window)?;
        env_override(&lookup, "ROB_RUNNING_MODE", &mut self.rob.running_mode)?;
        self.can.stage.apply_env("CAN_", &lookup)?;
        env_override(&lookup, "CAN_DBC_FILE_PATH", &mut self.can.dbc_file_path)?;
        self.rows.apply_env("ROWS_", &lookup)?;
        self.sink.stage.apply_env("SINK_", &lookup)?;
        if let Some(path) = lookup("SINK_OUTPUT_PATH") {
            self.sink.output_path = if path.is_empty() { None } else { Some(PathBuf::from(path)) };
        }
        Ok(())
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.connector_size == 0 {
            bail!("connector_size must be at least 1");
        }

        let stages = [
            ("cannelloni", &self.cannelloni),
            ("can", &self.can.stage),
            ("rows", &self.rows),
            ("sink", &self.sink.stage),
        ];
        for (name, settings) in stages {
            if settings.max_workers == 0 {
                bail!("stage '{}' must have at least one worker", name);
            }
            settings.to_stage_config(name).validate()?;
        }

        self.reorder_config()
            .validate()
            .context("Invalid reorder stage configuration")?;
        self.udp_addr()?;
        Ok(())
    }

    /// Address the UDP ingress binds to
    pub fn udp_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .udp
            .ip_addr
            .parse()
            .with_context(|| format!("Invalid UDP address '{}'", self.udp.ip_addr))?;
        Ok(SocketAddr::new(ip, self.udp.port))
    }

    /// Reorder stage configuration
    pub fn reorder_config(&self) -> ReorderConfig {
        let mut config = ReorderConfig::new()
            .with_reset_timeout(Duration::from_millis(self.rob.reset_timeout_ms))
            .with_window(self.rob.window);
        config.stage.running_mode = self.rob.running_mode;
        config
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    log::info!("Configuration loaded from {:?}", path);
    Ok(config)
}
