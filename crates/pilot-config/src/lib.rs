//! # pilot-config
//!
//! Configuration management for pilot shadow execution.
//!
//! Loads configuration from:
//! 1. `~/.pilot/config.toml` (global)
//! 2. `.pilot/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod path;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only snapshot)
pub fn config() -> Config {
    CONFIG
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub fs: FsConfig,
    pub coordination: CoordinationConfig,
    pub pilot: PilotConfig,
    pub spin: SpinConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Global config (~/.pilot/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                config = Self::from_file(&global_path)?;
            }
        }

        // 2. Project config (.pilot/config.toml) - overrides global
        let project_path = Path::new(".pilot/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            let project_config = Self::from_file(project_path)?;
            config.merge(project_config);
        }

        // 3. Environment variable overrides
        config.apply_env_overrides();

        Ok(config)
    }

    /// Parse a single config file without applying overrides
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: ~/.pilot/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".pilot/config.toml"))
    }

    /// Merge a project config over this one.
    ///
    /// Only fields that differ from the defaults replace the current value.
    pub fn merge(&mut self, other: Config) {
        let defaults = Config::default();

        if other.fs.shadow_root != defaults.fs.shadow_root {
            self.fs.shadow_root = other.fs.shadow_root;
        }
        if other.fs.log_root != defaults.fs.log_root {
            self.fs.log_root = other.fs.log_root;
        }
        if other.coordination.address != defaults.coordination.address {
            self.coordination.address = other.coordination.address;
        }
        if other.coordination.pilot_path != defaults.coordination.pilot_path {
            self.coordination.pilot_path = other.coordination.pilot_path;
        }
        if other.coordination.result_path != defaults.coordination.result_path {
            self.coordination.result_path = other.coordination.result_path;
        }
        if other.coordination.host_identifier.is_some() {
            self.coordination.host_identifier = other.coordination.host_identifier;
        }
        if other.pilot.wait_timeout_secs != defaults.pilot.wait_timeout_secs {
            self.pilot.wait_timeout_secs = other.pilot.wait_timeout_secs;
        }
        if other.pilot.poll_interval_ms != defaults.pilot.poll_interval_ms {
            self.pilot.poll_interval_ms = other.pilot.poll_interval_ms;
        }
        if other.pilot.interrupt_grace_ms != defaults.pilot.interrupt_grace_ms {
            self.pilot.interrupt_grace_ms = other.pilot.interrupt_grace_ms;
        }
        if other.pilot.id_allocation_retries != defaults.pilot.id_allocation_retries {
            self.pilot.id_allocation_retries = other.pilot.id_allocation_retries;
        }
        if other.spin.park_after_snoozes != defaults.spin.park_after_snoozes {
            self.spin.park_after_snoozes = other.spin.park_after_snoozes;
        }
        if other.spin.park_micros != defaults.spin.park_micros {
            self.spin.park_micros = other.spin.park_micros;
        }
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("PILOT_SHADOW_ROOT") {
            self.fs.shadow_root = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("PILOT_LOG_ROOT") {
            self.fs.log_root = PathBuf::from(path);
        }
        if let Ok(address) = std::env::var("PILOT_COORDINATOR") {
            self.coordination.address = address;
        }
        if let Ok(secs) = std::env::var("PILOT_WAIT_TIMEOUT_SECS") {
            if let Ok(n) = secs.parse() {
                self.pilot.wait_timeout_secs = n;
            }
        }
        if let Ok(host) = std::env::var("PILOT_HOST_ID") {
            if !host.is_empty() {
                self.coordination.host_identifier = Some(host);
            }
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

fn pilot_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".pilot")
}

/// Shadow filesystem layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Root that mirrors the original tree for shadow copies
    pub shadow_root: PathBuf,
    /// Root that mirrors the original tree for `<name>.log` append logs
    pub log_root: PathBuf,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            shadow_root: pilot_home().join("shadow"),
            log_root: pilot_home().join("append_log"),
        }
    }
}

/// Coordination service settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Service address (host:port)
    pub address: String,
    /// Parent node of every pilot node
    pub pilot_path: String,
    /// Parent node of pilot failure markers
    pub result_path: String,
    /// Overrides the detected host name in thread node names
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_identifier: Option<String>,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            address: "node0:2181".to_string(),
            pilot_path: "/pilot".to_string(),
            result_path: "/pilot_result".to_string(),
            host_identifier: None,
        }
    }
}

/// Pilot lifecycle timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PilotConfig {
    pub wait_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// How long cleanup waits for interrupted threads to notice
    pub interrupt_grace_ms: u64,
    pub id_allocation_retries: u32,
}

impl Default for PilotConfig {
    fn default() -> Self {
        Self {
            wait_timeout_secs: 300,
            poll_interval_ms: 100,
            interrupt_grace_ms: 100,
            id_allocation_retries: 10,
        }
    }
}

impl PilotConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_millis(self.interrupt_grace_ms)
    }
}

/// Ticket wait loop tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpinConfig {
    /// Fall back to timed parking once the backoff is exhausted
    pub park_after_snoozes: bool,
    pub park_micros: u64,
}

impl Default for SpinConfig {
    fn default() -> Self {
        Self {
            park_after_snoozes: true,
            park_micros: 50,
        }
    }
}
