// src/utils/config.rs
//! Engine configuration
//!
//! Configuration is layered with the `config` crate:
//!
//! 1. Built-in defaults ([`EngineConfig::default`])
//! 2. Optional file named by `OFFICE_CONFIG` (YAML, TOML or JSON)
//! 3. Environment variables prefixed with `OFFICE`, e.g.
//!    `OFFICE__TEAMS__POOL_SIZE=8`

use crate::observability::LogFormat;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "OFFICE_CONFIG";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub office: OfficeSettings,
    pub teams: TeamSettings,
    pub objects: ObjectSettings,
    pub logging: LoggingSettings,
}

/// Office lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfficeSettings {
    /// Bounded wait for live processes to drain on close (milliseconds)
    pub close_timeout_ms: u64,

    /// How many times an escalation may be re-handled by handler jobs
    pub max_escalation_depth: u32,
}

impl Default for OfficeSettings {
    fn default() -> Self {
        Self {
            close_timeout_ms: 5_000,
            max_escalation_depth: 8,
        }
    }
}

/// Defaults applied to teams that do not size themselves
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TeamSettings {
    /// Worker count for pool teams without an explicit size
    pub pool_size: usize,

    /// Idle time after which an elastic worker above the minimum retires (milliseconds)
    pub idle_timeout_ms: u64,

    /// Bounded wait for workers to exit on stop (milliseconds)
    pub stop_timeout_ms: u64,

    /// Dedicated lanes for affinity teams without an explicit count
    pub affinity_lanes: usize,
}

impl Default for TeamSettings {
    fn default() -> Self {
        Self {
            pool_size: 4,
            idle_timeout_ms: 30_000,
            stop_timeout_ms: 2_000,
            affinity_lanes: 1,
        }
    }
}

/// Managed object settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectSettings {
    /// Maximum wait to check out a pooled object (milliseconds)
    pub pool_acquire_timeout_ms: u64,

    /// Pool size for pooled objects without an explicit size
    pub default_pool_size: usize,
}

impl Default for ObjectSettings {
    fn default() -> Self {
        Self {
            pool_acquire_timeout_ms: 10_000,
            default_pool_size: 8,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub format: LogFormat,
}

impl EngineConfig {
    /// Load configuration from defaults, optional file and environment
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_FILE_ENV).ok();
        Self::build(file.as_deref().map(Path::new))
    }

    /// Load configuration from an explicit file, still honouring environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::build(Some(path.as_ref()))
    }

    fn build(file: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let loaded: EngineConfig = builder
            .add_source(
                config::Environment::with_prefix("OFFICE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject sizes and timeouts that would stall the engine
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.teams.pool_size == 0 {
            problems.push("teams.pool_size must be at least 1");
        }
        if self.teams.affinity_lanes == 0 {
            problems.push("teams.affinity_lanes must be at least 1");
        }
        if self.teams.stop_timeout_ms == 0 {
            problems.push("teams.stop_timeout_ms must be positive");
        }
        if self.teams.idle_timeout_ms == 0 {
            problems.push("teams.idle_timeout_ms must be positive");
        }
        if self.objects.pool_acquire_timeout_ms == 0 {
            problems.push("objects.pool_acquire_timeout_ms must be positive");
        }
        if self.objects.default_pool_size == 0 {
            problems.push("objects.default_pool_size must be at least 1");
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(EngineError::InvalidConfig(problems.join(", ")))
        }
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.office.close_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.teams.idle_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.teams.stop_timeout_ms)
    }

    pub fn pool_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.objects.pool_acquire_timeout_ms)
    }
}
