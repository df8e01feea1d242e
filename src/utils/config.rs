// src/utils/config.rs
//! Engine configuration
//!
//! Layered with the `config` crate:
//!
//! 1. Built-in defaults
//! 2. Optional `config/arena.{toml,yaml,json}` file
//! 3. Environment variables, e.g. `ARENA__SANDBOX__THREAD_CAP=8`

use crate::utils::errors::{EngineError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-agent sandbox limits
    pub sandbox: SandboxSettings,

    /// Turn scheduler settings
    pub scheduler: SchedulerSettings,

    /// Logging output
    pub logging: LoggingConfig,

    /// Prometheus exporter
    pub metrics: MetricsConfig,
}

/// Default permission-domain limits applied to every agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Maximum live threads per agent, primary thread included
    pub thread_cap: usize,

    /// Filesystem byte quota for the agent's writable directory
    pub byte_quota: u64,

    /// Captured console output per agent, in bytes
    pub console_quota: usize,

    /// Registered output handles an agent may hold open at once
    pub max_open_files: usize,

    /// Pending events an agent may have queued
    pub event_queue_capacity: usize,

    /// Where agents' data directories are created; none disables agent writes
    pub data_root: Option<PathBuf>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            thread_cap: 5,
            byte_quota: 200_000,
            console_quota: 100_000,
            max_open_files: 5,
            event_queue_capacity: 256,
            data_root: None,
        }
    }
}

/// Turn scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Rounds per battle
    pub rounds: u32,

    /// Turn limit per round (the world may end a round earlier)
    pub max_turns_per_round: u64,

    /// Consecutive skipped turns tolerated before an agent is disqualified
    pub max_skipped_turns: u32,

    /// Turns a stopped agent may stay alive before it is forcibly stopped
    pub undead_grace_turns: u32,

    /// Budget multiplier applied to the first turn of a round
    pub first_turn_multiplier: u32,

    /// Fixed per-turn budget; when unset the budget is calibrated at start-up
    pub turn_budget_ms: Option<u64>,

    /// How long teardown waits for each agent thread to exit voluntarily
    pub stop_wait_ms: u64,

    /// Seed for the per-turn wake order
    pub seed: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            rounds: 1,
            max_turns_per_round: 10_000,
            max_skipped_turns: 30,
            undead_grace_turns: 3,
            first_turn_multiplier: 10,
            turn_budget_ms: None,
            stop_wait_ms: 1_000,
            seed: 0,
        }
    }
}

impl SchedulerSettings {
    pub fn stop_wait(&self) -> Duration {
        Duration::from_millis(self.stop_wait_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "arena_engine=info".to_string(),
            json: false,
        }
    }
}

/// Metrics exporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Install the Prometheus exporter
    pub enabled: bool,

    /// Listen address for the scrape endpoint
    pub listen: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: "127.0.0.1:9464".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        Self::load_from("config/arena")
    }

    /// Load configuration using `base` as the file stem
    pub fn load_from(base: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(base).required(false))
            .add_source(
                Environment::with_prefix("ARENA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: EngineConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.sandbox.thread_cap == 0 {
            return Err(EngineError::ConfigError(
                "thread cap must allow the primary thread".into(),
            ));
        }
        if self.sandbox.max_open_files == 0 {
            return Err(EngineError::ConfigError(
                "max open files cannot be 0".into(),
            ));
        }
        if self.sandbox.event_queue_capacity == 0 {
            return Err(EngineError::ConfigError(
                "event queue capacity cannot be 0".into(),
            ));
        }
        if self.scheduler.rounds == 0 {
            return Err(EngineError::ConfigError("rounds cannot be 0".into()));
        }
        if self.scheduler.max_turns_per_round == 0 {
            return Err(EngineError::ConfigError(
                "max turns per round cannot be 0".into(),
            ));
        }
        if self.scheduler.first_turn_multiplier == 0 {
            return Err(EngineError::ConfigError(
                "first turn multiplier cannot be 0".into(),
            ));
        }
        if let Some(0) = self.scheduler.turn_budget_ms {
            return Err(EngineError::ConfigError(
                "turn budget cannot be 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.sandbox.thread_cap, 5);
        assert_eq!(config.sandbox.byte_quota, 200_000);
        assert_eq!(config.scheduler.max_skipped_turns, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = EngineConfig::default();
        config.sandbox.thread_cap = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.scheduler.turn_budget_ms = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arena.toml");
        std::fs::write(
            &path,
            "[sandbox]\nthread_cap = 3\n\n[scheduler]\nrounds = 4\n",
        )
        .unwrap();

        let base = dir.path().join("arena");
        let config = EngineConfig::load_from(base.to_str().unwrap()).unwrap();
        assert_eq!(config.sandbox.thread_cap, 3);
        assert_eq!(config.scheduler.rounds, 4);
        // Untouched values keep their defaults
        assert_eq!(config.sandbox.byte_quota, 200_000);
    }
}
