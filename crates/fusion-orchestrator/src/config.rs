use fusion_core::{FusionError, FusionResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Runtime knobs for the coordination engine. Every field has a default, so
/// an empty TOML document is a valid configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub router: RouterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Coarse timer fallback between event-triggered passes.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Window over which completions count toward an agent's load.
    #[serde(default = "default_load_window_secs")]
    pub load_window_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            load_window_secs: default_load_window_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retry ceiling for retryable tasks without their own override.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Agents silent for longer than this are reported stale.
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
        }
    }
}

fn default_tick_interval_ms() -> u64 {
    500
}
fn default_load_window_secs() -> u64 {
    300
}
fn default_max_retries() -> u32 {
    3
}
fn default_heartbeat_timeout_secs() -> u64 {
    30
}
fn default_history_limit() -> usize {
    1024
}

impl OrchestratorConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> FusionResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| FusionError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> FusionResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            FusionError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Reject values that would stall the scheduler or disable health reporting.
    pub fn validate(&self) -> FusionResult<()> {
        if self.scheduler.tick_interval_ms == 0 {
            return Err(FusionError::Config(
                "scheduler.tick_interval_ms must be greater than zero".into(),
            ));
        }
        if self.scheduler.load_window_secs == 0 {
            return Err(FusionError::Config(
                "scheduler.load_window_secs must be greater than zero".into(),
            ));
        }
        if self.health.heartbeat_timeout_secs == 0 {
            return Err(FusionError::Config(
                "health.heartbeat_timeout_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler.tick_interval_ms)
    }

    pub fn load_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.scheduler.load_window_secs).unwrap_or(i64::MAX))
    }

    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            i64::try_from(self.health.heartbeat_timeout_secs).unwrap_or(i64::MAX),
        )
    }
}
