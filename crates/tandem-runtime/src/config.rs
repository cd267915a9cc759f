use std::time::Duration;

use serde::Deserialize;

use tandem_core::error::{Result, SagaError};

use crate::timer_driver::TimerDriverConfig;

/// Engine-level configuration, loadable from TOML.
///
/// ```toml
/// checkpoint_ttl = 86400
///
/// [timer]
/// poll_interval_ms = 500
/// batch_size = 50
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Timer driver settings.
    pub timer: TimerSection,
    /// Default TTL in seconds for live checkpoints.
    pub checkpoint_ttl: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TimerSection {
    pub poll_interval_ms: u64,
    pub batch_size: usize,
}

impl Default for TimerSection {
    fn default() -> Self {
        let defaults = TimerDriverConfig::default();
        Self {
            poll_interval_ms: defaults.poll_interval.as_millis() as u64,
            batch_size: defaults.batch_size,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timer: TimerSection::default(),
            checkpoint_ttl: None,
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document. Missing keys fall back to defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| SagaError::Serialization(e.to_string()))
    }

    /// The timer driver configuration described by this config.
    pub fn timer_driver_config(&self) -> TimerDriverConfig {
        TimerDriverConfig {
            poll_interval: Duration::from_millis(self.timer.poll_interval_ms),
            batch_size: self.timer.batch_size,
        }
    }
}
