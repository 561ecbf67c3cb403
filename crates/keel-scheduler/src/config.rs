//! Configuration types for the scheduler.

use serde::Deserialize;
use std::time::Duration;

use crate::error::{Result, SchedulerError};

/// Health evaluation configuration.
///
/// Node health is never stored; it is derived on every read by comparing the
/// age of the last heartbeat against `threshold`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Maximum heartbeat age for a node to count as healthy.
    #[serde(rename = "threshold_secs", with = "serde_duration_secs")]
    pub threshold: Duration,
    /// How often a worker heartbeats its own node.
    #[serde(rename = "heartbeat_interval_secs", with = "serde_duration_secs")]
    pub heartbeat_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            threshold: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

impl HealthConfig {
    /// Creates a health configuration with the given threshold.
    #[must_use]
    pub fn with_threshold(threshold: Duration) -> Self {
        Self {
            threshold,
            ..Self::default()
        }
    }

    /// Rejects settings the registry and heartbeat loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.threshold.is_zero() {
            return Err(SchedulerError::Config(
                "health threshold must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(SchedulerError::Config(
                "heartbeat interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serde helper for Duration as seconds.
mod serde_duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
