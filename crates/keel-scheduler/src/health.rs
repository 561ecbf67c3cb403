//! Heartbeat-derived node health.
//!
//! Health is computed at read time from `last_heartbeat` and is never written
//! back to storage. A heartbeat and a concurrent health read therefore never
//! race over a stored flag.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::config::HealthConfig;
use crate::error::{Result, SchedulerError};

/// Derived node health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeHealth {
    /// Heartbeated within the threshold; eligible for new work.
    Healthy,
    /// Heartbeat is older than the threshold.
    Unhealthy,
}

impl NodeHealth {
    /// Returns true if the node may be offered new work.
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Get the health as a static string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies nodes by heartbeat age.
#[derive(Debug, Clone, Copy)]
pub struct HealthEvaluator {
    threshold: Duration,
    threshold_delta: TimeDelta,
}

impl HealthEvaluator {
    /// Creates an evaluator from configuration.
    pub fn new(config: &HealthConfig) -> Result<Self> {
        config.validate()?;
        let threshold_delta = TimeDelta::from_std(config.threshold).map_err(|e| {
            SchedulerError::Config(format!("health threshold out of range: {e}"))
        })?;

        Ok(Self {
            threshold: config.threshold,
            threshold_delta,
        })
    }

    /// Returns the configured threshold.
    #[must_use]
    pub const fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Oldest heartbeat time that still counts as healthy at `now`.
    #[must_use]
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.threshold_delta
    }

    /// Age of a heartbeat at `now`. Heartbeats from the future count as fresh.
    #[must_use]
    pub fn heartbeat_age(last_heartbeat: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        (now - last_heartbeat).to_std().unwrap_or(Duration::ZERO)
    }

    /// Derives health for a heartbeat observed at `last_heartbeat`.
    #[must_use]
    pub fn evaluate(&self, last_heartbeat: DateTime<Utc>, now: DateTime<Utc>) -> NodeHealth {
        if Self::heartbeat_age(last_heartbeat, now) <= self.threshold {
            NodeHealth::Healthy
        } else {
            NodeHealth::Unhealthy
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn evaluator(threshold_secs: u64) -> HealthEvaluator {
        HealthEvaluator::new(&HealthConfig::with_threshold(Duration::from_secs(
            threshold_secs,
        )))
        .unwrap()
    }

    #[test]
    fn threshold_boundary() {
        let evaluator = evaluator(30);
        let now = Utc::now();

        assert_eq!(
            evaluator.evaluate(now - TimeDelta::seconds(29), now),
            NodeHealth::Healthy
        );
        assert_eq!(
            evaluator.evaluate(now - TimeDelta::seconds(30), now),
            NodeHealth::Healthy
        );
        assert_eq!(
            evaluator.evaluate(now - TimeDelta::seconds(31), now),
            NodeHealth::Unhealthy
        );
    }

    #[test]
    fn future_heartbeat_is_fresh() {
        let evaluator = evaluator(30);
        let now = Utc::now();

        let skewed = now + TimeDelta::seconds(5);
        assert_eq!(HealthEvaluator::heartbeat_age(skewed, now), Duration::ZERO);
        assert!(evaluator.evaluate(skewed, now).is_healthy());
    }

    #[test]
    fn zero_interval_config_rejected() {
        let config = HealthConfig {
            heartbeat_interval: Duration::ZERO,
            ..HealthConfig::default()
        };
        assert!(matches!(
            HealthEvaluator::new(&config),
            Err(SchedulerError::Config(_))
        ));
    }

    #[test]
    fn cutoff_is_threshold_before_now() {
        let evaluator = evaluator(30);
        let now = Utc::now();
        assert_eq!(evaluator.cutoff(now), now - TimeDelta::seconds(30));
    }
}
