//! Common test utilities for scheduler integration tests.

#![allow(dead_code)]

pub mod fixtures;

use keel_scheduler::{HealthConfig, MemoryNodeStore, NodeRegistry, NodeStore};
use std::sync::Arc;
use std::time::Duration;

/// Registry wired to an in-memory store.
pub struct TestScheduler {
    pub store: Arc<MemoryNodeStore>,
    pub registry: Arc<NodeRegistry>,
}

impl TestScheduler {
    /// Creates a test scheduler with the default 30s threshold.
    pub fn new() -> Self {
        Self::with_config(HealthConfig::default())
    }

    /// Creates a test scheduler with custom health configuration.
    pub fn with_config(config: HealthConfig) -> Self {
        let store = Arc::new(MemoryNodeStore::new());
        let registry = Arc::new(
            NodeRegistry::new(Arc::clone(&store) as Arc<dyn NodeStore>, &config)
                .expect("valid health config"),
        );

        Self { store, registry }
    }

    /// Creates a test scheduler with a short threshold for time-sensitive tests.
    pub fn with_fast_health_checks() -> Self {
        Self::with_config(HealthConfig {
            threshold: Duration::from_millis(200),
            heartbeat_interval: Duration::from_millis(50),
        })
    }
}

impl Default for TestScheduler {
    fn default() -> Self {
        Self::new()
    }
}
