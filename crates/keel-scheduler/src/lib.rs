//! Keel scheduler - node registration and heartbeat-derived health.
//!
//! The scheduler is responsible for:
//!
//! - **Node registration**: upserting node identity, address and capacity
//! - **Heartbeats**: recording liveness and reported load per node
//! - **Eligibility**: listing nodes healthy enough to be offered new work
//! - **Placement**: picking the healthy node with the most spare capacity
//!
//! # Health model
//!
//! Health is a function of heartbeat age and nothing else. It is computed on
//! every read and never persisted, so there is no background sweeper whose
//! stale flag could race a concurrent heartbeat:
//!
//! ```text
//! age = now - last_heartbeat
//! age <= threshold  ──▶ Healthy
//! age >  threshold  ──▶ Unhealthy
//! ```
//!
//! An unhealthy node keeps whatever work it already claimed; it is only
//! excluded from new work until it heartbeats again.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use keel_scheduler::{HealthConfig, MemoryNodeStore, NodeDescriptor, NodeRegistry};
//!
//! let registry = NodeRegistry::new(Arc::new(MemoryNodeStore::new()), &HealthConfig::default())?;
//! let id = registry.register(NodeDescriptor::new("node-a", "10.0.0.1:7000")).await?;
//! let eligible = registry.list_healthy().await?;
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod health;
pub mod heartbeat;
pub mod registry;
pub mod store;

// Re-export main types
pub use config::HealthConfig;
pub use error::{Result, SchedulerError};
pub use health::{HealthEvaluator, NodeHealth};
pub use heartbeat::{HeartbeatTask, MetricsSource};
pub use registry::{
    HeartbeatMetrics, NodeCapacity, NodeDescriptor, NodeDetails, NodeId, NodeRecord, NodeRegistry,
};
pub use store::{MemoryNodeStore, NodeStore, PostgresNodeStore};
