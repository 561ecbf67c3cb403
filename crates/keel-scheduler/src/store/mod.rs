//! Node storage backends.
//!
//! Every write here is a single-row upsert; health is never stored, so
//! heartbeats and health reads need no coordination beyond the store's own
//! row-level atomicity.

mod memory;
mod postgres;

pub use memory::MemoryNodeStore;
pub use postgres::PostgresNodeStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::registry::{HeartbeatMetrics, NodeId, NodeRecord};

/// Backend for storing node records.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Insert a node, or update an existing one in place.
    ///
    /// An existing node keeps its original `registered_at`.
    async fn upsert(&self, record: &NodeRecord) -> Result<()>;

    /// Record a heartbeat observed at `at`.
    ///
    /// Returns [`SchedulerError::NodeNotFound`](crate::SchedulerError::NodeNotFound)
    /// if the node was never registered.
    async fn heartbeat(&self, id: &NodeId, metrics: &HeartbeatMetrics, at: DateTime<Utc>)
        -> Result<()>;

    /// Get a node by ID.
    async fn get(&self, id: &NodeId) -> Result<Option<NodeRecord>>;

    /// List all nodes, ordered by ID.
    async fn list(&self) -> Result<Vec<NodeRecord>>;

    /// List nodes whose last heartbeat is at or after `cutoff`, ordered by ID.
    async fn list_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<NodeRecord>>;
}
