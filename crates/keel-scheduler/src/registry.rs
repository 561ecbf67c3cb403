//! Node registry for tracking worker nodes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::error::{Result, SchedulerError};
use crate::health::{HealthEvaluator, NodeHealth};
use crate::store::NodeStore;

/// Unique node identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node ID from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique node ID using ULID.
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Declared node capacity and most recently reported load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCapacity {
    /// Maximum concurrent builds/deployments.
    pub max_concurrent: u32,
    /// Work currently running on the node.
    pub current_load: u32,
    /// Available CPU cores.
    pub cpu_available: f64,
    /// Available memory in MB.
    pub memory_available_mb: u64,
    /// Available disk in MB.
    pub disk_available_mb: u64,
}

impl NodeCapacity {
    /// Returns the utilisation as a fraction (0.0-1.0).
    #[must_use]
    pub fn utilisation(&self) -> f64 {
        if self.max_concurrent == 0 {
            return 0.0;
        }
        f64::from(self.current_load) / f64::from(self.max_concurrent)
    }

    /// Returns true if the node has room for more work.
    #[must_use]
    pub const fn has_capacity(&self) -> bool {
        self.current_load < self.max_concurrent
    }

    /// Number of additional concurrent jobs the node can take.
    #[must_use]
    pub const fn free_slots(&self) -> u32 {
        self.max_concurrent.saturating_sub(self.current_load)
    }
}

impl Default for NodeCapacity {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            current_load: 0,
            cpu_available: 0.0,
            memory_available_mb: 0,
            disk_available_mb: 0,
        }
    }
}

/// Registration request for a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Existing ID to re-register under; a new one is generated when absent.
    #[serde(default)]
    pub id: Option<NodeId>,
    /// Host name reported by the node agent.
    pub hostname: String,
    /// Address the control plane reaches the node on.
    pub address: String,
    /// Declared capacity.
    #[serde(default)]
    pub capacity: NodeCapacity,
}

impl NodeDescriptor {
    /// Creates a descriptor for a new node.
    #[must_use]
    pub fn new(hostname: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: None,
            hostname: hostname.into(),
            address: address.into(),
            capacity: NodeCapacity::default(),
        }
    }

    /// Re-register under an existing ID.
    #[must_use]
    pub fn with_id(mut self, id: NodeId) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the declared capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: NodeCapacity) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Load and capacity reported with a heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMetrics {
    /// Work currently running on the node.
    pub current_load: u32,
    /// Updated concurrency limit, if it changed.
    #[serde(default)]
    pub max_concurrent: Option<u32>,
    /// Available CPU cores.
    pub cpu_available: f64,
    /// Available memory in MB.
    pub memory_available_mb: u64,
    /// Available disk in MB.
    pub disk_available_mb: u64,
}

impl HeartbeatMetrics {
    /// Metrics reporting only the current load.
    #[must_use]
    pub fn with_load(current_load: u32) -> Self {
        Self {
            current_load,
            ..Self::default()
        }
    }

    /// Apply these metrics to a stored capacity.
    pub fn apply(&self, capacity: &mut NodeCapacity) {
        capacity.current_load = self.current_load;
        if let Some(max) = self.max_concurrent {
            capacity.max_concurrent = max;
        }
        capacity.cpu_available = self.cpu_available;
        capacity.memory_available_mb = self.memory_available_mb;
        capacity.disk_available_mb = self.disk_available_mb;
    }
}

/// A node as stored. Carries no health flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Unique node identifier.
    pub id: NodeId,
    /// Host name reported by the node agent.
    pub hostname: String,
    /// Address the control plane reaches the node on.
    pub address: String,
    /// Capacity and last reported load.
    pub capacity: NodeCapacity,
    /// Time of the last heartbeat (or registration).
    pub last_heartbeat: DateTime<Utc>,
    /// Time the node first registered.
    pub registered_at: DateTime<Utc>,
}

/// A node record together with its derived health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDetails {
    /// The stored record.
    #[serde(flatten)]
    pub record: NodeRecord,
    /// Health derived at read time.
    pub health: NodeHealth,
    /// Age of the last heartbeat at read time.
    pub heartbeat_age: Duration,
}

/// Node registry and health evaluator.
///
/// Registration and heartbeats are single-row upserts in the backing store;
/// health queries are pure reads filtered by heartbeat age.
pub struct NodeRegistry {
    store: Arc<dyn NodeStore>,
    evaluator: HealthEvaluator,
}

impl NodeRegistry {
    /// Creates a registry over the given store.
    pub fn new(store: Arc<dyn NodeStore>, config: &HealthConfig) -> Result<Self> {
        Ok(Self {
            store,
            evaluator: HealthEvaluator::new(config)?,
        })
    }

    /// Returns the health evaluator in use.
    #[must_use]
    pub const fn evaluator(&self) -> &HealthEvaluator {
        &self.evaluator
    }

    /// Registers a node, or refreshes an existing registration, and returns its ID.
    ///
    /// Registration counts as a heartbeat.
    pub async fn register(&self, descriptor: NodeDescriptor) -> Result<NodeId> {
        let now = Utc::now();
        let id = descriptor.id.clone().unwrap_or_else(NodeId::generate);

        let record = NodeRecord {
            id: id.clone(),
            hostname: descriptor.hostname,
            address: descriptor.address,
            capacity: descriptor.capacity,
            last_heartbeat: now,
            registered_at: now,
        };

        self.store.upsert(&record).await?;

        info!(node_id = %id, address = %record.address, "node registered");
        Ok(id)
    }

    /// Records a heartbeat for a registered node.
    pub async fn heartbeat(&self, id: &NodeId, metrics: &HeartbeatMetrics) -> Result<()> {
        self.store.heartbeat(id, metrics, Utc::now()).await?;
        debug!(node_id = %id, load = metrics.current_load, "heartbeat recorded");
        Ok(())
    }

    /// Lists nodes whose last heartbeat is within the health threshold.
    pub async fn list_healthy(&self) -> Result<Vec<NodeRecord>> {
        self.list_healthy_at(Utc::now()).await
    }

    /// Lists nodes healthy as of `now`.
    pub async fn list_healthy_at(&self, now: DateTime<Utc>) -> Result<Vec<NodeRecord>> {
        self.store.list_since(self.evaluator.cutoff(now)).await
    }

    /// Picks the healthy node with the most spare capacity.
    ///
    /// Nodes at their concurrency limit are skipped. The lowest utilisation
    /// wins; ties go to the node with more free slots, then the lower ID.
    /// Returns `None` when no healthy node has room.
    pub async fn select_node(&self) -> Result<Option<NodeRecord>> {
        self.select_node_at(Utc::now()).await
    }

    /// Picks a node using health as of `now`.
    pub async fn select_node_at(&self, now: DateTime<Utc>) -> Result<Option<NodeRecord>> {
        let healthy = self.list_healthy_at(now).await?;
        let candidates = healthy.len();

        let selected = healthy
            .into_iter()
            .filter(|node| node.capacity.has_capacity())
            .min_by(|a, b| {
                a.capacity
                    .utilisation()
                    .total_cmp(&b.capacity.utilisation())
                    .then_with(|| b.capacity.free_slots().cmp(&a.capacity.free_slots()))
                    .then_with(|| a.id.cmp(&b.id))
            });

        match &selected {
            Some(node) => debug!(
                node_id = %node.id,
                load = node.capacity.current_load,
                max = node.capacity.max_concurrent,
                "node selected"
            ),
            None => warn!(healthy = candidates, "no healthy node with spare capacity"),
        }

        Ok(selected)
    }

    /// Lists every registered node with its derived health.
    pub async fn list_details(&self) -> Result<Vec<NodeDetails>> {
        let now = Utc::now();
        let nodes = self.store.list().await?;
        Ok(nodes.into_iter().map(|n| self.details(n, now)).collect())
    }

    /// Returns a node's record with its derived health.
    pub async fn get_details(&self, id: &NodeId) -> Result<NodeDetails> {
        self.get_details_at(id, Utc::now()).await
    }

    /// Returns a node's record with health derived as of `now`.
    pub async fn get_details_at(&self, id: &NodeId, now: DateTime<Utc>) -> Result<NodeDetails> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| SchedulerError::NodeNotFound(id.to_string()))?;

        Ok(self.details(record, now))
    }

    fn details(&self, record: NodeRecord, now: DateTime<Utc>) -> NodeDetails {
        NodeDetails {
            health: self.evaluator.evaluate(record.last_heartbeat, now),
            heartbeat_age: HealthEvaluator::heartbeat_age(record.last_heartbeat, now),
            record,
        }
    }
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("evaluator", &self.evaluator)
            .finish_non_exhaustive()
    }
}
