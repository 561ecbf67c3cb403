//! In-memory node store for testing.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Result, SchedulerError};
use crate::registry::{HeartbeatMetrics, NodeId, NodeRecord};

use super::NodeStore;

/// In-memory node store.
///
/// Data is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryNodeStore {
    nodes: RwLock<BTreeMap<NodeId, NodeRecord>>,
}

impl MemoryNodeStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn upsert(&self, record: &NodeRecord) -> Result<()> {
        let mut nodes = self
            .nodes
            .write()
            .map_err(|_| SchedulerError::internal("lock poisoned"))?;

        let mut record = record.clone();
        if let Some(existing) = nodes.get(&record.id) {
            record.registered_at = existing.registered_at;
        }
        nodes.insert(record.id.clone(), record);

        Ok(())
    }

    async fn heartbeat(
        &self,
        id: &NodeId,
        metrics: &HeartbeatMetrics,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut nodes = self
            .nodes
            .write()
            .map_err(|_| SchedulerError::internal("lock poisoned"))?;

        let node = nodes
            .get_mut(id)
            .ok_or_else(|| SchedulerError::NodeNotFound(id.to_string()))?;

        metrics.apply(&mut node.capacity);
        node.last_heartbeat = at;

        Ok(())
    }

    async fn get(&self, id: &NodeId) -> Result<Option<NodeRecord>> {
        let nodes = self
            .nodes
            .read()
            .map_err(|_| SchedulerError::internal("lock poisoned"))?;

        Ok(nodes.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<NodeRecord>> {
        let nodes = self
            .nodes
            .read()
            .map_err(|_| SchedulerError::internal("lock poisoned"))?;

        Ok(nodes.values().cloned().collect())
    }

    async fn list_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<NodeRecord>> {
        let nodes = self
            .nodes
            .read()
            .map_err(|_| SchedulerError::internal("lock poisoned"))?;

        Ok(nodes
            .values()
            .filter(|n| n.last_heartbeat >= cutoff)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::registry::NodeCapacity;
    use chrono::TimeDelta;

    fn node(id: &str, last_heartbeat: DateTime<Utc>) -> NodeRecord {
        NodeRecord {
            id: NodeId::new(id),
            hostname: format!("{id}.local"),
            address: "127.0.0.1:7000".to_owned(),
            capacity: NodeCapacity::default(),
            last_heartbeat,
            registered_at: last_heartbeat,
        }
    }

    #[tokio::test]
    async fn list_since_filters_by_heartbeat() {
        let store = MemoryNodeStore::new();
        let now = Utc::now();

        store
            .upsert(&node("fresh", now - TimeDelta::seconds(5)))
            .await
            .unwrap();
        store
            .upsert(&node("stale", now - TimeDelta::seconds(120)))
            .await
            .unwrap();

        let recent = store.list_since(now - TimeDelta::seconds(30)).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id.as_str(), "fresh");

        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn heartbeat_moves_timestamp() {
        let store = MemoryNodeStore::new();
        let then = Utc::now() - TimeDelta::seconds(120);
        store.upsert(&node("n1", then)).await.unwrap();

        let now = Utc::now();
        store
            .heartbeat(&NodeId::new("n1"), &HeartbeatMetrics::with_load(2), now)
            .await
            .unwrap();

        let record = store.get(&NodeId::new("n1")).await.unwrap().unwrap();
        assert_eq!(record.last_heartbeat, now);
        assert_eq!(record.capacity.current_load, 2);
        assert_eq!(record.registered_at, then);
    }
}
