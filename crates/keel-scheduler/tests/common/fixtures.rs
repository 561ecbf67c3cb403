//! Test fixtures for scheduler integration tests.

use chrono::{DateTime, TimeDelta, Utc};
use keel_scheduler::{NodeCapacity, NodeDescriptor, NodeId, NodeRecord};

/// Builder for creating test node records and descriptors.
pub struct NodeBuilder {
    id: String,
    address: String,
    max_concurrent: u32,
    current_load: u32,
    last_heartbeat: DateTime<Utc>,
}

impl NodeBuilder {
    /// Creates a new node builder with the given ID.
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            address: "127.0.0.1:7000".to_string(),
            max_concurrent: 4,
            current_load: 0,
            last_heartbeat: Utc::now(),
        }
    }

    /// Sets the node's address.
    pub fn with_address(mut self, addr: &str) -> Self {
        self.address = addr.to_string();
        self
    }

    /// Sets the node's load and concurrency limit.
    pub fn with_load(mut self, current: u32, max: u32) -> Self {
        self.current_load = current;
        self.max_concurrent = max;
        self
    }

    /// Backdates the last heartbeat by the given number of seconds.
    pub fn heartbeated_secs_ago(mut self, secs: i64) -> Self {
        self.last_heartbeat = Utc::now() - TimeDelta::seconds(secs);
        self
    }

    fn capacity(&self) -> NodeCapacity {
        NodeCapacity {
            max_concurrent: self.max_concurrent,
            current_load: self.current_load,
            ..NodeCapacity::default()
        }
    }

    /// Builds a registration descriptor.
    pub fn descriptor(self) -> NodeDescriptor {
        let capacity = self.capacity();
        NodeDescriptor::new(format!("{}.local", self.id), self.address)
            .with_id(NodeId::new(self.id))
            .with_capacity(capacity)
    }

    /// Builds a stored record, for seeding a store directly.
    pub fn record(self) -> NodeRecord {
        let capacity = self.capacity();
        NodeRecord {
            id: NodeId::new(&self.id),
            hostname: format!("{}.local", self.id),
            address: self.address,
            capacity,
            last_heartbeat: self.last_heartbeat,
            registered_at: self.last_heartbeat,
        }
    }
}
