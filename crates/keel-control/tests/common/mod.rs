//! Common test utilities for control plane integration tests.

#![allow(dead_code)]

pub mod fixtures;

use std::sync::Arc;

use keel_control::{
    DeploymentManager, DeploymentStore, Dispatcher, InFlight, JobQueue, MemoryQueue, MemoryStore,
    RuntimeExecutor,
};

/// Manager and queue wired to in-memory backends.
pub struct TestControl {
    pub queue: Arc<MemoryQueue>,
    pub store: Arc<MemoryStore>,
    pub manager: Arc<DeploymentManager>,
}

impl TestControl {
    pub fn new() -> Self {
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(MemoryStore::new());
        let manager = Arc::new(DeploymentManager::new(
            Arc::clone(&store) as Arc<dyn DeploymentStore>,
            Arc::clone(&queue) as Arc<dyn JobQueue>,
            Arc::new(InFlight::new()),
        ));

        Self {
            queue,
            store,
            manager,
        }
    }

    /// The queue as a trait object, as dispatchers see it.
    pub fn job_queue(&self) -> Arc<dyn JobQueue> {
        Arc::clone(&self.queue) as Arc<dyn JobQueue>
    }

    /// A dispatcher over this control plane.
    pub fn dispatcher(&self, id: usize, executor: Arc<dyn RuntimeExecutor>) -> Dispatcher {
        Dispatcher::new(id, self.job_queue(), Arc::clone(&self.manager), executor)
    }
}

impl Default for TestControl {
    fn default() -> Self {
        Self::new()
    }
}
