//! Cancellation handles for builds running in this process.

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::types::DeploymentId;

/// Builds currently executing in this process, keyed by deployment.
#[derive(Debug, Default)]
pub struct InFlight {
    tokens: DashMap<DeploymentId, CancellationToken>,
}

impl InFlight {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a running build and return its cancellation token.
    ///
    /// The token is a child of `parent`, so process shutdown also cancels it.
    pub fn register(&self, id: &DeploymentId, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        self.tokens.insert(id.clone(), token.clone());
        token
    }

    /// Cancel a running build. Returns false if none is running here.
    pub fn cancel(&self, id: &DeploymentId) -> bool {
        // Clone out of the map so the shard lock is not held while cancelling.
        let token = self.tokens.get(id).map(|t| t.value().clone());
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove a finished build.
    pub fn remove(&self, id: &DeploymentId) {
        self.tokens.remove(id);
    }

    /// Number of builds running in this process.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// True if nothing is running.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
