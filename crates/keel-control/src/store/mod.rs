//! Deployment storage backends.
//!
//! Every status change goes through [`DeploymentStore::transition`], a
//! conditional update that applies only if the row is still in one of the
//! expected statuses. The store also refuses to let a second deployment for
//! the same (app, service) key become active while another one is, which is
//! what serialises deployments per key without holding a lock.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use keel_scheduler::NodeId;

use crate::error::ControlResult;
use crate::types::{AppId, ArtifactRef, DeploymentId, DeploymentRecord, DeploymentStatus};

/// Filter criteria for listing deployments.
#[derive(Debug, Clone, Default)]
pub struct DeploymentFilter {
    /// Filter by application.
    pub app_id: Option<AppId>,
    /// Filter by service name.
    pub service_name: Option<String>,
    /// Filter by status.
    pub status: Option<DeploymentStatus>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

impl DeploymentFilter {
    /// Create a new empty filter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            app_id: None,
            service_name: None,
            status: None,
            limit: None,
            offset: None,
        }
    }

    /// Filter by (app, service) key.
    #[must_use]
    pub fn for_service(mut self, app_id: AppId, service_name: impl Into<String>) -> Self {
        self.app_id = Some(app_id);
        self.service_name = Some(service_name.into());
        self
    }

    /// Filter by application.
    #[must_use]
    pub fn with_app(mut self, app_id: AppId) -> Self {
        self.app_id = Some(app_id);
        self
    }

    /// Filter by status.
    #[must_use]
    pub const fn with_status(mut self, status: DeploymentStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Set maximum results.
    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set pagination offset.
    #[must_use]
    pub const fn with_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    fn matches(&self, record: &DeploymentRecord) -> bool {
        self.app_id.as_ref().map_or(true, |a| a == &record.app_id)
            && self
                .service_name
                .as_ref()
                .map_or(true, |s| s == &record.service_name)
            && self.status.map_or(true, |s| s == record.status)
    }
}

/// A conditional status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    /// Statuses the row must currently be in.
    pub from: Vec<DeploymentStatus>,
    /// Status to move to.
    pub to: DeploymentStatus,
    /// Artifact to record, if any.
    pub artifact: Option<ArtifactRef>,
    /// Node to record, if any.
    pub node_id: Option<NodeId>,
    /// Error message to record, if any.
    pub error: Option<String>,
}

impl StatusUpdate {
    /// Move from any of `from` to `to`.
    #[must_use]
    pub fn new(from: &[DeploymentStatus], to: DeploymentStatus) -> Self {
        Self {
            from: from.to_vec(),
            to,
            artifact: None,
            node_id: None,
            error: None,
        }
    }

    /// Record an artifact.
    #[must_use]
    pub fn with_artifact(mut self, artifact: ArtifactRef) -> Self {
        self.artifact = Some(artifact);
        self
    }

    /// Record the assigned node.
    #[must_use]
    pub fn with_node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    /// Record an error message.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    fn allows(&self, status: DeploymentStatus) -> bool {
        self.from.contains(&status)
    }
}

/// Backend for storing deployment records.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Insert a new deployment row and return it with its version assigned.
    ///
    /// The version is one more than the highest existing version for the
    /// row's (app, service) key.
    async fn insert(&self, record: &DeploymentRecord) -> ControlResult<DeploymentRecord>;

    /// Get a deployment by ID.
    async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>>;

    /// List deployments matching the filter, newest first.
    async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>>;

    /// Apply a conditional status change and return the updated row.
    ///
    /// Fails with `DeploymentNotFound` if the row is absent, and with
    /// `Conflict` if its status is not in `update.from` or if `update.to`
    /// is active while another deployment for the same key already is.
    async fn transition(
        &self,
        id: &DeploymentId,
        update: &StatusUpdate,
    ) -> ControlResult<DeploymentRecord>;
}
