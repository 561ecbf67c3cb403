//! Deployment state machine.
//!
//! ```text
//! Pending ──▶ Building ──▶ Deploying ──▶ Running ──▶ RolledBack
//!    │  │         │            ▲  │
//!    │  │         ▼            │  ▼
//!    │  └──────▶ Failed ◀──────┼──┘
//!    └─────────(rollback)──────┘
//! ```
//!
//! Each event names the statuses it may be applied from and the status it
//! moves to. The store applies it as a conditional update, so two callers
//! racing the same transition get one success and one `Conflict`. Nothing
//! ever moves back to `Pending` or `Building`; a redeploy is a new row.

use keel_scheduler::NodeId;
use serde::{Deserialize, Serialize};

use crate::store::StatusUpdate;
use crate::types::{ArtifactRef, DeploymentStatus, JobId};

use DeploymentStatus::{Building, Deploying, Failed, Pending, RolledBack, Running};

/// Something that happened to a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeploymentEvent {
    /// A dispatcher claimed the deployment's build job.
    BuildStarted {
        /// Claimed job.
        job_id: JobId,
        /// Node the dispatcher runs on, if known.
        node_id: Option<NodeId>,
    },
    /// The build produced an artifact.
    BuildSucceeded {
        /// Built artifact.
        artifact: ArtifactRef,
    },
    /// The artifact is live.
    Deployed {
        /// Node serving the deployment, if known.
        node_id: Option<NodeId>,
    },
    /// Deploy an existing artifact without building.
    DeployArtifact {
        /// Artifact to deploy.
        artifact: ArtifactRef,
    },
    /// The deployment failed or was cancelled.
    Failed {
        /// Failure reason.
        reason: String,
    },
    /// A rollback replaced this deployment.
    RolledBack,
}

impl DeploymentEvent {
    /// Short event name for logs and errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::BuildStarted { .. } => "build_started",
            Self::BuildSucceeded { .. } => "build_succeeded",
            Self::Deployed { .. } => "deployed",
            Self::DeployArtifact { .. } => "deploy_artifact",
            Self::Failed { .. } => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    /// Statuses this event may be applied from.
    #[must_use]
    pub const fn valid_from(&self) -> &'static [DeploymentStatus] {
        match self {
            // A redelivered job may start again while still Building.
            Self::BuildStarted { .. } => &[Pending, Building],
            Self::BuildSucceeded { .. } => &[Building],
            Self::Deployed { .. } => &[Deploying],
            Self::DeployArtifact { .. } => &[Pending],
            Self::Failed { .. } => &[Pending, Building, Deploying],
            Self::RolledBack => &[Running],
        }
    }

    /// Status this event moves to.
    #[must_use]
    pub const fn target(&self) -> DeploymentStatus {
        match self {
            Self::BuildStarted { .. } => Building,
            Self::BuildSucceeded { .. } | Self::DeployArtifact { .. } => Deploying,
            Self::Deployed { .. } => Running,
            Self::Failed { .. } => Failed,
            Self::RolledBack => RolledBack,
        }
    }

    /// True if the event may be applied to a deployment in `status`.
    #[must_use]
    pub fn applies_to(&self, status: DeploymentStatus) -> bool {
        self.valid_from().contains(&status)
    }

    /// The conditional update that applies this event.
    #[must_use]
    pub fn to_update(&self) -> StatusUpdate {
        let update = StatusUpdate::new(self.valid_from(), self.target());
        match self {
            Self::BuildStarted {
                node_id: Some(node_id),
                ..
            }
            | Self::Deployed {
                node_id: Some(node_id),
            } => update.with_node(node_id.clone()),
            Self::BuildSucceeded { artifact } | Self::DeployArtifact { artifact } => {
                update.with_artifact(artifact.clone())
            }
            Self::Failed { reason } => update.with_error(reason.clone()),
            _ => update,
        }
    }
}
