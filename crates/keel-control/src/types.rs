//! Core types for keel-control.

use std::fmt;

use chrono::{DateTime, Utc};
use keel_scheduler::NodeId;
use serde::{Deserialize, Serialize};

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new unique identifier using ULID.
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

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

ulid_id!(
    /// Unique identifier for a build job.
    JobId
);

ulid_id!(
    /// Unique identifier for a deployment.
    DeploymentId
);

/// Identifier of a tenant application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(String);

impl AppId {
    /// Create a new application ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to a built artifact (image digest, store path).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    /// Create a new artifact reference.
    #[must_use]
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// Get the reference as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How an artifact is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildKind {
    /// Container image build.
    Oci,
    /// Hermetic Nix build.
    PureNix,
}

impl BuildKind {
    /// Get the kind name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Oci => "oci",
            Self::PureNix => "pure_nix",
        }
    }
}

impl fmt::Display for BuildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuildKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oci" => Ok(Self::Oci),
            "pure_nix" => Ok(Self::PureNix),
            _ => Err(format!("unknown build kind: {s}")),
        }
    }
}

/// Where the source for a build comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocator {
    /// Repository URL.
    pub repository_url: String,
    /// Branch, tag or commit.
    pub git_ref: String,
}

impl SourceLocator {
    /// Create a new source locator.
    #[must_use]
    pub fn new(repository_url: impl Into<String>, git_ref: impl Into<String>) -> Self {
        Self {
            repository_url: repository_url.into(),
            git_ref: git_ref.into(),
        }
    }
}

/// What a build produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTarget {
    /// Output selector (flake attribute, Dockerfile target).
    pub output: String,
    /// Build kind.
    pub kind: BuildKind,
}

/// Status of a build job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed.
    Queued,
    /// Claimed by exactly one dispatcher.
    Running,
    /// Acknowledged as successful.
    Succeeded,
    /// Terminally failed.
    Failed,
}

impl JobStatus {
    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown job status: {s}")),
        }
    }
}

/// A unit of build work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildJob {
    /// Unique job identifier.
    pub id: JobId,
    /// Deployment this job builds for.
    pub deployment_id: DeploymentId,
    /// Owning application.
    pub app_id: AppId,
    /// Source to build.
    pub source: SourceLocator,
    /// Output to produce.
    pub target: BuildTarget,
    /// Queue status.
    pub status: JobStatus,
    /// When the job was created. Dequeue order follows this.
    pub created_at: DateTime<Utc>,
    /// When the current claim started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
    /// Number of times the job was returned to the queue.
    pub retry_count: u32,
    /// Per-job build timeout override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Prebuilt artifact to deploy. When set the build step is skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRef>,
    /// Error recorded by the last failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl BuildJob {
    /// Create a new queued job.
    #[must_use]
    pub fn new(
        deployment_id: DeploymentId,
        app_id: AppId,
        source: SourceLocator,
        target: BuildTarget,
    ) -> Self {
        Self {
            id: JobId::generate(),
            deployment_id,
            app_id,
            source,
            target,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            retry_count: 0,
            timeout_secs: None,
            artifact: None,
            last_error: None,
        }
    }

    /// Create a job that deploys an existing artifact without building.
    #[must_use]
    pub fn deploy_only(
        deployment_id: DeploymentId,
        app_id: AppId,
        source: SourceLocator,
        target: BuildTarget,
        artifact: ArtifactRef,
    ) -> Self {
        Self {
            artifact: Some(artifact),
            ..Self::new(deployment_id, app_id, source, target)
        }
    }

    /// Returns true if this job deploys a prebuilt artifact.
    #[must_use]
    pub const fn is_deploy_only(&self) -> bool {
        self.artifact.is_some()
    }

    /// Set a per-job timeout.
    #[must_use]
    pub const fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// Deployment lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Created, build not started.
    Pending,
    /// Build job claimed and executing.
    Building,
    /// Artifact available, being rolled out.
    Deploying,
    /// Live.
    Running,
    /// Terminally failed or cancelled.
    Failed,
    /// Replaced by an explicit rollback.
    RolledBack,
}

impl DeploymentStatus {
    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Building => "building",
            Self::Deploying => "deploying",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    /// True while the deployment holds its (app, service) key.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Building | Self::Deploying)
    }

    /// True once no further transition can happen.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::RolledBack)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "building" => Ok(Self::Building),
            "deploying" => Ok(Self::Deploying),
            "running" => Ok(Self::Running),
            "failed" => Ok(Self::Failed),
            "rolled_back" => Ok(Self::RolledBack),
            _ => Err(format!("unknown deployment status: {s}")),
        }
    }
}

/// A deployment row. Rows are appended, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// Unique deployment identifier.
    pub id: DeploymentId,
    /// Owning application.
    pub app_id: AppId,
    /// Service within the application.
    pub service_name: String,
    /// Per-(app, service) sequence number, assigned on insert.
    pub version: u32,
    /// Lifecycle status.
    pub status: DeploymentStatus,
    /// Current build job, if one was queued.
    pub build_job_id: Option<JobId>,
    /// Node the deployment was assigned to.
    pub node_id: Option<NodeId>,
    /// Built artifact, once known.
    pub artifact: Option<ArtifactRef>,
    /// Deployment this one rolled back to.
    pub previous_deployment_id: Option<DeploymentId>,
    /// Error message if the deployment failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the deployment was created.
    pub created_at: DateTime<Utc>,
    /// When the deployment was last updated.
    pub updated_at: DateTime<Utc>,
}

impl DeploymentRecord {
    /// Create a new pending deployment. The version is assigned by the store.
    #[must_use]
    pub fn new(app_id: AppId, service_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: DeploymentId::generate(),
            app_id,
            service_name: service_name.into(),
            version: 0,
            status: DeploymentStatus::Pending,
            build_job_id: None,
            node_id: None,
            artifact: None,
            previous_deployment_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}
