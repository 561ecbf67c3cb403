//! Keel control plane core.
//!
//! This crate owns the durable side of a deployment: the build queue that
//! workers claim jobs from, the dispatcher loop that runs claimed jobs, and
//! the deployment state machine that records where each rollout stands.
//!
//! # Architecture
//!
//! - **Build queue**: FIFO jobs claimed with skip-locked semantics, so any
//!   number of dispatchers across processes can poll it concurrently and each
//!   job is held by at most one of them
//! - **Dispatcher**: claims a job, checks its own node's health, hands the
//!   build to a [`RuntimeExecutor`] and acks, retries or fails the job
//! - **Deployment state machine**: event-driven transitions validated against
//!   the stored status, with at most one deployment in flight per
//!   application and service
//! - **Node registry**: provided by [`keel_scheduler`]; health is derived from
//!   heartbeat age on every read
//!
//! # State Machine
//!
//! ```text
//! Pending ──▶ Building ──▶ Deploying ──▶ Running ──▶ RolledBack
//!    │           │             │
//!    └───────────┴─────────────┴──▶ Failed
//! ```
//!
//! A rollback does not move an old row backwards. It creates a new
//! deployment carrying the earlier artifact, which enters `Deploying`
//! directly and is finished by a deploy-only job that skips the build.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use keel_control::{DeploymentManager, DeploymentRequest, InFlight, MemoryQueue, MemoryStore};
//!
//! let manager = DeploymentManager::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(MemoryQueue::new()),
//!     Arc::new(InFlight::new()),
//! );
//! let (deployment, job) = manager.create(request).await?;
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod deployment;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod inflight;
pub mod queue;
pub mod retry;
pub mod state;
pub mod store;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::ControlConfig;
pub use deployment::{DeploymentManager, DeploymentRequest};
pub use dispatcher::{Dispatcher, PollOutcome};
pub use error::{ControlError, ControlResult};
pub use executor::{BuildSpec, CommandExecutor, ExecutorError, RuntimeExecutor};
pub use inflight::InFlight;
pub use queue::{EnqueueOutcome, JobQueue, MemoryQueue, PostgresQueue, Requeue};
pub use retry::{RetryDecision, RetryPolicy};
pub use state::DeploymentEvent;
pub use store::{DeploymentFilter, DeploymentStore, MemoryStore, PostgresStore, StatusUpdate};
pub use types::{
    AppId, ArtifactRef, BuildJob, BuildKind, BuildTarget, DeploymentId, DeploymentRecord,
    DeploymentStatus, JobId, JobStatus, SourceLocator,
};
