//! Durable build job queue.
//!
//! The queue's claim primitive is the only global synchronisation point for
//! dispatchers: [`JobQueue::dequeue`] hands each queued job to exactly one
//! caller, skipping rows another caller is in the middle of claiming rather
//! than blocking on them.
//!
//! Two backends are provided: PostgreSQL (`FOR UPDATE SKIP LOCKED`) for
//! multi-process deployments, and an in-memory queue that emulates the same
//! skip-on-contention semantics with per-row locks.

mod memory;
mod postgres;

pub use memory::MemoryQueue;
pub use postgres::PostgresQueue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ControlResult;
use crate::types::{BuildJob, BuildKind, JobId};

/// Result of submitting a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The job was persisted in the queued state.
    Enqueued,
    /// A job with the same ID already exists; nothing was written.
    Conflict,
}

/// How a job is returned to the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requeue {
    /// Error from the failed attempt, recorded on the job.
    pub error: Option<String>,
    /// Build kind for the next attempt, if it should change.
    pub build_kind: Option<BuildKind>,
}

/// Backend for the build job queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Persist a new job in the queued state.
    ///
    /// Resubmitting an existing ID returns [`EnqueueOutcome::Conflict`].
    async fn enqueue(&self, job: &BuildJob) -> ControlResult<EnqueueOutcome>;

    /// Claim the oldest queued job not being claimed by another caller.
    ///
    /// The job is returned in the running state with `started_at` set.
    /// Returns `None` when no job is available.
    async fn dequeue(&self) -> ControlResult<Option<BuildJob>>;

    /// Mark a running job succeeded.
    ///
    /// Fails with `JobNotFound` if the job is absent or not running.
    async fn ack(&self, id: &JobId) -> ControlResult<()>;

    /// Return a running job to the queue, clearing `started_at` and
    /// incrementing `retry_count` by one.
    ///
    /// Fails with `JobNotFound` if the job is absent or not running.
    async fn requeue(&self, id: &JobId, requeue: &Requeue) -> ControlResult<()>;

    /// Mark a running job terminally failed.
    ///
    /// Like [`JobQueue::ack`] this takes the job out of the active set.
    async fn fail(&self, id: &JobId, error: &str) -> ControlResult<()>;

    /// Get a job by ID.
    async fn get(&self, id: &JobId) -> ControlResult<Option<BuildJob>>;

    /// List running jobs claimed before `cutoff`, oldest claim first.
    async fn running_since(&self, cutoff: DateTime<Utc>) -> ControlResult<Vec<BuildJob>>;

    /// Return a running job to the queue.
    async fn nack(&self, id: &JobId) -> ControlResult<()> {
        self.requeue(id, &Requeue::default()).await
    }

    /// Return a running job to the queue to be rebuilt as `kind`.
    async fn nack_with_kind(&self, id: &JobId, kind: BuildKind) -> ControlResult<()> {
        self.requeue(
            id,
            &Requeue {
                error: None,
                build_kind: Some(kind),
            },
        )
        .await
    }
}
