//! In-memory job queue.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock, TryLockError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{ControlError, ControlResult};
use crate::types::{BuildJob, JobId, JobStatus};

use super::{EnqueueOutcome, JobQueue, Requeue};

type Slot = Arc<Mutex<BuildJob>>;

#[derive(Debug, Default)]
struct Table {
    /// Non-terminal jobs in dequeue order.
    active: BTreeMap<(DateTime<Utc>, JobId), Slot>,
    /// Every job ever enqueued.
    by_id: HashMap<JobId, Slot>,
}

/// In-memory job queue.
///
/// Each job sits behind its own mutex. A dequeuer that finds a job's mutex
/// held by another claimant skips it, which is the same observable
/// behaviour as `FOR UPDATE SKIP LOCKED`. Data is lost when the process
/// exits.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    table: RwLock<Table>,
}

impl MemoryQueue {
    /// Create a new empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs waiting to be claimed.
    pub fn queued_count(&self) -> ControlResult<usize> {
        let table = self
            .table
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        let mut count = 0;
        for slot in table.active.values() {
            if lock(slot)?.status == JobStatus::Queued {
                count += 1;
            }
        }
        Ok(count)
    }

    fn slot(&self, id: &JobId) -> ControlResult<Slot> {
        let table = self
            .table
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        table
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| ControlError::JobNotFound(id.to_string()))
    }

    /// Move a running job to a terminal status and out of the active set.
    fn finish(&self, id: &JobId, status: JobStatus, error: Option<&str>) -> ControlResult<()> {
        let mut table = self
            .table
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        let slot = table
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| ControlError::JobNotFound(id.to_string()))?;

        let mut job = lock(&slot)?;
        if job.status != JobStatus::Running {
            return Err(ControlError::JobNotFound(id.to_string()));
        }

        job.status = status;
        job.finished_at = Some(Utc::now());
        if let Some(error) = error {
            job.last_error = Some(error.to_owned());
        }
        table.active.remove(&(job.created_at, job.id.clone()));

        Ok(())
    }
}

fn lock(slot: &Slot) -> ControlResult<std::sync::MutexGuard<'_, BuildJob>> {
    slot.lock()
        .map_err(|_| ControlError::internal("lock poisoned"))
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: &BuildJob) -> ControlResult<EnqueueOutcome> {
        let mut table = self
            .table
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        if table.by_id.contains_key(&job.id) {
            debug!(job_id = %job.id, "duplicate enqueue");
            return Ok(EnqueueOutcome::Conflict);
        }

        let mut job = job.clone();
        job.status = JobStatus::Queued;
        job.started_at = None;
        job.finished_at = None;

        let key = (job.created_at, job.id.clone());
        let slot = Arc::new(Mutex::new(job));
        table.by_id.insert(key.1.clone(), Arc::clone(&slot));
        table.active.insert(key, slot);

        Ok(EnqueueOutcome::Enqueued)
    }

    async fn dequeue(&self) -> ControlResult<Option<BuildJob>> {
        let table = self
            .table
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        for slot in table.active.values() {
            let mut job = match slot.try_lock() {
                Ok(job) => job,
                Err(TryLockError::WouldBlock) => continue,
                Err(TryLockError::Poisoned(_)) => {
                    return Err(ControlError::internal("lock poisoned"))
                }
            };

            if job.status != JobStatus::Queued {
                continue;
            }

            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            return Ok(Some(job.clone()));
        }

        Ok(None)
    }

    async fn ack(&self, id: &JobId) -> ControlResult<()> {
        self.finish(id, JobStatus::Succeeded, None)
    }

    async fn requeue(&self, id: &JobId, requeue: &Requeue) -> ControlResult<()> {
        let slot = self.slot(id)?;
        let mut job = lock(&slot)?;

        if job.status != JobStatus::Running {
            return Err(ControlError::JobNotFound(id.to_string()));
        }

        job.status = JobStatus::Queued;
        job.started_at = None;
        job.retry_count = job.retry_count.saturating_add(1);
        if let Some(ref error) = requeue.error {
            job.last_error = Some(error.clone());
        }
        if let Some(kind) = requeue.build_kind {
            job.target.kind = kind;
        }

        Ok(())
    }

    async fn fail(&self, id: &JobId, error: &str) -> ControlResult<()> {
        self.finish(id, JobStatus::Failed, Some(error))
    }

    async fn get(&self, id: &JobId) -> ControlResult<Option<BuildJob>> {
        let slot = match self.slot(id) {
            Ok(slot) => slot,
            Err(ControlError::JobNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let job = lock(&slot)?.clone();
        Ok(Some(job))
    }

    async fn running_since(&self, cutoff: DateTime<Utc>) -> ControlResult<Vec<BuildJob>> {
        let table = self
            .table
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        let mut stale = Vec::new();
        for slot in table.active.values() {
            let job = lock(slot)?;
            if job.status == JobStatus::Running && job.started_at.is_some_and(|t| t < cutoff) {
                stale.push(job.clone());
            }
        }
        stale.sort_by_key(|job| job.started_at);

        Ok(stale)
    }
}
