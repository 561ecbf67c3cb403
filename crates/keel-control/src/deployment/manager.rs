//! Deployment lifecycle operations.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{ControlError, ControlResult};
use crate::inflight::InFlight;
use crate::queue::{EnqueueOutcome, JobQueue};
use crate::state::DeploymentEvent;
use crate::store::{DeploymentFilter, DeploymentStore};
use crate::types::{
    AppId, BuildJob, BuildTarget, DeploymentId, DeploymentRecord, DeploymentStatus,
    SourceLocator,
};

/// Request to create a new deployment.
#[derive(Debug, Clone)]
pub struct DeploymentRequest {
    /// Application identifier.
    pub app_id: AppId,
    /// Service within the application.
    pub service_name: String,
    /// Source to build.
    pub source: SourceLocator,
    /// Output to produce.
    pub target: BuildTarget,
    /// Per-build timeout override in seconds.
    pub timeout_secs: Option<u64>,
}

impl DeploymentRequest {
    /// Build the deployment row and its build job, linked to each other.
    #[must_use]
    pub fn into_parts(self) -> (DeploymentRecord, BuildJob) {
        let mut record = DeploymentRecord::new(self.app_id.clone(), self.service_name);
        let mut job = BuildJob::new(record.id.clone(), self.app_id, self.source, self.target);
        job.timeout_secs = self.timeout_secs;
        record.build_job_id = Some(job.id.clone());
        (record, job)
    }
}

/// Drives deployments through their lifecycle.
///
/// All status changes are conditional updates in the store, so concurrent
/// callers on the same (app, service) key see `Conflict` rather than
/// blocking each other, and unrelated keys never contend.
pub struct DeploymentManager {
    store: Arc<dyn DeploymentStore>,
    queue: Arc<dyn JobQueue>,
    in_flight: Arc<InFlight>,
}

impl DeploymentManager {
    /// Create a new deployment manager.
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        queue: Arc<dyn JobQueue>,
        in_flight: Arc<InFlight>,
    ) -> Self {
        Self {
            store,
            queue,
            in_flight,
        }
    }

    /// Builds running in this process.
    #[must_use]
    pub fn in_flight(&self) -> &Arc<InFlight> {
        &self.in_flight
    }

    /// Create a pending deployment and queue its build.
    ///
    /// If the job cannot be queued the deployment is marked failed, so no
    /// deployment is left pending without a build.
    pub async fn create(
        &self,
        request: DeploymentRequest,
    ) -> ControlResult<(DeploymentRecord, BuildJob)> {
        let (record, job) = request.into_parts();
        let record = self.store.insert(&record).await?;
        self.enqueue_or_fail(&record, &job, "build").await?;

        info!(
            deployment_id = %record.id,
            app = %record.app_id,
            service = %record.service_name,
            version = record.version,
            job_id = %job.id,
            "deployment created"
        );

        Ok((record, job))
    }

    /// Queue a deployment's job, marking the deployment failed if that fails.
    async fn enqueue_or_fail(
        &self,
        record: &DeploymentRecord,
        job: &BuildJob,
        what: &str,
    ) -> ControlResult<()> {
        let enqueued = match self.queue.enqueue(job).await {
            Ok(EnqueueOutcome::Enqueued) => Ok(()),
            Ok(EnqueueOutcome::Conflict) => Err(ControlError::conflict(format!(
                "{what} job {} already queued",
                job.id
            ))),
            Err(e) => Err(e),
        };

        let Err(e) = enqueued else {
            return Ok(());
        };

        warn!(deployment_id = %record.id, job_id = %job.id, error = %e, "failed to queue {what}");
        let failed = DeploymentEvent::Failed {
            reason: format!("failed to queue {what}: {e}"),
        };
        if let Err(mark) = self.store.transition(&record.id, &failed.to_update()).await {
            warn!(deployment_id = %record.id, error = %mark, "failed to mark deployment failed");
        }
        Err(e)
    }

    /// Apply an event to a deployment.
    ///
    /// Fails with `Conflict` if the deployment is not in a status the event
    /// applies to, or if the event would make a second deployment active for
    /// the same key.
    pub async fn advance(
        &self,
        id: &DeploymentId,
        event: &DeploymentEvent,
    ) -> ControlResult<DeploymentRecord> {
        match self.store.transition(id, &event.to_update()).await {
            Ok(record) => {
                info!(
                    deployment_id = %id,
                    event = event.name(),
                    status = %record.status,
                    "deployment advanced"
                );
                Ok(record)
            }
            Err(e) => {
                if e.is_conflict() {
                    warn!(deployment_id = %id, event = event.name(), error = %e, "transition rejected");
                }
                Err(e)
            }
        }
    }

    /// Roll back to the artifact of a previously successful deployment.
    ///
    /// A new deployment is created referencing `id` and moved straight to
    /// `Deploying`; `id` itself is left untouched. A deploy-only job carrying
    /// the artifact is queued so a dispatcher finishes the rollout. Other
    /// deployments that were running for the same key are marked
    /// `RolledBack`.
    pub async fn rollback(&self, id: &DeploymentId) -> ControlResult<DeploymentRecord> {
        let target = self.get(id).await?;

        if !matches!(
            target.status,
            DeploymentStatus::Running | DeploymentStatus::RolledBack
        ) {
            return Err(invalid_state(&target, "roll back to"));
        }
        let artifact = target
            .artifact
            .clone()
            .ok_or_else(|| invalid_state(&target, "roll back to (no artifact)"))?;

        // The deploy job reuses the original build's source and target.
        let original = match &target.build_job_id {
            Some(job_id) => self.queue.get(job_id).await?,
            None => None,
        }
        .ok_or_else(|| invalid_state(&target, "roll back to (build record missing)"))?;

        let mut record = DeploymentRecord::new(target.app_id.clone(), target.service_name.clone());
        let job = BuildJob::deploy_only(
            record.id.clone(),
            record.app_id.clone(),
            original.source,
            original.target,
            artifact.clone(),
        );
        record.previous_deployment_id = Some(target.id.clone());
        record.artifact = Some(artifact.clone());
        record.build_job_id = Some(job.id.clone());
        let record = self.store.insert(&record).await?;

        let deploy = DeploymentEvent::DeployArtifact { artifact };
        let deploying = match self.store.transition(&record.id, &deploy.to_update()).await {
            Ok(deploying) => deploying,
            Err(e) => {
                warn!(deployment_id = %record.id, target = %id, error = %e, "rollback rejected");
                let failed = DeploymentEvent::Failed {
                    reason: format!("rollback rejected: {e}"),
                };
                if let Err(mark) = self.store.transition(&record.id, &failed.to_update()).await {
                    warn!(deployment_id = %record.id, error = %mark, "failed to mark rollback failed");
                }
                return Err(e);
            }
        };

        // Queued only once the row is Deploying, so a dispatcher never
        // claims it while the row is still pending.
        self.enqueue_or_fail(&deploying, &job, "deploy").await?;

        let live = DeploymentFilter::new()
            .for_service(target.app_id.clone(), target.service_name.clone())
            .with_status(DeploymentStatus::Running);
        for previous in self.store.list(&live).await? {
            if previous.id == target.id {
                continue;
            }
            match self
                .store
                .transition(&previous.id, &DeploymentEvent::RolledBack.to_update())
                .await
            {
                Ok(_) => debug!(deployment_id = %previous.id, "marked rolled back"),
                Err(e) if e.is_conflict() => {
                    debug!(deployment_id = %previous.id, error = %e, "no longer running");
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            deployment_id = %deploying.id,
            target = %id,
            version = deploying.version,
            job_id = %job.id,
            "rollback deploying"
        );

        Ok(deploying)
    }

    /// Cancel a deployment that has not finished.
    ///
    /// The deployment is marked failed and, if its build is running in this
    /// process, the executor is told to stop. A build running elsewhere
    /// keeps its claim until it finishes or times out; its result is then
    /// discarded because the deployment no longer accepts it.
    pub async fn cancel(&self, id: &DeploymentId) -> ControlResult<DeploymentRecord> {
        let current = self.get(id).await?;

        let cancelled = DeploymentEvent::Failed {
            reason: "cancelled".to_owned(),
        };
        if !cancelled.applies_to(current.status) {
            return Err(invalid_state(&current, "cancel"));
        }

        let record = self.advance(id, &cancelled).await?;

        if self.in_flight.cancel(id) {
            info!(deployment_id = %id, "signalled running build to stop");
        }

        Ok(record)
    }

    /// Get a deployment by ID.
    pub async fn get(&self, id: &DeploymentId) -> ControlResult<DeploymentRecord> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ControlError::DeploymentNotFound(id.to_string()))
    }

    /// List deployments, newest first.
    pub async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>> {
        self.store.list(filter).await
    }

    /// The newest deployment of a service that reached `Running`.
    pub async fn latest_successful(
        &self,
        app_id: &AppId,
        service_name: &str,
    ) -> ControlResult<Option<DeploymentRecord>> {
        let filter = DeploymentFilter::new().for_service(app_id.clone(), service_name);
        let history = self.store.list(&filter).await?;

        Ok(history.into_iter().find(|d| {
            matches!(
                d.status,
                DeploymentStatus::Running | DeploymentStatus::RolledBack
            )
        }))
    }
}

fn invalid_state(record: &DeploymentRecord, operation: &'static str) -> ControlError {
    ControlError::InvalidState {
        id: record.id.to_string(),
        status: record.status.as_str(),
        operation,
    }
}

impl std::fmt::Debug for DeploymentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentManager")
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}
