//! Dispatcher loop.
//!
//! A dispatcher claims one job at a time from the shared queue, runs it
//! through the [`RuntimeExecutor`] and reports the outcome:
//!
//! - success: ack the job, then advance the deployment to `Running`
//! - failure with retries left: wait out the backoff, then nack
//! - failure with retries exhausted: fail the job and the deployment
//! - key busy with another deployment: fail the job and the deployment
//!
//! Deploy-only jobs (rollbacks) skip the build: their deployment is already
//! `Deploying` and the executor is handed the existing artifact.
//!
//! Correctness across processes rests on the queue's claim primitive; the
//! dispatcher itself holds no cross-process state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use keel_scheduler::{NodeId, NodeRecord, NodeRegistry};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::deployment::DeploymentManager;
use crate::error::{ControlError, ControlResult};
use crate::executor::{BuildSpec, ExecutorError, RuntimeExecutor};
use crate::inflight::InFlight;
use crate::queue::{JobQueue, Requeue};
use crate::retry::{fallback_kind, RetryDecision, RetryPolicy};
use crate::state::DeploymentEvent;
use crate::types::{ArtifactRef, BuildJob, DeploymentStatus, JobId};

/// What a single poll did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// This dispatcher's node is not healthy; nothing was claimed.
    Unhealthy,
    /// The queue was empty.
    Idle,
    /// The job succeeded and its deployment is running.
    Completed {
        /// Finished job.
        job_id: JobId,
    },
    /// The job failed and was returned to the queue.
    Requeued {
        /// Requeued job.
        job_id: JobId,
        /// Backoff that was waited before requeueing.
        retry_after: Duration,
    },
    /// The job failed for the last time; its deployment is failed.
    Exhausted {
        /// Failed job.
        job_id: JobId,
    },
    /// Another deployment of the same key is in flight; the job and its
    /// deployment were failed without running.
    Rejected {
        /// Rejected job.
        job_id: JobId,
    },
    /// The job was taken out of the queue without completing its
    /// deployment (cancelled, or the deployment moved on).
    Abandoned {
        /// Abandoned job.
        job_id: JobId,
    },
}

/// Where a claimed job will be deployed.
enum Placement {
    /// Placement disabled.
    Unmanaged,
    On(NodeRecord),
    /// No healthy node has room.
    NoCapacity,
}

/// Claims and runs build jobs.
pub struct Dispatcher {
    id: usize,
    queue: Arc<dyn JobQueue>,
    manager: Arc<DeploymentManager>,
    executor: Arc<dyn RuntimeExecutor>,
    in_flight: Arc<InFlight>,
    node: Option<(Arc<NodeRegistry>, NodeId)>,
    placement: Option<Arc<NodeRegistry>>,
    retry: RetryPolicy,
    poll_interval: Duration,
    build_timeout: Duration,
}

impl Dispatcher {
    /// Create a dispatcher with default timing.
    pub fn new(
        id: usize,
        queue: Arc<dyn JobQueue>,
        manager: Arc<DeploymentManager>,
        executor: Arc<dyn RuntimeExecutor>,
    ) -> Self {
        let in_flight = Arc::clone(manager.in_flight());
        Self {
            id,
            queue,
            manager,
            executor,
            in_flight,
            node: None,
            placement: None,
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(1),
            build_timeout: Duration::from_secs(30 * 60),
        }
    }

    /// Check this node's health before each poll.
    #[must_use]
    pub fn with_node(mut self, registry: Arc<NodeRegistry>, node_id: NodeId) -> Self {
        self.node = Some((registry, node_id));
        self
    }

    /// Place each deployment on the healthy node with the most spare
    /// capacity.
    ///
    /// Without a registry the deployment is recorded against this
    /// dispatcher's own node, if any.
    #[must_use]
    pub fn with_placement(mut self, registry: Arc<NodeRegistry>) -> Self {
        self.placement = Some(registry);
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the delay between polls of an empty queue.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the default build timeout.
    #[must_use]
    pub fn with_build_timeout(mut self, build_timeout: Duration) -> Self {
        self.build_timeout = build_timeout;
        self
    }

    /// Run the dispatch loop until the token is cancelled.
    ///
    /// A build in progress at shutdown is told to stop and its job is
    /// returned to the queue.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(dispatcher_id = self.id, "dispatcher started");

        while !shutdown.is_cancelled() {
            let wait = match self.poll_once(&shutdown).await {
                Ok(PollOutcome::Idle | PollOutcome::Unhealthy) => true,
                Ok(outcome) => {
                    debug!(dispatcher_id = self.id, ?outcome, "poll finished");
                    false
                }
                Err(e) => {
                    error!(dispatcher_id = self.id, error = %e, "poll failed");
                    true
                }
            };

            if wait {
                tokio::select! {
                    biased;

                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        info!(dispatcher_id = self.id, "dispatcher stopped");
    }

    /// Claim and process at most one job.
    pub async fn poll_once(&self, shutdown: &CancellationToken) -> ControlResult<PollOutcome> {
        if !self.node_is_healthy().await {
            return Ok(PollOutcome::Unhealthy);
        }

        let Some(job) = self.with_storage_retry("dequeue", || self.queue.dequeue()).await? else {
            return Ok(PollOutcome::Idle);
        };

        info!(
            dispatcher_id = self.id,
            job_id = %job.id,
            deployment_id = %job.deployment_id,
            attempt = job.retry_count + 1,
            kind = %job.target.kind,
            deploy_only = job.is_deploy_only(),
            "claimed build job"
        );

        self.process(job, shutdown).await
    }

    async fn node_is_healthy(&self) -> bool {
        let Some((registry, node_id)) = &self.node else {
            return true;
        };

        match registry.get_details(node_id).await {
            Ok(details) if details.health.is_healthy() => true,
            Ok(details) => {
                warn!(
                    dispatcher_id = self.id,
                    node_id = %node_id,
                    heartbeat_age = ?details.heartbeat_age,
                    "node unhealthy, not claiming work"
                );
                false
            }
            Err(e) => {
                warn!(dispatcher_id = self.id, node_id = %node_id, error = %e, "node health unknown");
                false
            }
        }
    }

    fn node_id(&self) -> Option<NodeId> {
        self.node.as_ref().map(|(_, id)| id.clone())
    }

    async fn process(
        &self,
        job: BuildJob,
        shutdown: &CancellationToken,
    ) -> ControlResult<PollOutcome> {
        if let Some(outcome) = self.enter(&job).await? {
            return Ok(outcome);
        }

        let node = match self.place().await {
            Ok(Placement::Unmanaged) => None,
            Ok(Placement::On(node)) => Some(node),
            Ok(Placement::NoCapacity) => {
                let reason = "no healthy node with spare capacity";
                warn!(job_id = %job.id, "{reason}");
                return self.handle_failure(&job, reason, shutdown).await;
            }
            Err(e) => {
                self.release(&job).await;
                return Err(e);
            }
        };

        let deadline = job
            .timeout_secs
            .map_or(self.build_timeout, Duration::from_secs);
        let token = self.in_flight.register(&job.deployment_id, shutdown);
        let mut spec = BuildSpec::from(&job);
        if let Some(node) = &node {
            spec.node_id = Some(node.id.clone());
            spec.node_address = Some(node.address.clone());
        }

        let result =
            tokio::time::timeout(deadline, self.executor.execute(&spec, token.clone())).await;
        self.in_flight.remove(&job.deployment_id);

        match result {
            Ok(Ok(artifact)) => {
                let node_id = node.map(|n| n.id).or_else(|| self.node_id());
                self.complete(&job, artifact, node_id).await
            }
            Ok(Err(ExecutorError::Cancelled)) if shutdown.is_cancelled() => {
                info!(job_id = %job.id, "shutting down, returning job to queue");
                self.release(&job).await;
                Ok(PollOutcome::Requeued {
                    job_id: job.id,
                    retry_after: Duration::ZERO,
                })
            }
            Ok(Err(ExecutorError::Cancelled)) => {
                info!(job_id = %job.id, deployment_id = %job.deployment_id, "build cancelled");
                self.with_storage_retry("fail", || self.queue.fail(&job.id, "cancelled"))
                    .await?;
                Ok(PollOutcome::Abandoned { job_id: job.id })
            }
            Ok(Err(e)) => {
                warn!(job_id = %job.id, error = %e, "build failed");
                self.handle_failure(&job, &e.to_string(), shutdown).await
            }
            Err(_) => {
                let timeout = ControlError::Timeout {
                    job_id: job.id.to_string(),
                    after: deadline,
                };
                warn!(job_id = %job.id, error = %timeout, "build timed out");
                self.handle_failure(&job, &timeout.to_string(), shutdown)
                    .await
            }
        }
    }

    /// Moves the deployment into the state the job runs in.
    ///
    /// A build job moves it to `Building`. A deploy-only job expects it to
    /// be `Deploying` already. Returns an outcome when the job must not run.
    async fn enter(&self, job: &BuildJob) -> ControlResult<Option<PollOutcome>> {
        let entered = if job.is_deploy_only() {
            self.with_storage_retry("get", || self.manager.get(&job.deployment_id))
                .await
                .and_then(|current| {
                    if current.status == DeploymentStatus::Deploying {
                        Ok(())
                    } else {
                        Err(ControlError::conflict(format!(
                            "deployment {} is {}, not deploying",
                            current.id, current.status
                        )))
                    }
                })
        } else {
            let started = DeploymentEvent::BuildStarted {
                job_id: job.id.clone(),
                node_id: self.node_id(),
            };
            self.advance(job, &started).await
        };

        match entered {
            Ok(()) => Ok(None),
            Err(e) if e.is_conflict() => self.handle_not_started(job, &e).await.map(Some),
            Err(e) if e.is_not_found() => {
                warn!(job_id = %job.id, error = %e, "deployment missing, dropping job");
                let reason = e.to_string();
                self.with_storage_retry("fail", || self.queue.fail(&job.id, &reason))
                    .await?;
                Ok(Some(PollOutcome::Abandoned {
                    job_id: job.id.clone(),
                }))
            }
            Err(e) => {
                self.release(job).await;
                Err(e)
            }
        }
    }

    async fn place(&self) -> ControlResult<Placement> {
        let Some(registry) = &self.placement else {
            return Ok(Placement::Unmanaged);
        };
        let selected = self
            .with_storage_retry("select node", move || async move {
                registry.select_node().await.map_err(ControlError::from)
            })
            .await?;
        Ok(selected.map_or(Placement::NoCapacity, Placement::On))
    }

    /// The deployment refused the job.
    ///
    /// If it is still pending the key is busy with another deployment: the
    /// job and its deployment are failed with the conflict, and nothing is
    /// retried. Otherwise the deployment has moved on (cancelled, for
    /// instance) and the job is dropped.
    async fn handle_not_started(
        &self,
        job: &BuildJob,
        conflict: &ControlError,
    ) -> ControlResult<PollOutcome> {
        let current = self
            .with_storage_retry("get", || self.manager.get(&job.deployment_id))
            .await?;

        if current.status == DeploymentStatus::Pending {
            warn!(
                job_id = %job.id,
                deployment_id = %job.deployment_id,
                error = %conflict,
                "key busy, rejecting deployment"
            );
            let reason = conflict.to_string();
            self.with_storage_retry("fail", || self.queue.fail(&job.id, &reason))
                .await?;
            self.mark_failed(job, &reason).await?;
            return Ok(PollOutcome::Rejected {
                job_id: job.id.clone(),
            });
        }

        info!(
            job_id = %job.id,
            deployment_id = %job.deployment_id,
            status = %current.status,
            "deployment no longer accepts this job"
        );
        let reason = format!("deployment is {}", current.status);
        self.with_storage_retry("fail", || self.queue.fail(&job.id, &reason))
            .await?;
        Ok(PollOutcome::Abandoned {
            job_id: job.id.clone(),
        })
    }

    async fn complete(
        &self,
        job: &BuildJob,
        artifact: ArtifactRef,
        node_id: Option<NodeId>,
    ) -> ControlResult<PollOutcome> {
        self.with_storage_retry("ack", || self.queue.ack(&job.id))
            .await?;

        let mut events = Vec::with_capacity(2);
        if !job.is_deploy_only() {
            events.push(DeploymentEvent::BuildSucceeded {
                artifact: artifact.clone(),
            });
        }
        events.push(DeploymentEvent::Deployed {
            node_id: node_id.clone(),
        });

        for event in &events {
            match self.advance(job, event).await {
                Ok(()) => {}
                Err(e) if e.is_conflict() || e.is_not_found() => {
                    warn!(
                        job_id = %job.id,
                        deployment_id = %job.deployment_id,
                        error = %e,
                        "build finished but deployment moved on"
                    );
                    return Ok(PollOutcome::Abandoned {
                        job_id: job.id.clone(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        let artifact = job.artifact.as_ref().unwrap_or(&artifact);
        info!(
            job_id = %job.id,
            deployment_id = %job.deployment_id,
            artifact = %artifact,
            node_id = ?node_id,
            "deployment running"
        );
        Ok(PollOutcome::Completed {
            job_id: job.id.clone(),
        })
    }

    /// Apply `event` to the job's deployment.
    ///
    /// A conflict on a deployment already at the event's target counts as
    /// applied: a retried write may have committed before its connection
    /// failed.
    async fn advance(&self, job: &BuildJob, event: &DeploymentEvent) -> ControlResult<()> {
        let advanced = self
            .with_storage_retry("advance", || {
                self.manager.advance(&job.deployment_id, event)
            })
            .await;

        let Err(e) = advanced else {
            return Ok(());
        };
        if !e.is_conflict() {
            return Err(e);
        }

        let current = self
            .with_storage_retry("get", || self.manager.get(&job.deployment_id))
            .await?;
        if current.status == event.target() {
            debug!(
                deployment_id = %job.deployment_id,
                event = event.name(),
                "transition already applied"
            );
            return Ok(());
        }
        Err(e)
    }

    /// Fail the job's deployment, ignoring one that already finished.
    async fn mark_failed(&self, job: &BuildJob, reason: &str) -> ControlResult<()> {
        let failed = DeploymentEvent::Failed {
            reason: reason.to_owned(),
        };
        match self.advance(job, &failed).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_conflict() || e.is_not_found() => {
                debug!(deployment_id = %job.deployment_id, error = %e, "deployment already final");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_failure(
        &self,
        job: &BuildJob,
        error: &str,
        shutdown: &CancellationToken,
    ) -> ControlResult<PollOutcome> {
        match self.retry.decide(job.retry_count) {
            RetryDecision::RetryAfter(delay) => {
                warn!(
                    job_id = %job.id,
                    retry_count = job.retry_count,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "retrying build after backoff"
                );

                // The claim is held through the backoff so no other
                // dispatcher picks the job up early.
                tokio::select! {
                    biased;

                    () = shutdown.cancelled() => {}
                    () = tokio::time::sleep(delay) => {}
                }

                let requeue = Requeue {
                    error: Some(error.to_owned()),
                    build_kind: fallback_kind(job.target.kind, error),
                };
                if let Some(kind) = requeue.build_kind {
                    info!(job_id = %job.id, kind = %kind, "falling back to a different build kind");
                }

                self.with_storage_retry("nack", || self.queue.requeue(&job.id, &requeue))
                    .await?;
                Ok(PollOutcome::Requeued {
                    job_id: job.id.clone(),
                    retry_after: delay,
                })
            }
            RetryDecision::Exhausted => {
                let exhausted = ControlError::Exhausted {
                    job_id: job.id.to_string(),
                    attempts: job.retry_count.saturating_add(1),
                };
                error!(
                    job_id = %job.id,
                    deployment_id = %job.deployment_id,
                    error = %error,
                    "{exhausted}"
                );

                self.with_storage_retry("fail", || self.queue.fail(&job.id, error))
                    .await?;
                self.mark_failed(job, &format!("{exhausted}: {error}"))
                    .await?;

                Ok(PollOutcome::Exhausted {
                    job_id: job.id.clone(),
                })
            }
        }
    }

    /// Return a claimed job to the queue after an error unrelated to the build.
    async fn release(&self, job: &BuildJob) {
        if let Err(e) = self.queue.nack(&job.id).await {
            warn!(job_id = %job.id, error = %e, "failed to release job");
        }
    }

    /// Run a storage operation, retrying transient failures with the same
    /// backoff policy used for builds.
    async fn with_storage_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        mut f: F,
    ) -> ControlResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ControlResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Err(e) if e.is_transient() => match self.retry.decide(attempt) {
                    RetryDecision::RetryAfter(delay) => {
                        warn!(
                            operation,
                            attempt,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error = %e,
                            "storage unavailable, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    RetryDecision::Exhausted => return Err(e),
                },
                other => return other,
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("id", &self.id)
            .field("node_id", &self.node_id())
            .field("placement", &self.placement.is_some())
            .field("retry", &self.retry)
            .field("poll_interval", &self.poll_interval)
            .field("build_timeout", &self.build_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::deployment::DeploymentRequest;
    use crate::queue::MemoryQueue;
    use crate::store::{DeploymentFilter, DeploymentStore, MemoryStore, StatusUpdate};
    use crate::types::{
        AppId, BuildKind, BuildTarget, DeploymentId, DeploymentRecord, JobStatus, SourceLocator,
    };
    use async_trait::async_trait;
    use keel_scheduler::{
        HealthConfig, MemoryNodeStore, NodeCapacity, NodeDescriptor, NodeStore,
    };
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Executor that replays scripted results.
    #[derive(Default)]
    struct Scripted {
        results: Mutex<VecDeque<Result<ArtifactRef, ExecutorError>>>,
        seen: Mutex<Vec<BuildSpec>>,
    }

    impl Scripted {
        fn new(results: Vec<Result<ArtifactRef, ExecutorError>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RuntimeExecutor for Scripted {
        async fn execute(
            &self,
            spec: &BuildSpec,
            _cancel: CancellationToken,
        ) -> Result<ArtifactRef, ExecutorError> {
            self.seen.lock().unwrap().push(spec.clone());
            let next = self.results.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(ArtifactRef::new("sha256:default")))
        }
    }

    /// Executor that never finishes unless cancelled.
    struct Hangs;

    #[async_trait]
    impl RuntimeExecutor for Hangs {
        async fn execute(
            &self,
            _spec: &BuildSpec,
            cancel: CancellationToken,
        ) -> Result<ArtifactRef, ExecutorError> {
            cancel.cancelled().await;
            Err(ExecutorError::Cancelled)
        }
    }

    struct Harness {
        queue: Arc<MemoryQueue>,
        manager: Arc<DeploymentManager>,
    }

    fn harness() -> Harness {
        harness_with_store(Arc::new(MemoryStore::new()))
    }

    fn harness_with_store(store: Arc<dyn DeploymentStore>) -> Harness {
        let queue = Arc::new(MemoryQueue::new());
        let manager = Arc::new(DeploymentManager::new(
            store,
            Arc::clone(&queue) as Arc<dyn JobQueue>,
            Arc::new(InFlight::new()),
        ));
        Harness { queue, manager }
    }

    /// Store whose first write to `Running` commits but reports the
    /// connection as lost.
    struct LosesRunningAck {
        inner: MemoryStore,
        tripped: AtomicBool,
    }

    #[async_trait]
    impl DeploymentStore for LosesRunningAck {
        async fn insert(&self, record: &DeploymentRecord) -> ControlResult<DeploymentRecord> {
            self.inner.insert(record).await
        }
        async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
            self.inner.get(id).await
        }
        async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>> {
            self.inner.list(filter).await
        }
        async fn transition(
            &self,
            id: &DeploymentId,
            update: &StatusUpdate,
        ) -> ControlResult<DeploymentRecord> {
            let record = self.inner.transition(id, update).await?;
            if update.to == DeploymentStatus::Running && !self.tripped.swap(true, Ordering::SeqCst)
            {
                return Err(ControlError::Transient("connection reset".into()));
            }
            Ok(record)
        }
    }

    async fn registry_with(nodes: &[(&str, u32, u32)]) -> Arc<NodeRegistry> {
        let store = Arc::new(MemoryNodeStore::new());
        let registry = Arc::new(
            NodeRegistry::new(store as Arc<dyn NodeStore>, &HealthConfig::default()).unwrap(),
        );
        for &(id, load, max) in nodes {
            registry
                .register(
                    NodeDescriptor::new(id, format!("{id}.internal:7000"))
                        .with_id(NodeId::new(id))
                        .with_capacity(NodeCapacity {
                            max_concurrent: max,
                            current_load: load,
                            ..NodeCapacity::default()
                        }),
                )
                .await
                .unwrap();
        }
        registry
    }

    impl Harness {
        fn dispatcher(&self, executor: Arc<dyn RuntimeExecutor>) -> Dispatcher {
            Dispatcher::new(
                0,
                Arc::clone(&self.queue) as Arc<dyn JobQueue>,
                Arc::clone(&self.manager),
                executor,
            )
        }

        async fn create(&self, kind: BuildKind) -> (crate::types::DeploymentRecord, BuildJob) {
            self.manager
                .create(DeploymentRequest {
                    app_id: AppId::new("a"),
                    service_name: "web".to_owned(),
                    source: SourceLocator::new("https://git.example.com/a.git", "main"),
                    target: BuildTarget {
                        output: "default".to_owned(),
                        kind,
                    },
                    timeout_secs: None,
                })
                .await
                .unwrap()
        }
    }

    fn failed(msg: &str) -> Result<ArtifactRef, ExecutorError> {
        Err(ExecutorError::Failed(msg.to_owned()))
    }

    #[tokio::test]
    async fn idle_on_empty_queue() {
        let h = harness();
        let d = h.dispatcher(Scripted::new(vec![]));
        let outcome = d.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, PollOutcome::Idle);
    }

    #[tokio::test]
    async fn success_acks_and_runs_deployment() {
        let h = harness();
        let (record, job) = h.create(BuildKind::PureNix).await;
        let d = h.dispatcher(Scripted::new(vec![Ok(ArtifactRef::new("sha256:v1"))]));

        let outcome = d.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, PollOutcome::Completed { job_id: job.id.clone() });

        let stored = h.queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);

        let deployment = h.manager.get(&record.id).await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Running);
        assert_eq!(deployment.artifact, Some(ArtifactRef::new("sha256:v1")));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_requeues_with_backoff() {
        let h = harness();
        let (record, job) = h.create(BuildKind::Oci).await;
        let d = h.dispatcher(Scripted::new(vec![failed("tests failed")]));

        let before = tokio::time::Instant::now();
        let outcome = d.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Requeued {
                job_id: job.id.clone(),
                retry_after: Duration::from_secs(5),
            }
        );
        assert!(before.elapsed() >= Duration::from_secs(5));

        let stored = h.queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.last_error.unwrap().contains("tests failed"));

        let deployment = h.manager.get(&record.id).await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Building);

        // Second attempt re-enters Building and succeeds.
        let outcome = d.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, PollOutcome::Completed { job_id: job.id });
    }

    #[tokio::test(start_paused = true)]
    async fn native_failure_falls_back_to_oci() {
        let h = harness();
        let (_, job) = h.create(BuildKind::PureNix).await;
        let executor = Scripted::new(vec![failed("ld: cannot find -lssl")]);
        let d = h.dispatcher(Arc::clone(&executor) as Arc<dyn RuntimeExecutor>);

        d.poll_once(&CancellationToken::new()).await.unwrap();
        d.poll_once(&CancellationToken::new()).await.unwrap();

        let seen = executor.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].target.kind, BuildKind::PureNix);
        assert_eq!(seen[1].target.kind, BuildKind::Oci);
        assert_eq!(seen[1].attempt, 2);
        assert_eq!(seen[1].job_id, job.id);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_job_fails_deployment() {
        let h = harness();
        let (record, job) = h.create(BuildKind::Oci).await;
        let d = h
            .dispatcher(Scripted::new(vec![failed("boom"), failed("boom"), failed("boom")]))
            .with_retry(RetryPolicy::new(
                Duration::from_secs(1),
                2,
                Duration::from_secs(10),
            ));

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            outcomes.push(d.poll_once(&CancellationToken::new()).await.unwrap());
        }
        assert!(matches!(outcomes[0], PollOutcome::Requeued { .. }));
        assert!(matches!(outcomes[1], PollOutcome::Requeued { .. }));
        assert_eq!(outcomes[2], PollOutcome::Exhausted { job_id: job.id.clone() });

        let stored = h.queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.retry_count, 2);

        let deployment = h.manager.get(&record.id).await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Failed);
        assert!(deployment.error.unwrap().contains("exhausted"));

        // Never requeueable again.
        assert_eq!(
            d.poll_once(&CancellationToken::new()).await.unwrap(),
            PollOutcome::Idle
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_failure() {
        let h = harness();
        let (_, job) = h.create(BuildKind::Oci).await;
        let d = h
            .dispatcher(Arc::new(Hangs))
            .with_build_timeout(Duration::from_secs(60));

        let outcome = d.poll_once(&CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, PollOutcome::Requeued { .. }));

        let stored = h.queue.get(&job.id).await.unwrap().unwrap();
        assert!(stored.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn cancel_stops_running_build() {
        let h = harness();
        let (record, job) = h.create(BuildKind::Oci).await;
        let d = Arc::new(h.dispatcher(Arc::new(Hangs)));

        let task = {
            let d = Arc::clone(&d);
            tokio::spawn(async move { d.poll_once(&CancellationToken::new()).await })
        };

        // Wait for the build to register.
        while h.manager.in_flight().is_empty() {
            tokio::task::yield_now().await;
        }
        h.manager.cancel(&record.id).await.unwrap();

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome, PollOutcome::Abandoned { job_id: job.id.clone() });
        let stored = h.queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(h.manager.in_flight().is_empty());
    }

    #[tokio::test]
    async fn cancelled_before_claim_is_dropped() {
        let h = harness();
        let (record, job) = h.create(BuildKind::Oci).await;
        h.manager.cancel(&record.id).await.unwrap();

        let executor = Scripted::new(vec![]);
        let d = h.dispatcher(Arc::clone(&executor) as Arc<dyn RuntimeExecutor>);
        let outcome = d.poll_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, PollOutcome::Abandoned { job_id: job.id });
        assert!(executor.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_returns_job_to_queue() {
        let h = harness();
        let (_, job) = h.create(BuildKind::Oci).await;
        let d = Arc::new(h.dispatcher(Arc::new(Hangs)));
        let shutdown = CancellationToken::new();

        let task = {
            let d = Arc::clone(&d);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { d.poll_once(&shutdown).await })
        };
        while h.manager.in_flight().is_empty() {
            tokio::task::yield_now().await;
        }
        shutdown.cancel();

        let outcome = task.await.unwrap().unwrap();
        assert!(matches!(outcome, PollOutcome::Requeued { .. }));
        let stored = h.queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn unhealthy_node_claims_nothing() {
        let h = harness();
        h.create(BuildKind::Oci).await;

        let store = Arc::new(MemoryNodeStore::new());
        let registry = Arc::new(
            NodeRegistry::new(
                Arc::clone(&store) as Arc<dyn NodeStore>,
                &HealthConfig::default(),
            )
            .unwrap(),
        );

        // Unregistered node: health unknown.
        let d = h
            .dispatcher(Scripted::new(vec![]))
            .with_node(Arc::clone(&registry), NodeId::new("worker-1"));
        assert_eq!(
            d.poll_once(&CancellationToken::new()).await.unwrap(),
            PollOutcome::Unhealthy
        );
        assert_eq!(h.queue.queued_count().unwrap(), 1);

        registry
            .register(NodeDescriptor::new("worker-1", "10.0.0.1:7000").with_id(NodeId::new("worker-1")))
            .await
            .unwrap();
        assert!(matches!(
            d.poll_once(&CancellationToken::new()).await.unwrap(),
            PollOutcome::Completed { .. }
        ));
    }

    #[tokio::test]
    async fn rollback_job_deploys_without_building() {
        let h = harness();
        let (v1, _) = h.create(BuildKind::Oci).await;
        let executor = Scripted::new(vec![
            Ok(ArtifactRef::new("sha256:v1")),
            Ok(ArtifactRef::new("sha256:v2")),
        ]);
        let d = h.dispatcher(Arc::clone(&executor) as Arc<dyn RuntimeExecutor>);
        d.poll_once(&CancellationToken::new()).await.unwrap();
        let (v2, _) = h.create(BuildKind::Oci).await;
        d.poll_once(&CancellationToken::new()).await.unwrap();

        let rolled = h.manager.rollback(&v1.id).await.unwrap();
        let job_id = rolled.build_job_id.clone().unwrap();

        let outcome = d.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, PollOutcome::Completed { job_id: job_id.clone() });

        let seen = executor.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2].artifact, Some(ArtifactRef::new("sha256:v1")));

        let rolled = h.manager.get(&rolled.id).await.unwrap();
        assert_eq!(rolled.status, DeploymentStatus::Running);
        assert_eq!(rolled.artifact, Some(ArtifactRef::new("sha256:v1")));
        assert_eq!(
            h.manager.get(&v2.id).await.unwrap().status,
            DeploymentStatus::RolledBack
        );
        assert_eq!(
            h.queue.get(&job_id).await.unwrap().unwrap().status,
            JobStatus::Succeeded
        );

        // The key is free for the next deployment.
        let (next, _) = h.create(BuildKind::Oci).await;
        assert!(matches!(
            d.poll_once(&CancellationToken::new()).await.unwrap(),
            PollOutcome::Completed { .. }
        ));
        assert_eq!(
            h.manager.get(&next.id).await.unwrap().status,
            DeploymentStatus::Running
        );
    }

    #[tokio::test]
    async fn rollback_job_for_cancelled_deployment_is_dropped() {
        let h = harness();
        let (v1, _) = h.create(BuildKind::Oci).await;
        let executor = Scripted::new(vec![]);
        let d = h.dispatcher(Arc::clone(&executor) as Arc<dyn RuntimeExecutor>);
        d.poll_once(&CancellationToken::new()).await.unwrap();

        let rolled = h.manager.rollback(&v1.id).await.unwrap();
        h.manager.cancel(&rolled.id).await.unwrap();

        let outcome = d.poll_once(&CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, PollOutcome::Abandoned { .. }));
        assert_eq!(executor.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_key_rejects_without_retry() {
        let h = harness();
        let (first, first_job) = h.create(BuildKind::Oci).await;
        let (second, second_job) = h.create(BuildKind::Oci).await;

        // Another worker is building the first deployment.
        let claimed = h.queue.dequeue().await.unwrap().unwrap();
        assert_eq!(claimed.id, first_job.id);
        h.manager
            .advance(
                &first.id,
                &DeploymentEvent::BuildStarted {
                    job_id: first_job.id.clone(),
                    node_id: None,
                },
            )
            .await
            .unwrap();

        let executor = Scripted::new(vec![]);
        let d = h.dispatcher(Arc::clone(&executor) as Arc<dyn RuntimeExecutor>);
        let before = tokio::time::Instant::now();
        let outcome = d.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Rejected {
                job_id: second_job.id.clone()
            }
        );
        assert_eq!(before.elapsed(), Duration::ZERO);
        assert!(executor.seen.lock().unwrap().is_empty());

        let stored = h.queue.get(&second_job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.retry_count, 0);

        let rejected = h.manager.get(&second.id).await.unwrap();
        assert_eq!(rejected.status, DeploymentStatus::Failed);
        assert!(rejected.error.unwrap().contains("conflict"));

        assert_eq!(
            h.manager.get(&first.id).await.unwrap().status,
            DeploymentStatus::Building
        );
    }

    #[tokio::test(start_paused = true)]
    async fn replayed_transition_counts_as_applied() {
        let h = harness_with_store(Arc::new(LosesRunningAck {
            inner: MemoryStore::new(),
            tripped: AtomicBool::new(false),
        }));
        let (record, job) = h.create(BuildKind::Oci).await;
        let d = h.dispatcher(Scripted::new(vec![Ok(ArtifactRef::new("sha256:v1"))]));

        let outcome = d.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, PollOutcome::Completed { job_id: job.id });

        let deployment = h.manager.get(&record.id).await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Running);
    }

    #[tokio::test]
    async fn placement_picks_node_with_room() {
        let h = harness();
        let (record, _) = h.create(BuildKind::Oci).await;
        let registry = registry_with(&[("full", 4, 4), ("busy", 3, 4), ("spare", 1, 4)]).await;

        let executor = Scripted::new(vec![]);
        let d = h
            .dispatcher(Arc::clone(&executor) as Arc<dyn RuntimeExecutor>)
            .with_placement(registry);
        assert!(matches!(
            d.poll_once(&CancellationToken::new()).await.unwrap(),
            PollOutcome::Completed { .. }
        ));

        let seen = executor.seen.lock().unwrap().clone();
        assert_eq!(seen[0].node_id, Some(NodeId::new("spare")));
        assert_eq!(seen[0].node_address.as_deref(), Some("spare.internal:7000"));

        let deployment = h.manager.get(&record.id).await.unwrap();
        assert_eq!(deployment.node_id, Some(NodeId::new("spare")));
    }

    #[tokio::test(start_paused = true)]
    async fn placement_without_capacity_backs_off() {
        let h = harness();
        let (record, job) = h.create(BuildKind::Oci).await;
        let registry = registry_with(&[("full", 2, 2)]).await;

        let executor = Scripted::new(vec![]);
        let d = h
            .dispatcher(Arc::clone(&executor) as Arc<dyn RuntimeExecutor>)
            .with_placement(registry);
        let outcome = d.poll_once(&CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, PollOutcome::Requeued { .. }));
        assert!(executor.seen.lock().unwrap().is_empty());

        let stored = h.queue.get(&job.id).await.unwrap().unwrap();
        assert!(stored.last_error.unwrap().contains("spare capacity"));
        assert_eq!(
            h.manager.get(&record.id).await.unwrap().status,
            DeploymentStatus::Building
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_exits_on_shutdown() {
        let h = harness();
        let d = h
            .dispatcher(Scripted::new(vec![]))
            .with_poll_interval(Duration::from_millis(100));
        let shutdown = CancellationToken::new();

        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { d.run(shutdown).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
