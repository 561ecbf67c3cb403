//! Runtime executor boundary.
//!
//! The control plane never builds or runs anything itself. A dispatcher
//! hands each claimed job to a [`RuntimeExecutor`] and records what comes
//! back. Executors must tolerate being invoked again with the same spec.

use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use keel_scheduler::NodeId;

use crate::types::{AppId, ArtifactRef, BuildJob, BuildTarget, DeploymentId, JobId, SourceLocator};

/// What an executor is asked to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Job being executed.
    pub job_id: JobId,
    /// Deployment the build is for.
    pub deployment_id: DeploymentId,
    /// Owning application.
    pub app_id: AppId,
    /// Source to build.
    pub source: SourceLocator,
    /// Output to produce.
    pub target: BuildTarget,
    /// Attempt number, starting at 1.
    pub attempt: u32,
    /// Artifact to deploy as-is instead of building `source`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRef>,
    /// Node chosen to run the deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    /// Address of the chosen node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_address: Option<String>,
}

impl From<&BuildJob> for BuildSpec {
    fn from(job: &BuildJob) -> Self {
        Self {
            job_id: job.id.clone(),
            deployment_id: job.deployment_id.clone(),
            app_id: job.app_id.clone(),
            source: job.source.clone(),
            target: job.target.clone(),
            attempt: job.retry_count.saturating_add(1),
            artifact: job.artifact.clone(),
            node_id: None,
            node_address: None,
        }
    }
}

/// Executor failures.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The build ran and failed.
    #[error("build failed: {0}")]
    Failed(String),

    /// The build was told to stop.
    #[error("build cancelled")]
    Cancelled,

    /// The executor could not be started.
    #[error("executor unavailable: {0}")]
    Unavailable(String),
}

/// Performs builds and deploys on behalf of a dispatcher.
#[async_trait]
pub trait RuntimeExecutor: Send + Sync {
    /// Execute a build, returning the artifact it produced.
    ///
    /// When `spec.artifact` is set the build is skipped and that artifact is
    /// deployed and returned.
    ///
    /// Implementations should stop promptly once `cancel` fires and return
    /// [`ExecutorError::Cancelled`].
    async fn execute(
        &self,
        spec: &BuildSpec,
        cancel: CancellationToken,
    ) -> Result<ArtifactRef, ExecutorError>;
}

/// Runs an external program per build.
///
/// The spec is written to the program's stdin as JSON. The last non-empty
/// line of stdout is the artifact reference. A non-zero exit fails the build
/// with the tail of stderr as the message.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

/// Lines of stderr kept for a failure message.
const STDERR_TAIL_LINES: usize = 20;

impl CommandExecutor {
    /// Create an executor that runs `program` with `args`.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl RuntimeExecutor for CommandExecutor {
    async fn execute(
        &self,
        spec: &BuildSpec,
        cancel: CancellationToken,
    ) -> Result<ArtifactRef, ExecutorError> {
        let input = serde_json::to_vec(spec)
            .map_err(|e| ExecutorError::Unavailable(format!("failed to encode spec: {e}")))?;

        let mut cmd = TokioCommand::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(job_id = %spec.job_id, program = %self.program, "spawning executor");

        let mut child = cmd.spawn().map_err(|e| {
            ExecutorError::Unavailable(format!("failed to spawn {}: {e}", self.program))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            // The program may exit without reading its input.
            if let Err(e) = stdin.write_all(&input).await {
                debug!(job_id = %spec.job_id, error = %e, "executor did not read spec");
            }
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_task = tokio::spawn(async move {
            let mut last = None;
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        last = Some(line);
                    }
                }
            }
            last
        });

        let stderr_task = tokio::spawn(async move {
            let mut tail = std::collections::VecDeque::with_capacity(STDERR_TAIL_LINES);
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
            Vec::from(tail).join("\n")
        });

        let status = tokio::select! {
            () = cancel.cancelled() => {
                warn!(job_id = %spec.job_id, "build cancelled, killing executor");
                child.kill().await.ok();
                return Err(ExecutorError::Cancelled);
            }
            status = child.wait() => status
                .map_err(|e| ExecutorError::Unavailable(format!("process error: {e}")))?,
        };

        let artifact = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let exit_code = status.code().unwrap_or(-1);
            return Err(ExecutorError::Failed(format!(
                "exit code {exit_code}: {stderr}"
            )));
        }

        artifact
            .map(|line| ArtifactRef::new(line.trim()))
            .ok_or_else(|| ExecutorError::Failed("executor reported no artifact".to_owned()))
    }
}
