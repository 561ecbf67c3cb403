//! Test fixtures and builders.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use keel_control::{
    AppId, ArtifactRef, BuildJob, BuildKind, BuildSpec, BuildTarget, DeploymentId,
    DeploymentRequest, ExecutorError, RuntimeExecutor, SourceLocator,
};
use tokio_util::sync::CancellationToken;

/// Builder for deployment requests.
pub struct RequestBuilder {
    app_id: String,
    service_name: String,
    git_ref: String,
    kind: BuildKind,
    timeout_secs: Option<u64>,
}

impl RequestBuilder {
    pub fn new(app_id: &str, service_name: &str) -> Self {
        Self {
            app_id: app_id.to_owned(),
            service_name: service_name.to_owned(),
            git_ref: "main".to_owned(),
            kind: BuildKind::Oci,
            timeout_secs: None,
        }
    }

    pub fn with_ref(mut self, git_ref: &str) -> Self {
        self.git_ref = git_ref.to_owned();
        self
    }

    pub fn with_kind(mut self, kind: BuildKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn build(self) -> DeploymentRequest {
        DeploymentRequest {
            app_id: AppId::new(self.app_id.clone()),
            service_name: self.service_name,
            source: SourceLocator::new(
                format!("https://git.example.com/{}.git", self.app_id),
                self.git_ref,
            ),
            target: BuildTarget {
                output: "default".to_owned(),
                kind: self.kind,
            },
            timeout_secs: self.timeout_secs,
        }
    }
}

/// A standalone queued job, not linked to any stored deployment.
pub fn job(app_id: &str) -> BuildJob {
    BuildJob::new(
        DeploymentId::generate(),
        AppId::new(app_id),
        SourceLocator::new(format!("https://git.example.com/{app_id}.git"), "main"),
        BuildTarget {
            output: "default".to_owned(),
            kind: BuildKind::Oci,
        },
    )
}

/// Executor that replays scripted results, then succeeds.
///
/// Deploy-only specs succeed with the artifact they carry.
#[derive(Default)]
pub struct ScriptedExecutor {
    results: Mutex<VecDeque<Result<ArtifactRef, ExecutorError>>>,
    calls: Mutex<Vec<BuildSpec>>,
}

impl ScriptedExecutor {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(times: usize, message: &str) -> Arc<Self> {
        let results = (0..times)
            .map(|_| Err(ExecutorError::Failed(message.to_owned())))
            .collect();
        Arc::new(Self {
            results: Mutex::new(results),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<BuildSpec> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RuntimeExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        spec: &BuildSpec,
        _cancel: CancellationToken,
    ) -> Result<ArtifactRef, ExecutorError> {
        self.calls.lock().unwrap().push(spec.clone());
        let next = self.results.lock().unwrap().pop_front();
        next.unwrap_or_else(|| {
            Ok(spec
                .artifact
                .clone()
                .unwrap_or_else(|| ArtifactRef::new(format!("sha256:{}", spec.job_id))))
        })
    }
}
