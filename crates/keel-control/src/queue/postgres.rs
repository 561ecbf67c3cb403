//! PostgreSQL job queue implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use tracing::debug;

use crate::error::{ControlError, ControlResult};
use crate::types::{
    AppId, ArtifactRef, BuildJob, BuildTarget, DeploymentId, JobId, JobStatus, SourceLocator,
};

use super::{EnqueueOutcome, JobQueue, Requeue};

const JOB_COLUMNS: &str = "id, deployment_id, app_id, repository_url, git_ref, output, \
     build_kind, status, created_at, started_at, finished_at, retry_count, timeout_secs, \
     artifact, last_error";

/// PostgreSQL-backed job queue.
///
/// Dequeue claims a row with `FOR UPDATE SKIP LOCKED` inside a single
/// `UPDATE ... RETURNING` statement, so a crash between selecting and
/// updating leaves the row unclaimed.
#[derive(Clone)]
pub struct PostgresQueue {
    pool: PgPool,
}

impl PostgresQueue {
    /// Create a queue from an existing connection pool.
    ///
    /// The `build_jobs` table is created if it doesn't exist.
    pub async fn from_pool(pool: PgPool) -> ControlResult<Self> {
        let queue = Self { pool };
        queue.ensure_schema().await?;
        Ok(queue)
    }

    async fn ensure_schema(&self) -> ControlResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS build_jobs (
                id TEXT PRIMARY KEY,
                deployment_id TEXT NOT NULL,
                app_id TEXT NOT NULL,
                repository_url TEXT NOT NULL,
                git_ref TEXT NOT NULL,
                output TEXT NOT NULL,
                build_kind TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                started_at TIMESTAMPTZ,
                finished_at TIMESTAMPTZ,
                retry_count INTEGER NOT NULL DEFAULT 0,
                timeout_secs BIGINT,
                artifact TEXT,
                last_error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("ALTER TABLE build_jobs ADD COLUMN IF NOT EXISTS artifact TEXT")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_build_jobs_queued
            ON build_jobs (created_at, id)
            WHERE status = 'queued'
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_build_jobs_running
            ON build_jobs (started_at)
            WHERE status = 'running'
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_job(row: &PgRow) -> ControlResult<BuildJob> {
        let build_kind: String = row.get("build_kind");
        let status: String = row.get("status");
        let retry_count: i32 = row.get("retry_count");
        let timeout_secs: Option<i64> = row.get("timeout_secs");

        Ok(BuildJob {
            id: JobId::new(row.get::<String, _>("id")),
            deployment_id: DeploymentId::new(row.get::<String, _>("deployment_id")),
            app_id: AppId::new(row.get::<String, _>("app_id")),
            source: SourceLocator {
                repository_url: row.get("repository_url"),
                git_ref: row.get("git_ref"),
            },
            target: BuildTarget {
                output: row.get("output"),
                kind: build_kind.parse().map_err(ControlError::Serialisation)?,
            },
            status: status.parse().map_err(ControlError::Serialisation)?,
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            finished_at: row.get("finished_at"),
            retry_count: u32::try_from(retry_count).map_err(|_| {
                ControlError::Serialisation(format!("retry_count out of range: {retry_count}"))
            })?,
            timeout_secs: timeout_secs
                .map(u64::try_from)
                .transpose()
                .map_err(|_| ControlError::Serialisation("timeout_secs out of range".into()))?,
            artifact: row
                .get::<Option<String>, _>("artifact")
                .map(ArtifactRef::new),
            last_error: row.get("last_error"),
        })
    }

    /// Converts the job's counters to their column types.
    fn counter_columns(job: &BuildJob) -> ControlResult<(i32, Option<i64>)> {
        let retry_count = i32::try_from(job.retry_count).map_err(|_| {
            ControlError::Serialisation(format!("retry_count out of range: {}", job.retry_count))
        })?;
        let timeout_secs = job
            .timeout_secs
            .map(i64::try_from)
            .transpose()
            .map_err(|_| ControlError::Serialisation("timeout_secs out of range".into()))?;
        Ok((retry_count, timeout_secs))
    }

    async fn finish(&self, id: &JobId, status: JobStatus, error: Option<&str>) -> ControlResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE build_jobs
            SET status = $2,
                finished_at = NOW(),
                last_error = COALESCE($3, last_error)
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id.as_str())
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::JobNotFound(id.to_string()));
        }

        Ok(())
    }
}

#[async_trait]
impl JobQueue for PostgresQueue {
    async fn enqueue(&self, job: &BuildJob) -> ControlResult<EnqueueOutcome> {
        let (retry_count, timeout_secs) = Self::counter_columns(job)?;

        let result = sqlx::query(
            r#"
            INSERT INTO build_jobs (
                id, deployment_id, app_id, repository_url, git_ref, output,
                build_kind, status, created_at, retry_count, timeout_secs, artifact,
                last_error
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'queued', $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(job.id.as_str())
        .bind(job.deployment_id.as_str())
        .bind(job.app_id.as_str())
        .bind(&job.source.repository_url)
        .bind(&job.source.git_ref)
        .bind(&job.target.output)
        .bind(job.target.kind.as_str())
        .bind(job.created_at)
        .bind(retry_count)
        .bind(timeout_secs)
        .bind(job.artifact.as_ref().map(ArtifactRef::as_str))
        .bind(&job.last_error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(job_id = %job.id, "duplicate enqueue");
            return Ok(EnqueueOutcome::Conflict);
        }

        Ok(EnqueueOutcome::Enqueued)
    }

    async fn dequeue(&self) -> ControlResult<Option<BuildJob>> {
        let row = sqlx::query(&format!(
            r#"
            WITH next AS (
                SELECT id
                FROM build_jobs
                WHERE status = 'queued'
                ORDER BY created_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE build_jobs
            SET status = 'running', started_at = NOW()
            FROM next
            WHERE build_jobs.id = next.id
            RETURNING {}
            "#,
            qualified_columns()
        ))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn ack(&self, id: &JobId) -> ControlResult<()> {
        self.finish(id, JobStatus::Succeeded, None).await
    }

    async fn requeue(&self, id: &JobId, requeue: &Requeue) -> ControlResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE build_jobs
            SET status = 'queued',
                started_at = NULL,
                retry_count = retry_count + 1,
                last_error = COALESCE($2, last_error),
                build_kind = COALESCE($3, build_kind)
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id.as_str())
        .bind(&requeue.error)
        .bind(requeue.build_kind.map(|k| k.as_str()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::JobNotFound(id.to_string()));
        }

        Ok(())
    }

    async fn fail(&self, id: &JobId, error: &str) -> ControlResult<()> {
        self.finish(id, JobStatus::Failed, Some(error)).await
    }

    async fn get(&self, id: &JobId) -> ControlResult<Option<BuildJob>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM build_jobs WHERE id = $1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn running_since(&self, cutoff: DateTime<Utc>) -> ControlResult<Vec<BuildJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM build_jobs \
             WHERE status = 'running' AND started_at < $1 ORDER BY started_at"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_job).collect()
    }
}

/// Job columns prefixed with the table name, for statements that join.
fn qualified_columns() -> String {
    JOB_COLUMNS
        .split(", ")
        .map(|c| format!("build_jobs.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

impl std::fmt::Debug for PostgresQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresQueue").finish_non_exhaustive()
    }
}
