//! PostgreSQL deployment store implementation.

use async_trait::async_trait;
use keel_scheduler::NodeId;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use tracing::debug;

use crate::error::{ControlError, ControlResult};
use crate::types::{
    AppId, ArtifactRef, DeploymentId, DeploymentRecord, DeploymentStatus, JobId,
};

use super::{DeploymentFilter, DeploymentStore, StatusUpdate};

const DEPLOYMENT_COLUMNS: &str = "id, app_id, service_name, version, status, build_job_id, \
     node_id, artifact, previous_deployment_id, error, created_at, updated_at";

/// Unique constraint on (app_id, service_name, version).
const VERSION_CONSTRAINT: &str = "deployments_key_version";

/// Attempts at assigning a version before concurrent inserts are reported.
const INSERT_ATTEMPTS: usize = 3;

/// PostgreSQL-backed deployment store.
///
/// The one-active-deployment-per-key rule is a partial unique index over
/// `(app_id, service_name) WHERE status IN ('building', 'deploying')`, so a
/// losing transition surfaces as a unique violation and maps to `Conflict`.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a store from an existing connection pool.
    ///
    /// The `deployments` table is created if it doesn't exist.
    pub async fn from_pool(pool: PgPool) -> ControlResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> ControlResult<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                app_id TEXT NOT NULL,
                service_name TEXT NOT NULL,
                version INTEGER NOT NULL,
                status TEXT NOT NULL,
                build_job_id TEXT,
                node_id TEXT,
                artifact TEXT,
                previous_deployment_id TEXT REFERENCES deployments(id),
                error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CONSTRAINT {VERSION_CONSTRAINT} UNIQUE (app_id, service_name, version)
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_deployments_one_active
            ON deployments (app_id, service_name)
            WHERE status IN ('building', 'deploying')
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_deployments_created_at
            ON deployments (created_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_record(row: &PgRow) -> ControlResult<DeploymentRecord> {
        let status: String = row.get("status");
        let version: i32 = row.get("version");

        Ok(DeploymentRecord {
            id: DeploymentId::new(row.get::<String, _>("id")),
            app_id: AppId::new(row.get::<String, _>("app_id")),
            service_name: row.get("service_name"),
            version: u32::try_from(version).map_err(|_| {
                ControlError::Serialisation(format!("version out of range: {version}"))
            })?,
            status: status.parse().map_err(|e| {
                ControlError::Serialisation(format!("failed to parse status '{status}': {e}"))
            })?,
            build_job_id: row.get::<Option<String>, _>("build_job_id").map(JobId::new),
            node_id: row.get::<Option<String>, _>("node_id").map(NodeId::new),
            artifact: row.get::<Option<String>, _>("artifact").map(ArtifactRef::new),
            previous_deployment_id: row
                .get::<Option<String>, _>("previous_deployment_id")
                .map(DeploymentId::new),
            error: row.get("error"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    async fn try_insert(&self, record: &DeploymentRecord) -> Result<PgRow, sqlx::Error> {
        sqlx::query(&format!(
            r#"
            INSERT INTO deployments (
                id, app_id, service_name, version, status, build_job_id, node_id,
                artifact, previous_deployment_id, error, created_at, updated_at
            )
            SELECT $1, $2, $3, COALESCE(MAX(version), 0) + 1, $4, $5, $6, $7, $8, $9, $10, $11
            FROM deployments
            WHERE app_id = $2 AND service_name = $3
            RETURNING {DEPLOYMENT_COLUMNS}
            "#
        ))
        .bind(record.id.as_str())
        .bind(record.app_id.as_str())
        .bind(&record.service_name)
        .bind(record.status.as_str())
        .bind(record.build_job_id.as_ref().map(JobId::as_str))
        .bind(record.node_id.as_ref().map(NodeId::as_str))
        .bind(record.artifact.as_ref().map(ArtifactRef::as_str))
        .bind(record.previous_deployment_id.as_ref().map(DeploymentId::as_str))
        .bind(&record.error)
        .bind(record.created_at)
        .bind(record.updated_at)
        .fetch_one(&self.pool)
        .await
    }
}

fn is_version_race(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.constraint() == Some(VERSION_CONSTRAINT)
    )
}

#[async_trait]
impl DeploymentStore for PostgresStore {
    async fn insert(&self, record: &DeploymentRecord) -> ControlResult<DeploymentRecord> {
        let mut attempt = 1;
        loop {
            match self.try_insert(record).await {
                Ok(row) => return Self::row_to_record(&row),
                Err(e) if is_version_race(&e) && attempt < INSERT_ATTEMPTS => {
                    debug!(deployment_id = %record.id, attempt, "version taken, retrying insert");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>> {
        let mut query = format!("SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE 1=1");
        let mut params: Vec<String> = Vec::new();

        if let Some(ref app_id) = filter.app_id {
            params.push(app_id.as_str().to_owned());
            query.push_str(&format!(" AND app_id = ${}", params.len()));
        }

        if let Some(ref service_name) = filter.service_name {
            params.push(service_name.clone());
            query.push_str(&format!(" AND service_name = ${}", params.len()));
        }

        if let Some(status) = filter.status {
            params.push(status.as_str().to_owned());
            query.push_str(&format!(" AND status = ${}", params.len()));
        }

        query.push_str(" ORDER BY created_at DESC, id DESC");

        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }

        if let Some(offset) = filter.offset {
            query.push_str(&format!(" OFFSET {offset}"));
        }

        let mut sqlx_query = sqlx::query(&query);
        for param in &params {
            sqlx_query = sqlx_query.bind(param);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn transition(
        &self,
        id: &DeploymentId,
        update: &StatusUpdate,
    ) -> ControlResult<DeploymentRecord> {
        let from: Vec<&str> = update.from.iter().map(DeploymentStatus::as_str).collect();

        let row = sqlx::query(&format!(
            r#"
            UPDATE deployments
            SET status = $2,
                artifact = COALESCE($3, artifact),
                node_id = COALESCE($4, node_id),
                error = COALESCE($5, error),
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($6)
            RETURNING {DEPLOYMENT_COLUMNS}
            "#
        ))
        .bind(id.as_str())
        .bind(update.to.as_str())
        .bind(update.artifact.as_ref().map(ArtifactRef::as_str))
        .bind(update.node_id.as_ref().map(NodeId::as_str))
        .bind(&update.error)
        .bind(&from)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Self::row_to_record(&row);
        }

        match self.get(id).await? {
            None => Err(ControlError::DeploymentNotFound(id.to_string())),
            Some(current) => Err(ControlError::conflict(format!(
                "deployment {id} is {}, expected one of {:?}",
                current.status, update.from
            ))),
        }
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;
    use std::sync::Arc;

    use DeploymentStatus::{Building, Deploying, Pending};

    async fn connect() -> PostgresStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL not set");
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(&url)
            .await
            .expect("failed to connect");
        PostgresStore::from_pool(pool).await.expect("schema")
    }

    fn record(app: &AppId) -> DeploymentRecord {
        DeploymentRecord::new(app.clone(), "web")
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn insert_assigns_versions() {
        let store = connect().await;
        let app = AppId::new(format!("app-{}", DeploymentId::generate()));

        let first = store.insert(&record(&app)).await.unwrap();
        let second = store.insert(&record(&app)).await.unwrap();

        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(
            store.get(&first.id).await.unwrap().unwrap().status,
            DeploymentStatus::Pending
        );
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn transition_status_mismatch_is_conflict() {
        let store = connect().await;
        let app = AppId::new(format!("app-{}", DeploymentId::generate()));
        let r = store.insert(&record(&app)).await.unwrap();

        let err = store
            .transition(&r.id, &StatusUpdate::new(&[Building], Deploying))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let err = store
            .transition(
                &DeploymentId::generate(),
                &StatusUpdate::new(&[Pending], Building),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::DeploymentNotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn concurrent_deploying_one_wins() {
        let store = Arc::new(connect().await);
        let app = AppId::new(format!("app-{}", DeploymentId::generate()));
        let a = store.insert(&record(&app)).await.unwrap();
        let b = store.insert(&record(&app)).await.unwrap();

        let mut handles = Vec::new();
        for id in [a.id, b.id] {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .transition(&id, &StatusUpdate::new(&[Pending], Deploying))
                    .await
            }));
        }

        let mut wins = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(e) => assert!(e.is_conflict(), "unexpected error: {e}"),
            }
        }
        assert_eq!(wins, 1);
    }
}
