//! PostgreSQL node store implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;

use crate::error::{Result, SchedulerError};
use crate::registry::{HeartbeatMetrics, NodeCapacity, NodeId, NodeRecord};

use super::NodeStore;

const NODE_COLUMNS: &str = "id, hostname, address, max_concurrent, current_load, cpu_available, \
     memory_available_mb, disk_available_mb, last_heartbeat, registered_at";

/// PostgreSQL-backed node store.
#[derive(Clone)]
pub struct PostgresNodeStore {
    pool: PgPool,
}

impl PostgresNodeStore {
    /// Create a store from an existing connection pool.
    ///
    /// The `nodes` table is created if it doesn't exist.
    pub async fn from_pool(pool: PgPool) -> Result<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                hostname TEXT NOT NULL,
                address TEXT NOT NULL,
                max_concurrent BIGINT NOT NULL,
                current_load BIGINT NOT NULL DEFAULT 0,
                cpu_available DOUBLE PRECISION NOT NULL DEFAULT 0,
                memory_available_mb BIGINT NOT NULL DEFAULT 0,
                disk_available_mb BIGINT NOT NULL DEFAULT 0,
                last_heartbeat TIMESTAMPTZ NOT NULL,
                registered_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_nodes_last_heartbeat
            ON nodes (last_heartbeat)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_record(row: &PgRow) -> Result<NodeRecord> {
        Ok(NodeRecord {
            id: NodeId::new(row.get::<String, _>("id")),
            hostname: row.get("hostname"),
            address: row.get("address"),
            capacity: NodeCapacity {
                max_concurrent: from_db(row.get("max_concurrent"), "max_concurrent")?,
                current_load: from_db(row.get("current_load"), "current_load")?,
                cpu_available: row.get("cpu_available"),
                memory_available_mb: from_db(
                    row.get("memory_available_mb"),
                    "memory_available_mb",
                )?,
                disk_available_mb: from_db(row.get("disk_available_mb"), "disk_available_mb")?,
            },
            last_heartbeat: row.get("last_heartbeat"),
            registered_at: row.get("registered_at"),
        })
    }
}

fn from_db<T: TryFrom<i64>>(value: i64, column: &str) -> Result<T> {
    T::try_from(value)
        .map_err(|_| SchedulerError::Serialisation(format!("{column} out of range: {value}")))
}

fn to_db<T: TryInto<i64>>(value: T, column: &str) -> Result<i64> {
    value
        .try_into()
        .map_err(|_| SchedulerError::Serialisation(format!("{column} out of range")))
}

#[async_trait]
impl NodeStore for PostgresNodeStore {
    async fn upsert(&self, record: &NodeRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO nodes (
                id, hostname, address, max_concurrent, current_load, cpu_available,
                memory_available_mb, disk_available_mb, last_heartbeat, registered_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE
            SET hostname = EXCLUDED.hostname,
                address = EXCLUDED.address,
                max_concurrent = EXCLUDED.max_concurrent,
                current_load = EXCLUDED.current_load,
                cpu_available = EXCLUDED.cpu_available,
                memory_available_mb = EXCLUDED.memory_available_mb,
                disk_available_mb = EXCLUDED.disk_available_mb,
                last_heartbeat = EXCLUDED.last_heartbeat
            "#,
        )
        .bind(record.id.as_str())
        .bind(&record.hostname)
        .bind(&record.address)
        .bind(i64::from(record.capacity.max_concurrent))
        .bind(i64::from(record.capacity.current_load))
        .bind(record.capacity.cpu_available)
        .bind(to_db(record.capacity.memory_available_mb, "memory_available_mb")?)
        .bind(to_db(record.capacity.disk_available_mb, "disk_available_mb")?)
        .bind(record.last_heartbeat)
        .bind(record.registered_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn heartbeat(
        &self,
        id: &NodeId,
        metrics: &HeartbeatMetrics,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE nodes
            SET current_load = $2,
                max_concurrent = COALESCE($3, max_concurrent),
                cpu_available = $4,
                memory_available_mb = $5,
                disk_available_mb = $6,
                last_heartbeat = $7
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .bind(i64::from(metrics.current_load))
        .bind(metrics.max_concurrent.map(i64::from))
        .bind(metrics.cpu_available)
        .bind(to_db(metrics.memory_available_mb, "memory_available_mb")?)
        .bind(to_db(metrics.disk_available_mb, "disk_available_mb")?)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::NodeNotFound(id.to_string()));
        }

        Ok(())
    }

    async fn get(&self, id: &NodeId) -> Result<Option<NodeRecord>> {
        let row = sqlx::query(&format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = $1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn list(&self) -> Result<Vec<NodeRecord>> {
        let rows = sqlx::query(&format!("SELECT {NODE_COLUMNS} FROM nodes ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn list_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<NodeRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE last_heartbeat >= $1 ORDER BY id"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }
}

impl std::fmt::Debug for PostgresNodeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresNodeStore").finish_non_exhaustive()
    }
}
