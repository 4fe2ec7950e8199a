//! `PostgreSQL` [`PersistenceBackend`] built on `sqlx`.
//!
//! Instances live in `{schema}.workflow_instances`. Instance creation uses
//! `INSERT .. ON CONFLICT DO NOTHING` and reports a zero-row insert as
//! [`BackendError::InstanceAlreadyExists`], so duplicate starts never
//! overwrite an existing instance.

use std::time::Duration;

use async_trait::async_trait;
use b2b_router_core::InstanceId;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use super::backend::{BackendError, InstanceRecord, InstanceStatus, PersistenceBackend};
use crate::config::BackendSettings;

/// Pool-backed instance store.
#[derive(Debug, Clone)]
pub struct PostgresBackend {
    pool: PgPool,
    table: String,
}

impl PostgresBackend {
    /// Creates a lazily connecting pool; no connection is opened until first use.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the URL is missing or cannot be parsed.
    pub fn connect_lazy(settings: &BackendSettings) -> Result<Self, BackendError> {
        let url = settings
            .postgres_url
            .as_deref()
            .ok_or_else(|| BackendError::Internal("postgres_url is not set".to_string()))?;
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(Duration::from_millis(settings.acquire_timeout_ms))
            .connect_lazy(url)
            .map_err(|e| BackendError::Internal(e.to_string()))?;
        Ok(Self {
            pool,
            table: format!("{}.workflow_instances", settings.postgres_options_schema),
        })
    }

    fn decode(row: &PgRow) -> Result<InstanceRecord, BackendError> {
        let label: String = row.try_get("status").map_err(map_sqlx)?;
        let status = InstanceStatus::from_label(&label)
            .ok_or_else(|| BackendError::Internal(format!("unknown instance status {label}")))?;
        Ok(InstanceRecord {
            instance_id: InstanceId::new(row.try_get::<String, _>("instance_id").map_err(map_sqlx)?),
            workflow: row.try_get::<String, _>("workflow").map_err(map_sqlx)?.into(),
            input: row.try_get::<Value, _>("input").map_err(map_sqlx)?,
            status,
            error: row.try_get("error").map_err(map_sqlx)?,
        })
    }
}

/// Connection-level failures are transient; everything else is internal.
fn map_sqlx(err: sqlx::Error) -> BackendError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => BackendError::Unavailable(err.to_string()),
        other => BackendError::Internal(other.to_string()),
    }
}

#[async_trait]
impl PersistenceBackend for PostgresBackend {
    async fn initialize(&self) -> Result<(), BackendError> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                instance_id TEXT PRIMARY KEY,
                workflow TEXT NOT NULL,
                input JSONB NOT NULL,
                status TEXT NOT NULL,
                error TEXT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
            self.table
        );
        sqlx::query(&ddl).execute(&self.pool).await.map_err(map_sqlx)?;
        info!(table = %self.table, "postgres backend initialized");
        Ok(())
    }

    async fn create_instance(&self, record: InstanceRecord) -> Result<(), BackendError> {
        let sql = format!(
            "INSERT INTO {} (instance_id, workflow, input, status, error)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (instance_id) DO NOTHING",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(record.instance_id.as_str())
            .bind(record.workflow.as_str())
            .bind(&record.input)
            .bind(record.status.as_str())
            .bind(&record.error)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(BackendError::InstanceAlreadyExists(record.instance_id));
        }
        Ok(())
    }

    async fn update_status(
        &self,
        instance_id: &InstanceId,
        status: InstanceStatus,
        error: Option<String>,
    ) -> Result<(), BackendError> {
        let sql = format!(
            "UPDATE {} SET status = $2, error = $3, updated_at = now() WHERE instance_id = $1",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(instance_id.as_str())
            .bind(status.as_str())
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(BackendError::NotFound(instance_id.clone()));
        }
        Ok(())
    }

    async fn load_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<InstanceRecord>, BackendError> {
        let sql = format!(
            "SELECT instance_id, workflow, input, status, error FROM {} WHERE instance_id = $1",
            self.table
        );
        let row = sqlx::query(&sql)
            .bind(instance_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn pending_instances(&self) -> Result<Vec<InstanceRecord>, BackendError> {
        let sql = format!(
            "SELECT instance_id, workflow, input, status, error FROM {}
             WHERE status IN ('pending', 'running') ORDER BY created_at",
            self.table
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(Self::decode).collect()
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.pool.close().await;
        Ok(())
    }
}
