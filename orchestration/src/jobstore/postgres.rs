//! Postgres-backed job store
//!
//! Jobs and findings are stored as JSON documents keyed by job id, which
//! keeps the store schema-stable while the model evolves. Upserts make
//! every operation idempotent on id.

use async_trait::async_trait;
use tokio_postgres::{Client, NoTls};
use tracing::error;

use super::{FindingFilter, JobStore, StoreError, StoreResult};
use crate::model::{ConsensusFinding, ScanJob};

/// Job store over a Postgres connection
pub struct PostgresJobStore {
    client: Client,
}

impl PostgresJobStore {
    /// Connect and spawn the connection driver task.
    pub async fn connect(conn_str: &str) -> StoreResult<Self> {
        let (client, connection) = tokio_postgres::connect(conn_str, NoTls)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "postgres connection terminated");
            }
        });

        let store = Self { client };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> StoreResult<()> {
        self.client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS scan_jobs (
                     id TEXT PRIMARY KEY,
                     payload TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS scan_findings (
                     job_id TEXT PRIMARY KEY,
                     payload TEXT NOT NULL
                 );",
            )
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn upsert_job(&self, job: &ScanJob) -> StoreResult<()> {
        let payload = serde_json::to_string(job)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.client
            .execute(
                "INSERT INTO scan_jobs (id, payload) VALUES ($1, $2)
                 ON CONFLICT (id) DO UPDATE SET payload = EXCLUDED.payload",
                &[&job.id, &payload],
            )
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn create_job(&self, job: &ScanJob) -> StoreResult<()> {
        self.upsert_job(job).await
    }

    async fn get_job(&self, id: &str) -> StoreResult<ScanJob> {
        let row = self
            .client
            .query_opt("SELECT payload FROM scan_jobs WHERE id = $1", &[&id])
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .ok_or_else(|| StoreError::JobNotFound {
                job_id: id.to_string(),
            })?;

        let payload: String = row.get(0);
        serde_json::from_str(&payload).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    async fn update_job(&self, job: &ScanJob) -> StoreResult<()> {
        self.upsert_job(job).await
    }

    async fn create_findings(
        &self,
        job_id: &str,
        findings: &[ConsensusFinding],
    ) -> StoreResult<()> {
        let payload = serde_json::to_string(findings)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.client
            .execute(
                "INSERT INTO scan_findings (job_id, payload) VALUES ($1, $2)
                 ON CONFLICT (job_id) DO UPDATE SET payload = EXCLUDED.payload",
                &[&job_id, &payload],
            )
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn list_findings(
        &self,
        job_id: &str,
        filter: &FindingFilter,
    ) -> StoreResult<Vec<ConsensusFinding>> {
        let row = self
            .client
            .query_opt(
                "SELECT payload FROM scan_findings WHERE job_id = $1",
                &[&job_id],
            )
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let findings: Vec<ConsensusFinding> = match row {
            Some(row) => {
                let payload: String = row.get(0);
                serde_json::from_str(&payload)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?
            }
            None => Vec::new(),
        };

        Ok(findings.into_iter().filter(|f| filter.matches(f)).collect())
    }
}
