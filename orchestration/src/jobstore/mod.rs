//! Job store contract and implementations
//!
//! The store owns the durable record of jobs and their merged findings.
//! Every operation is idempotent on the job id. The in-memory store is the
//! default; a Postgres-backed store is available behind the
//! `postgres-store` feature.

#[cfg(feature = "postgres-store")]
mod postgres;

#[cfg(feature = "postgres-store")]
pub use postgres::PostgresJobStore;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::OrchestratorError;
use crate::model::{Category, ConsensusFinding, JobId, JobStatus, ScanJob, Severity};

/// Error type for job store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job not found: {job_id}")]
    JobNotFound { job_id: JobId },

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Store serialization error: {0}")]
    Serialization(String),
}

/// Result type for job store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::JobNotFound { job_id } => OrchestratorError::not_found("job", job_id),
            other => OrchestratorError::store(other.to_string()),
        }
    }
}

/// Filter for finding listings
#[derive(Debug, Clone, Default)]
pub struct FindingFilter {
    pub severity: Option<Severity>,
    pub category: Option<Category>,
    pub tool: Option<String>,
}

impl FindingFilter {
    fn matches(&self, finding: &ConsensusFinding) -> bool {
        if let Some(severity) = self.severity {
            if finding.finding.severity != severity {
                return false;
            }
        }
        if let Some(category) = self.category {
            if finding.finding.category != category {
                return false;
            }
        }
        if let Some(tool) = &self.tool {
            if !finding.reported_by.contains(tool) {
                return false;
            }
        }
        true
    }
}

/// Durable storage for jobs and merged findings
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create or replace the job record
    async fn create_job(&self, job: &ScanJob) -> StoreResult<()>;

    async fn get_job(&self, id: &str) -> StoreResult<ScanJob>;

    /// Persist the job's current state
    async fn update_job(&self, job: &ScanJob) -> StoreResult<()>;

    /// Mark a job running, stamping `started_at`. Idempotent.
    async fn set_started(&self, id: &str) -> StoreResult<()> {
        let mut job = self.get_job(id).await?;
        if job.status == JobStatus::Running {
            return Ok(());
        }
        job.transition(JobStatus::Running)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        self.update_job(&job).await
    }

    /// Mark a job completed, stamping `completed_at`. Idempotent.
    async fn set_completed(&self, id: &str) -> StoreResult<()> {
        let mut job = self.get_job(id).await?;
        if job.status == JobStatus::Completed {
            return Ok(());
        }
        job.transition(JobStatus::Completed)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        self.update_job(&job).await
    }

    /// Mark a job failed with the given error. Idempotent.
    async fn set_failed(&self, id: &str, error: &str) -> StoreResult<()> {
        let mut job = self.get_job(id).await?;
        if job.status == JobStatus::Failed {
            return Ok(());
        }
        job.error = Some(error.to_string());
        job.transition(JobStatus::Failed)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        self.update_job(&job).await
    }

    /// Replace the merged findings for a job
    async fn create_findings(
        &self,
        job_id: &str,
        findings: &[ConsensusFinding],
    ) -> StoreResult<()>;

    async fn list_findings(
        &self,
        job_id: &str,
        filter: &FindingFilter,
    ) -> StoreResult<Vec<ConsensusFinding>>;
}

/// Process-local job store
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, ScanJob>>,
    findings: RwLock<HashMap<JobId, Vec<ConsensusFinding>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            findings: RwLock::new(HashMap::new()),
        }
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, job: &ScanJob) -> StoreResult<()> {
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &str) -> StoreResult<ScanJob> {
        self.jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::JobNotFound {
                job_id: id.to_string(),
            })
    }

    async fn update_job(&self, job: &ScanJob) -> StoreResult<()> {
        let mut jobs = self.jobs.write().await;
        if !jobs.contains_key(&job.id) {
            return Err(StoreError::JobNotFound {
                job_id: job.id.clone(),
            });
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn create_findings(
        &self,
        job_id: &str,
        findings: &[ConsensusFinding],
    ) -> StoreResult<()> {
        self.findings
            .write()
            .await
            .insert(job_id.to_string(), findings.to_vec());
        Ok(())
    }

    async fn list_findings(
        &self,
        job_id: &str,
        filter: &FindingFilter,
    ) -> StoreResult<Vec<ConsensusFinding>> {
        let findings = self.findings.read().await;
        Ok(findings
            .get(job_id)
            .map(|list| {
                list.iter()
                    .filter(|f| filter.matches(f))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
