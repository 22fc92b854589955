//! Scan requests, jobs, and the job lifecycle state machine

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, OrchestratorResult};

/// Unique identifier for scan jobs
pub type JobId = String;

/// Queueing priority for a scan job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// All lanes in strict dequeue order (highest first)
    pub fn lanes() -> &'static [Priority] {
        &[Priority::High, Priority::Medium, Priority::Low]
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// A request to scan a source repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRequest {
    /// Repository locator: URL or local path
    pub repo: String,
    /// Branch to scan
    pub branch: String,
    /// Commit to scan; resolved from `branch` when absent
    pub commit: Option<String>,
    /// Baseline commit for incremental scanning
    pub prior_commit: Option<String>,
    /// Requesting principal, recorded on the job
    pub principal: String,
    /// Requested agent ids; empty means every registered agent
    pub agents: Vec<String>,
    pub priority: Priority,
    /// Whether the caller allows an incremental plan
    pub incremental: bool,
    /// Overall wall-clock budget for the job, in seconds
    pub timeout_secs: u64,
}

/// Default per-job wall-clock budget
const DEFAULT_TIMEOUT_SECS: u64 = 300;

impl ScanRequest {
    pub fn new(repo: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            branch: branch.into(),
            commit: None,
            prior_commit: None,
            principal: String::new(),
            agents: Vec::new(),
            priority: Priority::Medium,
            incremental: false,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Per-job deadline as a Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Check the request's intrinsic invariants.
    ///
    /// Membership of `agents` in the registry is checked by intake, which
    /// knows the registered set.
    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.repo.trim().is_empty() {
            return Err(OrchestratorError::invalid_input(
                "repository locator is required",
            ));
        }
        if self.commit.is_none() && self.branch.trim().is_empty() {
            return Err(OrchestratorError::invalid_input(
                "branch is required when no commit is given",
            ));
        }
        if self.timeout_secs == 0 {
            return Err(OrchestratorError::invalid_input(
                "timeout must be positive",
            ));
        }
        Ok(())
    }
}

/// Status of a scan job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in a priority lane
    Queued,
    /// Held by a dispatcher worker
    Running,
    /// At least one agent (or the cache) produced results
    Completed,
    /// No results at all, or the deadline elapsed
    Failed,
    /// Cancelled by the caller
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the lifecycle state machine permits `self → next`.
    ///
    /// Transitions are monotone: Queued → Running → terminal. A queued job
    /// may be cancelled or failed directly (enqueue exhaustion).
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Queued, JobStatus::Running) => true,
            (JobStatus::Queued, JobStatus::Cancelled) => true,
            (JobStatus::Queued, JobStatus::Failed) => true,
            (JobStatus::Running, JobStatus::Completed) => true,
            (JobStatus::Running, JobStatus::Failed) => true,
            (JobStatus::Running, JobStatus::Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A scan job: one unit of work, persisted at every transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanJob {
    pub id: JobId,
    pub request: ScanRequest,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Agents whose tasks have returned (any status)
    pub agents_completed: Vec<String>,
    /// Per-job metadata: work plan summary, per-agent statuses, timings
    pub metadata: HashMap<String, serde_json::Value>,
    /// Human-readable error for non-successful terminal states
    pub error: Option<String>,
}

impl ScanJob {
    pub fn new(request: ScanRequest) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            agents_completed: Vec::new(),
            metadata: HashMap::new(),
            error: None,
        }
    }

    /// Advance the lifecycle, stamping `started_at`/`completed_at`.
    pub fn transition(&mut self, next: JobStatus) -> OrchestratorResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(OrchestratorError::invalid_transition(self.status, next));
        }
        self.status = next;
        match next {
            JobStatus::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.completed_at = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }

    /// Record a metadata entry, serializing the value.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Serialize) {
        if let Ok(v) = serde_json::to_value(value) {
            self.metadata.insert(key.into(), v);
        }
    }
}
