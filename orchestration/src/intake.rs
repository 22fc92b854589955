//! Scan request intake
//!
//! The submit/cancel entry point. Submit validates the request, persists
//! the job, and enqueues it; past validation it does not fail at the API
//! surface — when persistence or enqueueing exhausts its retries, the job
//! is recorded as Failed with the original error and the job id is still
//! returned so the caller can inspect the outcome.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::error::{retry_transient, OrchestratorResult};
use crate::events::{JobEvent, SharedJobEventBus};
use crate::jobstore::JobStore;
use crate::model::{JobId, JobStatus, ScanJob, ScanRequest};
use crate::queue::{CancelDisposition, ScanQueue};
use crate::registry::AgentRegistry;

/// Outcome of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job will not (or no longer) run
    Cancelled,
    /// No job with that id exists
    NotFound,
    /// The job already reached a terminal state
    AlreadyTerminal,
}

/// Job intake
pub struct Intake {
    queue: Arc<ScanQueue>,
    store: Arc<dyn JobStore>,
    registry: Arc<AgentRegistry>,
    events: SharedJobEventBus,
}

impl Intake {
    pub fn new(
        queue: Arc<ScanQueue>,
        store: Arc<dyn JobStore>,
        registry: Arc<AgentRegistry>,
        events: SharedJobEventBus,
    ) -> Self {
        Self {
            queue,
            store,
            registry,
            events,
        }
    }

    /// Validate, persist, and enqueue a scan request.
    ///
    /// Fails only on validation; infrastructure trouble downgrades the job
    /// to Failed instead of surfacing an error here.
    pub async fn submit(&self, request: ScanRequest) -> OrchestratorResult<JobId> {
        request.validate()?;
        self.registry.resolve_selection(&request.agents)?;

        let job = ScanJob::new(request);
        let job_id = job.id.clone();
        info!(job_id = %job_id, repo = %job.request.repo, "scan request accepted");

        let store = self.store.clone();
        let snapshot = job.clone();
        let persisted = retry_transient("create job", move || {
            let store = store.clone();
            let job = snapshot.clone();
            async move { store.create_job(&job).await.map_err(Into::into) }
        })
        .await;

        if let Err(e) = persisted {
            error!(job_id = %job_id, error = %e, "could not persist job");
            self.record_submit_failure(job, &e.to_string()).await;
            return Ok(job_id);
        }

        let queue = self.queue.clone();
        let enqueue_id = job_id.clone();
        let priority = job.request.priority;
        let enqueued = retry_transient("enqueue job", move || {
            let queue = queue.clone();
            let id = enqueue_id.clone();
            async move {
                queue
                    .enqueue(id, priority)
                    .await
                    .map_err(|e| crate::error::OrchestratorError::queue(e.to_string()))
            }
        })
        .await;

        if let Err(e) = enqueued {
            error!(job_id = %job_id, error = %e, "could not enqueue job");
            self.record_submit_failure(job, &e.to_string()).await;
            return Ok(job_id);
        }

        self.events.publish(JobEvent::Queued {
            job_id: job_id.clone(),
            priority,
        });
        Ok(job_id)
    }

    /// Cancel a job by id.
    ///
    /// A queued job is removed from its lane and finalized here; a running
    /// job is flagged and the dispatcher finalizes it at its next
    /// suspension point.
    pub async fn cancel(&self, job_id: &str) -> OrchestratorResult<CancelOutcome> {
        let mut job = match self.store.get_job(job_id).await {
            Ok(job) => job,
            Err(crate::jobstore::StoreError::JobNotFound { .. }) => {
                return Ok(CancelOutcome::NotFound);
            }
            Err(e) => return Err(e.into()),
        };

        if job.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal);
        }

        match self.queue.cancel(job_id).await {
            CancelDisposition::Removed => {
                self.finalize_cancelled(&mut job).await;
            }
            CancelDisposition::Flagged => {
                info!(job_id = %job_id, "cancellation flagged for running job");
            }
            CancelDisposition::Unknown => {
                // The queue lost track of it (e.g. process restart); settle
                // the stored record directly.
                warn!(job_id = %job_id, "job unknown to queue, cancelling stored record");
                self.finalize_cancelled(&mut job).await;
            }
        }
        Ok(CancelOutcome::Cancelled)
    }

    async fn finalize_cancelled(&self, job: &mut ScanJob) {
        if job.transition(JobStatus::Cancelled).is_ok() {
            if let Err(e) = self.store.update_job(job).await {
                error!(job_id = %job.id, error = %e, "could not persist cancellation");
            }
            self.events.publish(JobEvent::Cancelled {
                job_id: job.id.clone(),
            });
        }
    }

    /// Best-effort record of a job that could not be queued.
    async fn record_submit_failure(&self, mut job: ScanJob, error: &str) {
        job.error = Some(error.to_string());
        if job.transition(JobStatus::Failed).is_err() {
            return;
        }
        if let Err(e) = self.store.create_job(&job).await {
            error!(job_id = %job.id, error = %e, "could not record submit failure");
        }
        self.events.publish(JobEvent::Failed {
            job_id: job.id.clone(),
            error: error.to_string(),
        });
    }
}
