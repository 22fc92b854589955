//! Priority FIFO of pending scan jobs
//!
//! Three lanes (high, medium, low) with FIFO order inside a lane and strict
//! priority across lanes. Higher-priority work always dequeues first;
//! starvation of lower lanes is accepted and left to operators watching
//! lane depths. A job id lives in at most one of {queued, dequeued, active,
//! failed} at any time.
//!
//! Cancellation of a queued job removes it from its lane; cancellation of a
//! dequeued or active job raises a flag the dispatcher polls at its
//! suspension points.

use std::collections::{HashMap, HashSet, VecDeque};

use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::model::{JobId, Priority};

/// Error type for queue operations
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Job {job_id} is already tracked by the queue")]
    AlreadyTracked { job_id: JobId },

    #[error("Job {job_id} was not dequeued")]
    NotDequeued { job_id: JobId },

    #[error("Job {job_id} is not active")]
    NotActive { job_id: JobId },

    #[error("Queue is shut down")]
    Closed,
}

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// What `cancel` did with the job id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelDisposition {
    /// Removed from a lane before any worker saw it
    Removed,
    /// In flight; the cancellation flag is set for the dispatcher to observe
    Flagged,
    /// Not tracked by the queue
    Unknown,
}

#[derive(Default)]
struct Lanes {
    high: VecDeque<JobId>,
    medium: VecDeque<JobId>,
    low: VecDeque<JobId>,
}

impl Lanes {
    fn lane_mut(&mut self, priority: Priority) -> &mut VecDeque<JobId> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Medium => &mut self.medium,
            Priority::Low => &mut self.low,
        }
    }

    fn lane(&self, priority: Priority) -> &VecDeque<JobId> {
        match priority {
            Priority::High => &self.high,
            Priority::Medium => &self.medium,
            Priority::Low => &self.low,
        }
    }

    /// Pop the next id in strict priority order
    fn pop_next(&mut self) -> Option<JobId> {
        for priority in Priority::lanes() {
            if let Some(id) = self.lane_mut(*priority).pop_front() {
                return Some(id);
            }
        }
        None
    }

    fn remove(&mut self, job_id: &str) -> bool {
        for priority in Priority::lanes() {
            let lane = self.lane_mut(*priority);
            if let Some(pos) = lane.iter().position(|id| id == job_id) {
                lane.remove(pos);
                return true;
            }
        }
        false
    }

    fn contains(&self, job_id: &str) -> bool {
        Priority::lanes()
            .iter()
            .any(|p| self.lane(*p).iter().any(|id| id == job_id))
    }
}

#[derive(Default)]
struct QueueState {
    lanes: Lanes,
    /// Popped by a worker but not yet marked active
    dequeued: HashSet<JobId>,
    active: HashSet<JobId>,
    failed: HashMap<JobId, String>,
    cancelled: HashSet<JobId>,
    shutdown: bool,
}

/// The scan job queue
pub struct ScanQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl ScanQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Add a job id to its priority lane.
    pub async fn enqueue(&self, job_id: JobId, priority: Priority) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        if state.shutdown {
            return Err(QueueError::Closed);
        }
        if state.lanes.contains(&job_id)
            || state.dequeued.contains(&job_id)
            || state.active.contains(&job_id)
            || state.failed.contains_key(&job_id)
        {
            return Err(QueueError::AlreadyTracked { job_id });
        }
        debug!(job_id = %job_id, priority = %priority, "enqueued");
        state.lanes.lane_mut(priority).push_back(job_id);
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the next job id in strict priority order.
    ///
    /// Returns None once the queue is shut down.
    pub async fn dequeue(&self) -> Option<JobId> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if state.shutdown {
                    return None;
                }
                if let Some(id) = state.lanes.pop_next() {
                    state.dequeued.insert(id.clone());
                    return Some(id);
                }
            }
            notified.await;
        }
    }

    /// The only legal transition from dequeued to active.
    pub async fn mark_active(&self, job_id: &str) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        if !state.dequeued.remove(job_id) {
            return Err(QueueError::NotDequeued {
                job_id: job_id.to_string(),
            });
        }
        state.active.insert(job_id.to_string());
        Ok(())
    }

    /// Move an active job to the failed set, recording the error.
    pub async fn mark_failed(&self, job_id: &str, error: impl Into<String>) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        if !state.active.remove(job_id) {
            return Err(QueueError::NotActive {
                job_id: job_id.to_string(),
            });
        }
        state.cancelled.remove(job_id);
        state.failed.insert(job_id.to_string(), error.into());
        Ok(())
    }

    /// Release a finished job (completed or cancelled) from tracking.
    pub async fn mark_done(&self, job_id: &str) {
        let mut state = self.state.lock().await;
        state.active.remove(job_id);
        state.dequeued.remove(job_id);
        state.cancelled.remove(job_id);
    }

    /// Cancel a job: remove it from its lane if still queued, or flag it
    /// for the dispatcher if already in flight.
    pub async fn cancel(&self, job_id: &str) -> CancelDisposition {
        let mut state = self.state.lock().await;
        if state.lanes.remove(job_id) {
            return CancelDisposition::Removed;
        }
        if state.dequeued.contains(job_id) || state.active.contains(job_id) {
            state.cancelled.insert(job_id.to_string());
            return CancelDisposition::Flagged;
        }
        CancelDisposition::Unknown
    }

    /// Whether an in-flight job has been flagged for cancellation.
    ///
    /// Polled by the dispatcher at suspension points.
    pub async fn is_cancelled(&self, job_id: &str) -> bool {
        self.state.lock().await.cancelled.contains(job_id)
    }

    /// Depth of one priority lane
    pub async fn len(&self, priority: Priority) -> usize {
        self.state.lock().await.lanes.lane(priority).len()
    }

    pub async fn is_empty(&self) -> bool {
        let state = self.state.lock().await;
        Priority::lanes()
            .iter()
            .all(|p| state.lanes.lane(*p).is_empty())
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active.len()
    }

    pub async fn failed_count(&self) -> usize {
        self.state.lock().await.failed.len()
    }

    /// Stop accepting work and wake every blocked dequeue.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.shutdown = true;
        drop(state);
        self.notify.notify_waiters();
    }
}

impl Default for ScanQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_within_lane() {
        let queue = ScanQueue::new();
        queue.enqueue("a".into(), Priority::Medium).await.unwrap();
        queue.enqueue("b".into(), Priority::Medium).await.unwrap();
        queue.enqueue("c".into(), Priority::Medium).await.unwrap();

        assert_eq!(queue.dequeue().await.unwrap(), "a");
        assert_eq!(queue.dequeue().await.unwrap(), "b");
        assert_eq!(queue.dequeue().await.unwrap(), "c");
    }

    #[tokio::test]
    async fn test_strict_priority_across_lanes() {
        let queue = ScanQueue::new();
        queue.enqueue("low".into(), Priority::Low).await.unwrap();
        queue.enqueue("med".into(), Priority::Medium).await.unwrap();
        queue.enqueue("high".into(), Priority::High).await.unwrap();

        assert_eq!(queue.dequeue().await.unwrap(), "high");
        assert_eq!(queue.dequeue().await.unwrap(), "med");
        assert_eq!(queue.dequeue().await.unwrap(), "low");
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_rejected() {
        let queue = ScanQueue::new();
        queue.enqueue("a".into(), Priority::High).await.unwrap();
        assert!(matches!(
            queue.enqueue("a".into(), Priority::Low).await,
            Err(QueueError::AlreadyTracked { .. })
        ));
    }

    #[tokio::test]
    async fn test_active_and_failed_transitions() {
        let queue = ScanQueue::new();
        queue.enqueue("a".into(), Priority::High).await.unwrap();

        // mark_active before dequeue is illegal
        assert!(queue.mark_active("a").await.is_err());

        let id = queue.dequeue().await.unwrap();
        queue.mark_active(&id).await.unwrap();
        assert_eq!(queue.active_count().await, 1);

        // mark_failed requires active
        assert!(queue.mark_failed("other", "boom").await.is_err());
        queue.mark_failed(&id, "boom").await.unwrap();
        assert_eq!(queue.active_count().await, 0);
        assert_eq!(queue.failed_count().await, 1);
    }

    #[tokio::test]
    async fn test_cancel_queued_removes_from_lane() {
        let queue = ScanQueue::new();
        queue.enqueue("a".into(), Priority::Medium).await.unwrap();
        assert_eq!(queue.cancel("a").await, CancelDisposition::Removed);
        assert_eq!(queue.len(Priority::Medium).await, 0);
        assert_eq!(queue.cancel("a").await, CancelDisposition::Unknown);
    }

    #[tokio::test]
    async fn test_cancel_active_sets_flag() {
        let queue = ScanQueue::new();
        queue.enqueue("a".into(), Priority::Medium).await.unwrap();
        let id = queue.dequeue().await.unwrap();
        queue.mark_active(&id).await.unwrap();

        assert_eq!(queue.cancel(&id).await, CancelDisposition::Flagged);
        assert!(queue.is_cancelled(&id).await);

        queue.mark_done(&id).await;
        assert!(!queue.is_cancelled(&id).await);
    }

    #[tokio::test]
    async fn test_dequeue_blocks_until_enqueue() {
        let queue = Arc::new(ScanQueue::new());
        let q2 = queue.clone();

        let waiter = tokio::spawn(async move { q2.dequeue().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.enqueue("a".into(), Priority::Low).await.unwrap();
        let got = waiter.await.unwrap();
        assert_eq!(got.unwrap(), "a");
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_dequeue() {
        let queue = Arc::new(ScanQueue::new());
        let q2 = queue.clone();

        let waiter = tokio::spawn(async move { q2.dequeue().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.shutdown().await;

        assert!(waiter.await.unwrap().is_none());
        assert!(matches!(
            queue.enqueue("a".into(), Priority::High).await,
            Err(QueueError::Closed)
        ));
    }
}
