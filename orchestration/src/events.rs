//! Job lifecycle event bus
//!
//! Broadcast channel the dispatcher publishes transitions to. Consumers
//! (the daemon's progress logger, tests) subscribe; publishing with no
//! receivers is not an error, and a slow receiver only loses its own
//! backlog.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::model::{AgentRunStatus, JobId, Priority};

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Shared reference to the event bus
pub type SharedJobEventBus = Arc<JobEventBus>;

/// A job lifecycle transition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Queued {
        job_id: JobId,
        priority: Priority,
    },
    Started {
        job_id: JobId,
    },
    AgentFinished {
        job_id: JobId,
        agent: String,
        status: AgentRunStatus,
    },
    Completed {
        job_id: JobId,
        findings: usize,
    },
    Failed {
        job_id: JobId,
        error: String,
    },
    Cancelled {
        job_id: JobId,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Queued { job_id, .. }
            | JobEvent::Started { job_id }
            | JobEvent::AgentFinished { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Cancelled { job_id } => job_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            JobEvent::Queued { .. } => "queued",
            JobEvent::Started { .. } => "started",
            JobEvent::AgentFinished { .. } => "agent_finished",
            JobEvent::Completed { .. } => "completed",
            JobEvent::Failed { .. } => "failed",
            JobEvent::Cancelled { .. } => "cancelled",
        }
    }
}

/// Broadcast bus for job events
pub struct JobEventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl JobEventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn shared(self) -> SharedJobEventBus {
        Arc::new(self)
    }

    /// Publish an event; fire and forget.
    pub fn publish(&self, event: JobEvent) {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(receivers) => debug!(event_type, receivers, "event published"),
            Err(_) => debug!(event_type, "event published (no receivers)"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for JobEventBus {
    fn default() -> Self {
        Self::new()
    }
}
