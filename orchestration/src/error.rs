//! Orchestrator error types
//!
//! Structured errors for the scan pipeline, with a retryability
//! classification and the bounded-backoff retry helper used for
//! transient dependency failures.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Result type alias for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Backoff schedule for transient dependency failures (queue, store, cache).
///
/// An operation is attempted once, then retried after each listed delay
/// before the error is surfaced.
pub const TRANSIENT_BACKOFF: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(500),
    Duration::from_millis(2_000),
];

/// Errors that can occur across the scan pipeline
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Bad request rejected at the API boundary
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    /// Unknown job or finding id
    #[error("{what} not found: {id}")]
    NotFound { what: String, id: String },

    /// Illegal job status transition
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Job store I/O failed
    #[error("Job store error: {message}")]
    Store { message: String },

    /// Result cache I/O failed
    #[error("Cache error: {message}")]
    Cache { message: String },

    /// Queue backing store failed
    #[error("Queue error: {message}")]
    Queue { message: String },

    /// Git operation failed
    #[error("Git operation failed: {operation} - {message}")]
    Git { operation: String, message: String },

    /// An agent driver violated its preconditions (e.g. missing container
    /// runtime). Scanner-level failures never surface here; they are
    /// captured in `AgentResult::status`.
    #[error("Agent {agent} precondition failed: {message}")]
    AgentPrecondition { agent: String, message: String },

    /// Per-job wall-clock deadline elapsed
    #[error("Job deadline of {seconds}s elapsed")]
    Deadline { seconds: u64 },

    /// Job was cancelled by the caller
    #[error("Job cancelled")]
    Cancelled,

    /// Startup-time configuration error; never raised per job
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The dispatcher or queue is shutting down
    #[error("Shutting down")]
    ShuttingDown,

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OrchestratorError {
    /// Create an invalid-input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(what: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            what: what.into(),
            id: id.into(),
        }
    }

    /// Create an invalid-transition error
    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Create a job store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create a cache error
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    /// Create a queue error
    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue {
            message: message.into(),
        }
    }

    /// Create a git error
    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether this error is a transient dependency failure worth retrying.
    ///
    /// Store, cache, and queue I/O always qualifies. Git failures qualify
    /// only when the message carries one of the transient markers below;
    /// a bad revision or unparseable output never clears on its own.
    /// Validation, not-found, cancellation, and deadline errors are final.
    pub fn is_retryable(&self) -> bool {
        /// Stderr fragments of git failures that resolve by waiting:
        /// repository lock contention and flaky transport.
        const TRANSIENT_GIT_MARKERS: [&str; 5] = [
            "index.lock",
            "cannot lock ref",
            "could not read from remote",
            "early eof",
            "timed out",
        ];

        match self {
            Self::Store { .. } | Self::Cache { .. } | Self::Queue { .. } => true,
            Self::Git { message, .. } => {
                let message = message.to_ascii_lowercase();
                TRANSIENT_GIT_MARKERS.iter().any(|m| message.contains(m))
            }
            Self::Io(e) => {
                e.kind() == std::io::ErrorKind::Interrupted
                    || e.kind() == std::io::ErrorKind::TimedOut
            }
            _ => false,
        }
    }
}

/// Run `op`, retrying transient failures on the `TRANSIENT_BACKOFF` schedule.
///
/// Non-retryable errors surface immediately. The final attempt's error is
/// surfaced once the schedule is exhausted.
pub async fn retry_transient<T, F, Fut>(label: &str, mut op: F) -> OrchestratorResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = OrchestratorResult<T>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < TRANSIENT_BACKOFF.len() => {
                let delay = TRANSIENT_BACKOFF[attempt];
                warn!(
                    label,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
