//! Scanhive orchestration library
//!
//! The core of the multi-agent security-scan pipeline:
//! - intake: request validation, job creation, enqueueing
//! - planner: full-vs-incremental decisions honouring the result cache
//! - cache: per-(repo, file, tool, content, config) result storage
//! - queue: strict-priority FIFO of pending jobs
//! - dispatch: worker pool, bounded agent fan-out, partial-failure policy
//! - consensus: deterministic cross-agent merge with confidence scoring
//!
//! Agent drivers (one per wrapped scanner tool) implement the contract in
//! [`driver`]; the `scan-agents` crate wires concrete drivers and the
//! daemon binary around this library.

pub mod cache;
pub mod config;
pub mod consensus;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod events;
pub mod gitio;
pub mod intake;
pub mod jobstore;
pub mod model;
pub mod planner;
pub mod queue;
pub mod registry;
pub mod testutil;

pub use cache::{CacheEntry, CacheKey, CacheStats, ResultCache};
pub use config::{ConfidenceFloors, OrchestratorConfig};
pub use consensus::{AgentCoverage, ConsensusEngine, RuleEquivalence};
pub use dispatch::{Dispatcher, DispatcherStatus};
pub use driver::{AgentDriver, DriverConfig, DriverVersion, HealthStatus, ScanConfig, ToolProfile};
pub use error::{OrchestratorError, OrchestratorResult};
pub use events::{JobEvent, JobEventBus, SharedJobEventBus};
pub use gitio::GitWorkdir;
pub use intake::{CancelOutcome, Intake};
pub use jobstore::{FindingFilter, JobStore, MemoryJobStore};
pub use model::{
    AgentResult, AgentRunStatus, Category, ConsensusFinding, Finding, FindingStatus, JobId,
    JobStatus, PlanStrategy, Priority, ScanJob, ScanRequest, Severity, WorkPlan,
};
pub use planner::Planner;
pub use queue::{CancelDisposition, ScanQueue};
pub use registry::AgentRegistry;
