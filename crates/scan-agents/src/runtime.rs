//! Pipeline assembly
//!
//! Builds the registry, queue, cache, store, dispatcher, and intake from a
//! `RuntimeConfig` and hands the binary one handle to drive them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::info;

use orchestration::{
    AgentRegistry, Dispatcher, Intake, JobEvent, JobEventBus, MemoryJobStore, ResultCache,
    ScanQueue, SharedJobEventBus,
};

use crate::config::RuntimeConfig;
use crate::drivers::CommandDriver;

/// Everything the binary needs to run scans
pub struct Pipeline {
    pub intake: Intake,
    pub dispatcher: Dispatcher,
    pub queue: Arc<ScanQueue>,
    pub store: Arc<MemoryJobStore>,
    pub registry: Arc<AgentRegistry>,
    pub events: SharedJobEventBus,
}

/// Build the agent registry from configured specs.
pub fn build_registry(config: &RuntimeConfig) -> Result<AgentRegistry> {
    if config.agents.is_empty() {
        anyhow::bail!("no agents configured; provide an agents file");
    }
    let mut registry = AgentRegistry::new();
    for spec in &config.agents {
        let profile = spec.tool_profile();
        registry.register_with_profile(Arc::new(CommandDriver::new(spec.clone())), profile);
        info!(agent = %spec.id, "registered agent");
    }
    Ok(registry)
}

/// Assemble the full pipeline.
pub fn build_pipeline(config: RuntimeConfig) -> Result<Pipeline> {
    let registry = Arc::new(build_registry(&config).context("building agent registry")?);
    let queue = Arc::new(ScanQueue::new());
    let store = Arc::new(MemoryJobStore::new());
    let cache = Arc::new(ResultCache::in_memory(config.orchestrator.cache_ttl));
    let events = JobEventBus::new().shared();

    let intake = Intake::new(
        queue.clone(),
        store.clone(),
        registry.clone(),
        events.clone(),
    );
    let dispatcher = Dispatcher::new(
        config.orchestrator.clone(),
        queue.clone(),
        store.clone(),
        cache,
        registry.clone(),
        config.equivalence.clone(),
        events.clone(),
    );

    Ok(Pipeline {
        intake,
        dispatcher,
        queue,
        store,
        registry,
        events,
    })
}

/// Log every job event; returns the logger task handle.
pub fn spawn_event_logger(events: &SharedJobEventBus) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match &event {
                JobEvent::Queued { job_id, priority } => {
                    info!(job_id = %job_id, priority = %priority, "job queued");
                }
                JobEvent::Started { job_id } => info!(job_id = %job_id, "job started"),
                JobEvent::AgentFinished {
                    job_id,
                    agent,
                    status,
                } => info!(job_id = %job_id, agent = %agent, status = %status, "agent finished"),
                JobEvent::Completed { job_id, findings } => {
                    info!(job_id = %job_id, findings, "job completed");
                }
                JobEvent::Failed { job_id, error } => {
                    info!(job_id = %job_id, error = %error, "job failed");
                }
                JobEvent::Cancelled { job_id } => info!(job_id = %job_id, "job cancelled"),
            }
        }
    })
}

/// Wait for a specific job to reach a terminal event.
pub async fn await_terminal(
    mut rx: tokio::sync::broadcast::Receiver<JobEvent>,
    job_id: &str,
    timeout: Duration,
) -> Result<JobEvent> {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if event.job_id() == job_id => match event {
                    JobEvent::Completed { .. }
                    | JobEvent::Failed { .. }
                    | JobEvent::Cancelled { .. } => return Ok(event),
                    _ => {}
                },
                Ok(_) => {}
                Err(e) => anyhow::bail!("event stream closed: {e}"),
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .context("timed out waiting for job to finish")?
}
