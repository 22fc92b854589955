//! Scan dispatcher
//!
//! A fixed pool of workers pulls jobs from the queue and runs each to
//! completion: plan, fan out to agents with bounded concurrency, fold in
//! cached results, merge via consensus, persist, cache fresh results.
//!
//! Agent failures never escape a job; a job only fails when no agent and
//! no cached result produced anything. Cancellation (user or deadline) is
//! cooperative and observed at every suspension point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheEntry, CacheKey, ResultCache};
use crate::config::OrchestratorConfig;
use crate::consensus::{AgentCoverage, ConsensusEngine, RuleEquivalence};
use crate::driver::{AgentDriver, ScanConfig};
use crate::error::{retry_transient, OrchestratorError, OrchestratorResult};
use crate::events::{JobEvent, SharedJobEventBus};
use crate::gitio::GitWorkdir;
use crate::jobstore::JobStore;
use crate::model::{
    AgentResult, AgentRunStatus, ConsensusFinding, JobStatus, PlanStrategy, ScanJob, WorkPlan,
};
use crate::planner::{content_hash, Planner};
use crate::queue::ScanQueue;
use crate::registry::AgentRegistry;

/// How often in-flight jobs poll the queue's cancellation flag
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Grace period for workers to drain after `stop`'s deadline cancels
/// running jobs
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Dispatcher runtime snapshot
#[derive(Debug, Clone)]
pub struct DispatcherStatus {
    pub running_jobs: Vec<String>,
    pub busy_workers: usize,
    pub worker_pool: usize,
}

impl DispatcherStatus {
    pub fn utilization(&self) -> f64 {
        if self.worker_pool == 0 {
            0.0
        } else {
            self.busy_workers as f64 / self.worker_pool as f64
        }
    }
}

struct Inner {
    config: OrchestratorConfig,
    queue: Arc<ScanQueue>,
    store: Arc<dyn JobStore>,
    cache: Arc<ResultCache>,
    registry: Arc<AgentRegistry>,
    planner: Planner,
    consensus: ConsensusEngine,
    events: SharedJobEventBus,
    running: Mutex<HashMap<String, CancellationToken>>,
    busy_workers: AtomicUsize,
}

/// The scan dispatcher
pub struct Dispatcher {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        config: OrchestratorConfig,
        queue: Arc<ScanQueue>,
        store: Arc<dyn JobStore>,
        cache: Arc<ResultCache>,
        registry: Arc<AgentRegistry>,
        equivalence: RuleEquivalence,
        events: SharedJobEventBus,
    ) -> Self {
        let planner = Planner::new(cache.clone(), registry.clone(), &config);
        let consensus = ConsensusEngine::new(config.confidence_floors, equivalence);
        Self {
            inner: Arc::new(Inner {
                config,
                queue,
                store,
                cache,
                registry,
                planner,
                consensus,
                events,
                running: Mutex::new(HashMap::new()),
                busy_workers: AtomicUsize::new(0),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker pool.
    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }
        info!(workers = self.inner.config.workers, "starting dispatcher");
        for worker in 0..self.inner.config.workers {
            let inner = self.inner.clone();
            workers.push(tokio::spawn(async move {
                Inner::worker_loop(inner, worker).await;
            }));
        }
    }

    /// Shut the queue and drain workers. Jobs still running when the
    /// deadline elapses are cancelled and given a short grace period.
    pub async fn stop(&self, deadline: Duration) {
        info!("stopping dispatcher");
        self.inner.queue.shutdown().await;

        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        let drain = futures::future::join_all(handles);

        if tokio::time::timeout(deadline, drain).await.is_err() {
            warn!("stop deadline elapsed, cancelling running jobs");
            let running = self.inner.running.lock().await;
            for token in running.values() {
                token.cancel();
            }
            drop(running);
            tokio::time::sleep(STOP_GRACE).await;
        }
    }

    pub async fn status(&self) -> DispatcherStatus {
        let running = self.inner.running.lock().await;
        DispatcherStatus {
            running_jobs: running.keys().cloned().collect(),
            busy_workers: self.inner.busy_workers.load(Ordering::SeqCst),
            worker_pool: self.inner.config.workers,
        }
    }
}

impl Inner {
    async fn worker_loop(inner: Arc<Inner>, worker: usize) {
        debug!(worker, "worker started");
        while let Some(job_id) = inner.queue.dequeue().await {
            inner.busy_workers.fetch_add(1, Ordering::SeqCst);
            inner.run_job(&job_id).await;
            inner.busy_workers.fetch_sub(1, Ordering::SeqCst);
        }
        debug!(worker, "worker stopped");
    }

    async fn run_job(self: &Arc<Self>, job_id: &str) {
        if let Err(e) = self.execute_job(job_id).await {
            error!(job_id = %job_id, error = %e, "job execution failed");
            self.fail_job_defensively(job_id, &e).await;
        }
        self.running.lock().await.remove(job_id);
    }

    async fn execute_job(self: &Arc<Self>, job_id: &str) -> OrchestratorResult<()> {
        let store = self.store.clone();
        let mut job = retry_transient("load job", || {
            let store = store.clone();
            let id = job_id.to_string();
            async move { store.get_job(&id).await.map_err(Into::into) }
        })
        .await?;

        // Suspension point: the job may have been cancelled while queued
        // behind busy workers.
        if self.queue.is_cancelled(job_id).await {
            return self.finalize(&mut job, JobStatus::Cancelled, None).await;
        }

        job.transition(JobStatus::Running)?;
        self.persist(&job).await?;
        self.queue
            .mark_active(job_id)
            .await
            .map_err(|e| OrchestratorError::queue(e.to_string()))?;
        self.events.publish(JobEvent::Started {
            job_id: job.id.clone(),
        });

        let token = CancellationToken::new();
        self.running
            .lock()
            .await
            .insert(job.id.clone(), token.clone());

        let agents = match self.registry.resolve_selection(&job.request.agents) {
            Ok(agents) => agents,
            Err(e) => {
                return self
                    .finalize(&mut job, JobStatus::Failed, Some(e.to_string()))
                    .await;
            }
        };

        let workdir = GitWorkdir::new(&job.request.repo);
        let plan = self.planner.plan(&job.request, &workdir, &agents).await;
        info!(
            job_id = %job.id,
            strategy = ?plan.strategy,
            reason = %plan.reason,
            live_files = plan.live_files.len(),
            cached = plan.cached.len(),
            "work plan ready"
        );
        job.set_metadata("work_plan", plan.summary());
        self.persist(&job).await?;

        if self.queue.is_cancelled(job_id).await {
            return self.finalize(&mut job, JobStatus::Cancelled, None).await;
        }

        // An incremental plan with nothing live skips the fan-out entirely.
        let skip_agents =
            plan.strategy == PlanStrategy::Incremental && plan.live_files.is_empty();

        let (live_results, user_cancelled) = if skip_agents {
            (Vec::new(), false)
        } else {
            self.fan_out(&job, &plan, &agents, &token).await
        };

        if user_cancelled {
            // Partial findings are discarded; mark_failed is not called.
            return self.finalize(&mut job, JobStatus::Cancelled, None).await;
        }

        // Cached results enter the merge as completed agent results.
        let mut all_results = live_results.clone();
        all_results.extend(Self::cached_as_results(&plan));

        let coverage = self.agent_coverage(&agents);
        let merged = self.consensus.merge_with_coverage(&all_results, &coverage);
        debug!(job_id = %job.id, findings = merged.len(), "consensus merged");

        self.persist_findings(&job.id, &merged).await?;
        self.record_agent_metadata(&mut job, &all_results);
        self.write_cache_entries(&job, &plan, &live_results, &workdir)
            .await;

        // An empty incremental plan has nothing left to do and completes
        // with whatever the cache supplied.
        let any_completed = skip_agents
            || all_results
                .iter()
                .any(|r| r.status == AgentRunStatus::Completed);
        if any_completed {
            job.set_metadata("consensus_findings", merged.len());
            self.finalize(&mut job, JobStatus::Completed, None).await
        } else {
            let error = Self::failure_summary(&all_results);
            self.finalize(&mut job, JobStatus::Failed, Some(error)).await
        }
    }

    /// Run one task per agent, bounded by the per-job concurrency cap,
    /// polling the queue's cancellation flag while they run.
    ///
    /// Returns the agent results and whether the job was cancelled by the
    /// caller.
    async fn fan_out(
        self: &Arc<Self>,
        job: &ScanJob,
        plan: &WorkPlan,
        agents: &[String],
        token: &CancellationToken,
    ) -> (Vec<AgentResult>, bool) {
        let deadline = Instant::now() + job.request.timeout();
        let semaphore = Arc::new(Semaphore::new(self.config.agent_concurrency));
        let mut tasks: JoinSet<(String, AgentResult)> = JoinSet::new();

        for agent_id in agents {
            let Some(driver) = self.registry.get(agent_id) else {
                continue;
            };
            let scan_config = self.scan_config(job, plan);
            let agent_id = agent_id.clone();
            let child_token = token.child_token();
            let semaphore = semaphore.clone();
            let budget = job.request.timeout().min(self.config.agent_default_timeout);
            let retry_delay = self.config.agent_retry_delay;

            tasks.spawn(async move {
                let result = run_agent(
                    agent_id.clone(),
                    driver,
                    scan_config,
                    semaphore,
                    child_token,
                    deadline,
                    budget,
                    retry_delay,
                )
                .await;
                (agent_id, result)
            });
        }

        let mut results = Vec::with_capacity(agents.len());
        let mut user_cancelled = false;
        let mut poll = tokio::time::interval(CANCEL_POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                joined = tasks.join_next() => {
                    match joined {
                        Some(Ok((agent, result))) => {
                            self.events.publish(JobEvent::AgentFinished {
                                job_id: job.id.clone(),
                                agent: agent.clone(),
                                status: result.status,
                            });
                            debug!(
                                job_id = %job.id,
                                agent = %agent,
                                status = %result.status,
                                findings = result.findings.len(),
                                "agent finished"
                            );
                            results.push(result);
                        }
                        Some(Err(e)) => {
                            warn!(job_id = %job.id, error = %e, "agent task panicked");
                        }
                        None => break,
                    }
                }
                _ = poll.tick() => {
                    if !user_cancelled && self.queue.is_cancelled(&job.id).await {
                        info!(job_id = %job.id, "cancellation observed, stopping agents");
                        user_cancelled = true;
                        token.cancel();
                    }
                }
            }
        }

        (results, user_cancelled)
    }

    /// Per-file consensus denominators come from each driver's language
    /// coverage.
    fn agent_coverage(&self, agents: &[String]) -> AgentCoverage {
        let mut coverage = AgentCoverage::new();
        for agent in agents {
            if let Some(driver) = self.registry.get(agent) {
                coverage.insert(agent.clone(), driver.config().languages);
            }
        }
        coverage
    }

    fn scan_config(&self, job: &ScanJob, plan: &WorkPlan) -> ScanConfig {
        let mut languages: Vec<String> = plan
            .live_files
            .iter()
            .filter_map(|f| f.rsplit('.').next().map(str::to_string))
            .collect();
        languages.sort();
        languages.dedup();

        ScanConfig {
            repo: job.request.repo.clone(),
            branch: job.request.branch.clone(),
            commit: job.request.commit.clone(),
            languages,
            workdir: std::path::PathBuf::from(&job.request.repo),
            files: plan.live_files.clone(),
            timeout: job.request.timeout().min(self.config.agent_default_timeout),
        }
    }

    /// Treat each cached (file, tool) result set as if the tool had
    /// completed a scan producing it.
    fn cached_as_results(plan: &WorkPlan) -> Vec<AgentResult> {
        let mut by_tool: HashMap<String, Vec<crate::model::Finding>> = HashMap::new();
        for cached in &plan.cached {
            by_tool
                .entry(cached.tool.clone())
                .or_default()
                .extend(cached.findings.iter().cloned());
        }
        let mut results: Vec<AgentResult> = by_tool
            .into_iter()
            .map(|(tool, findings)| {
                AgentResult::completed(tool, findings).with_metadata("source", "cache")
            })
            .collect();
        results.sort_by(|a, b| a.agent.cmp(&b.agent));
        results
    }

    fn failure_summary(results: &[AgentResult]) -> String {
        if results.is_empty() {
            return "no agents produced results".into();
        }
        let details: Vec<String> = results
            .iter()
            .map(|r| {
                format!(
                    "{}: {} ({})",
                    r.agent,
                    r.status,
                    r.error.as_deref().unwrap_or("no error recorded")
                )
            })
            .collect();
        format!("all agents failed: {}", details.join("; "))
    }

    fn record_agent_metadata(&self, job: &mut ScanJob, results: &[AgentResult]) {
        let statuses: HashMap<String, serde_json::Value> = results
            .iter()
            .map(|r| {
                (
                    r.agent.clone(),
                    serde_json::json!({
                        "status": r.status,
                        "duration_ms": r.duration_ms,
                        "findings": r.findings.len(),
                        "error": r.error,
                    }),
                )
            })
            .collect();
        job.set_metadata("agent_results", statuses);

        job.agents_completed = results
            .iter()
            .filter(|r| r.status == AgentRunStatus::Completed)
            .map(|r| r.agent.clone())
            .collect();
        job.agents_completed.sort();
        job.agents_completed.dedup();
    }

    /// Persist fresh per-(file, tool) results for the next incremental
    /// plan. Only live, completed scans over an explicit file set are
    /// cacheable; cache write failures are logged, never fatal.
    async fn write_cache_entries(
        &self,
        job: &ScanJob,
        plan: &WorkPlan,
        live_results: &[AgentResult],
        workdir: &GitWorkdir,
    ) {
        if plan.is_full() || plan.live_files.is_empty() {
            return;
        }

        for result in live_results {
            if result.status != AgentRunStatus::Completed {
                continue;
            }
            let Some(profile) = self.registry.profile(&result.agent) else {
                continue;
            };
            let config_digest = profile.digest();
            let tool_version = profile.tool_version.clone();

            for file in &plan.live_files {
                let bytes = match workdir.read_file(file) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(file, error = %e, "skipping cache write, cannot hash file");
                        continue;
                    }
                };
                let findings: Vec<_> = result
                    .findings
                    .iter()
                    .filter(|f| f.file_path == *file)
                    .cloned()
                    .collect();

                let key = CacheKey::new(
                    job.request.repo.clone(),
                    file.clone(),
                    result.agent.clone(),
                    content_hash(&bytes),
                    config_digest.clone(),
                );
                let entry = CacheEntry::new(key, findings, tool_version.clone());
                if let Err(e) = self.cache.set(entry).await {
                    warn!(file, agent = %result.agent, error = %e, "cache write failed");
                }
            }
        }
    }

    async fn persist(&self, job: &ScanJob) -> OrchestratorResult<()> {
        let store = self.store.clone();
        let snapshot = job.clone();
        retry_transient("persist job", move || {
            let store = store.clone();
            let job = snapshot.clone();
            async move { store.update_job(&job).await.map_err(Into::into) }
        })
        .await
    }

    async fn persist_findings(
        &self,
        job_id: &str,
        findings: &[ConsensusFinding],
    ) -> OrchestratorResult<()> {
        let store = self.store.clone();
        let job_id = job_id.to_string();
        let findings = findings.to_vec();
        retry_transient("persist findings", move || {
            let store = store.clone();
            let job_id = job_id.clone();
            let findings = findings.clone();
            async move {
                store
                    .create_findings(&job_id, &findings)
                    .await
                    .map_err(Into::into)
            }
        })
        .await
    }

    /// Drive the job to a terminal state, persist it, and settle the
    /// queue's view of it.
    async fn finalize(
        &self,
        job: &mut ScanJob,
        status: JobStatus,
        error: Option<String>,
    ) -> OrchestratorResult<()> {
        job.error = error.clone();
        job.transition(status)?;
        self.persist(job).await?;

        match status {
            JobStatus::Failed => {
                let reason = error.clone().unwrap_or_else(|| "unknown failure".into());
                if let Err(e) = self.queue.mark_failed(&job.id, reason).await {
                    // A job failing before mark_active never reached the
                    // active set.
                    debug!(job_id = %job.id, error = %e, "mark_failed skipped");
                    self.queue.mark_done(&job.id).await;
                }
            }
            _ => self.queue.mark_done(&job.id).await,
        }

        let event = match status {
            JobStatus::Completed => JobEvent::Completed {
                job_id: job.id.clone(),
                findings: job
                    .metadata
                    .get("consensus_findings")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as usize,
            },
            JobStatus::Failed => JobEvent::Failed {
                job_id: job.id.clone(),
                error: error.unwrap_or_default(),
            },
            JobStatus::Cancelled => JobEvent::Cancelled {
                job_id: job.id.clone(),
            },
            _ => return Ok(()),
        };
        self.events.publish(event);
        info!(job_id = %job.id, status = %status, "job finished");
        Ok(())
    }

    /// Last-resort failure path when job execution itself errored.
    async fn fail_job_defensively(&self, job_id: &str, cause: &OrchestratorError) {
        if let Ok(mut job) = self.store.get_job(job_id).await {
            if !job.status.is_terminal() {
                let _ = self
                    .finalize(&mut job, JobStatus::Failed, Some(cause.to_string()))
                    .await;
                return;
            }
        }
        self.queue.mark_done(job_id).await;
    }
}

/// Run a single agent task: acquire a fan-out slot, scan under the
/// per-agent budget and the job deadline, retry a failure once.
#[allow(clippy::too_many_arguments)]
async fn run_agent(
    agent_id: String,
    driver: Arc<dyn AgentDriver>,
    scan_config: ScanConfig,
    semaphore: Arc<Semaphore>,
    token: CancellationToken,
    deadline: Instant,
    budget: Duration,
    retry_delay: Duration,
) -> AgentResult {
    let started = Instant::now();

    let _permit = tokio::select! {
        _ = token.cancelled() => return AgentResult::cancelled(&agent_id),
        permit = semaphore.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return AgentResult::cancelled(&agent_id),
        },
    };

    // Cancellation before the first await into the driver reports
    // Cancelled, never Timeout.
    if token.is_cancelled() {
        return AgentResult::cancelled(&agent_id);
    }

    let mut result = attempt_scan(&agent_id, &driver, &scan_config, &token, deadline, budget).await;

    if result.status == AgentRunStatus::Failed {
        tokio::select! {
            _ = token.cancelled() => return AgentResult::cancelled(&agent_id),
            _ = tokio::time::sleep(retry_delay) => {}
        }
        debug!(agent = %agent_id, "retrying failed agent once");
        result = attempt_scan(&agent_id, &driver, &scan_config, &token, deadline, budget).await;
    }

    result.with_duration_ms(started.elapsed().as_millis() as u64)
}

/// One scan attempt bounded by min(budget, time left until the job
/// deadline) and interruptible by cancellation.
async fn attempt_scan(
    agent_id: &str,
    driver: &Arc<dyn AgentDriver>,
    scan_config: &ScanConfig,
    token: &CancellationToken,
    deadline: Instant,
    budget: Duration,
) -> AgentResult {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return AgentResult::timeout(agent_id, budget.as_secs());
    }
    let effective = budget.min(remaining);

    tokio::select! {
        _ = token.cancelled() => AgentResult::cancelled(agent_id),
        outcome = tokio::time::timeout(effective, driver.scan(scan_config.clone())) => {
            match outcome {
                Err(_) => AgentResult::timeout(agent_id, effective.as_secs()),
                Ok(Ok(result)) => result,
                Ok(Err(e)) => AgentResult::failed(agent_id, e.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::JobEventBus;
    use crate::jobstore::MemoryJobStore;
    use crate::model::{Priority, ScanRequest};
    use crate::testutil::{test_finding, StubDriver};

    struct Harness {
        dispatcher: Dispatcher,
        queue: Arc<ScanQueue>,
        store: Arc<MemoryJobStore>,
        events: SharedJobEventBus,
    }

    fn harness_with(registry: AgentRegistry, config: OrchestratorConfig) -> Harness {
        let queue = Arc::new(ScanQueue::new());
        let store = Arc::new(MemoryJobStore::new());
        let cache = Arc::new(ResultCache::in_memory(Duration::from_secs(3600)));
        let events = JobEventBus::new().shared();
        let dispatcher = Dispatcher::new(
            config,
            queue.clone(),
            store.clone(),
            cache,
            Arc::new(registry),
            RuleEquivalence::default(),
            events.clone(),
        );
        Harness {
            dispatcher,
            queue,
            store,
            events,
        }
    }

    fn small_config() -> OrchestratorConfig {
        OrchestratorConfig {
            workers: 2,
            agent_concurrency: 2,
            agent_retry_delay: Duration::from_millis(50),
            ..Default::default()
        }
    }

    async fn submit(harness: &Harness, request: ScanRequest) -> String {
        let job = ScanJob::new(request);
        let id = job.id.clone();
        harness.store.create_job(&job).await.unwrap();
        harness
            .queue
            .enqueue(id.clone(), job.request.priority)
            .await
            .unwrap();
        id
    }

    async fn wait_terminal(
        rx: &mut tokio::sync::broadcast::Receiver<JobEvent>,
        job_id: &str,
    ) -> JobEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(30), rx.recv())
                .await
                .expect("timed out waiting for terminal event")
                .expect("event bus closed");
            if event.job_id() != job_id {
                continue;
            }
            match event {
                JobEvent::Completed { .. } | JobEvent::Failed { .. } | JobEvent::Cancelled { .. } => {
                    return event;
                }
                _ => {}
            }
        }
    }

    fn request(agents: Vec<&str>) -> ScanRequest {
        let mut request = ScanRequest::new("/nonexistent/repo", "main");
        request.agents = agents.into_iter().map(str::to_string).collect();
        request.priority = Priority::Medium;
        request
    }

    #[tokio::test]
    async fn test_job_completes_and_persists_findings() {
        let mut registry = AgentRegistry::new();
        registry.register(Arc::new(StubDriver::completing(
            "bandit",
            vec![test_finding("bandit", "B602", "utils.py", 25, 0.9)],
        )));

        let harness = harness_with(registry, small_config());
        let mut rx = harness.events.subscribe();
        harness.dispatcher.start().await;

        let job_id = submit(&harness, request(vec!["bandit"])).await;
        let event = wait_terminal(&mut rx, &job_id).await;
        assert!(matches!(event, JobEvent::Completed { findings: 1, .. }));

        let job = harness.store.get_job(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_some());
        assert_eq!(job.agents_completed, vec!["bandit"]);

        let findings = harness
            .store
            .list_findings(&job_id, &Default::default())
            .await
            .unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].finding.rule_id, "B602");

        harness.dispatcher.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_partial_failure_degrades_gracefully() {
        let mut registry = AgentRegistry::new();
        registry.register(Arc::new(StubDriver::completing(
            "bandit",
            vec![test_finding("bandit", "B602", "utils.py", 25, 0.9)],
        )));
        registry.register(Arc::new(StubDriver::failing(
            "semgrep",
            "container pull failed",
        )));

        let harness = harness_with(registry, small_config());
        let mut rx = harness.events.subscribe();
        harness.dispatcher.start().await;

        let job_id = submit(&harness, request(vec!["bandit", "semgrep"])).await;
        let event = wait_terminal(&mut rx, &job_id).await;
        assert!(matches!(event, JobEvent::Completed { .. }));

        let job = harness.store.get_job(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        // Per-agent outcomes stay visible in metadata.
        let agent_results = job.metadata.get("agent_results").unwrap();
        assert_eq!(agent_results["semgrep"]["status"], "failed");
        assert_eq!(agent_results["bandit"]["status"], "completed");

        harness.dispatcher.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_total_failure_retries_once_then_fails_job() {
        let driver = Arc::new(StubDriver::erroring("bandit", "docker daemon unreachable"));
        let mut registry = AgentRegistry::new();
        registry.register(driver.clone());

        let harness = harness_with(registry, small_config());
        let mut rx = harness.events.subscribe();
        harness.dispatcher.start().await;

        let job_id = submit(&harness, request(vec!["bandit"])).await;
        let event = wait_terminal(&mut rx, &job_id).await;
        match event {
            JobEvent::Failed { error, .. } => {
                assert!(error.contains("docker daemon unreachable"));
            }
            other => panic!("expected failure, got {other:?}"),
        }

        // Initial attempt plus exactly one retry.
        assert_eq!(driver.call_count(), 2);

        let job = harness.store.get_job(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.as_deref().unwrap().contains("bandit"));
        assert_eq!(harness.queue.failed_count().await, 1);

        let findings = harness
            .store
            .list_findings(&job_id, &Default::default())
            .await
            .unwrap();
        assert!(findings.is_empty());

        harness.dispatcher.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_agent_times_out_but_job_completes() {
        let mut registry = AgentRegistry::new();
        registry.register(Arc::new(StubDriver::completing(
            "fast",
            vec![
                test_finding("fast", "R1", "a.py", 1, 0.9),
                test_finding("fast", "R2", "a.py", 2, 0.9),
                test_finding("fast", "R3", "a.py", 3, 0.9),
            ],
        )));
        registry.register(Arc::new(
            StubDriver::completing("slow", vec![]).with_delay(Duration::from_secs(120)),
        ));

        let harness = harness_with(registry, small_config());
        let mut rx = harness.events.subscribe();
        harness.dispatcher.start().await;

        let mut req = request(vec!["fast", "slow"]);
        req.timeout_secs = 60;
        let job_id = submit(&harness, req).await;

        let event = wait_terminal(&mut rx, &job_id).await;
        assert!(matches!(event, JobEvent::Completed { findings: 3, .. }));

        let job = harness.store.get_job(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        let agent_results = job.metadata.get("agent_results").unwrap();
        assert_eq!(agent_results["slow"]["status"], "timeout");
        assert_eq!(agent_results["fast"]["status"], "completed");
        assert_eq!(job.agents_completed, vec!["fast"]);

        harness.dispatcher.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_partials() {
        let mut registry = AgentRegistry::new();
        registry.register(Arc::new(
            StubDriver::completing("slow", vec![test_finding("slow", "R1", "a.py", 1, 0.9)])
                .with_delay(Duration::from_secs(30)),
        ));

        let harness = harness_with(registry, small_config());
        let mut rx = harness.events.subscribe();
        harness.dispatcher.start().await;

        let job_id = submit(&harness, request(vec!["slow"])).await;

        // Wait until the job is running, then cancel it.
        loop {
            let event = rx.recv().await.unwrap();
            if event.job_id() == job_id && event.event_type() == "started" {
                break;
            }
        }
        harness.queue.cancel(&job_id).await;

        let event = wait_terminal(&mut rx, &job_id).await;
        assert!(matches!(event, JobEvent::Cancelled { .. }));

        let job = harness.store.get_job(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.completed_at.is_some());
        // Cancellation never reaches the failed set.
        assert_eq!(harness.queue.failed_count().await, 0);

        let findings = harness
            .store
            .list_findings(&job_id, &Default::default())
            .await
            .unwrap();
        assert!(findings.is_empty());

        harness.dispatcher.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_two_agent_consensus_scoring() {
        let mut registry = AgentRegistry::new();
        registry.register(Arc::new(StubDriver::completing(
            "bandit",
            vec![test_finding("bandit", "B602", "utils.py", 25, 0.9)],
        )));
        registry.register(Arc::new(StubDriver::completing(
            "semgrep",
            vec![test_finding("semgrep", "B602", "utils.py", 25, 0.8)],
        )));

        let harness = harness_with(registry, small_config());
        let mut rx = harness.events.subscribe();
        harness.dispatcher.start().await;

        let job_id = submit(&harness, request(vec!["bandit", "semgrep"])).await;
        wait_terminal(&mut rx, &job_id).await;

        let findings = harness
            .store
            .list_findings(&job_id, &Default::default())
            .await
            .unwrap();
        assert_eq!(findings.len(), 1);
        let cf = &findings[0];
        assert!((cf.finding.confidence - 0.98).abs() < 1e-9);
        assert_eq!(cf.finding.consensus_score, Some(1.0));
        assert_eq!(cf.reported_by, vec!["bandit", "semgrep"]);

        harness.dispatcher.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_consensus_score_ignores_agents_that_cannot_scan_the_file() {
        let mut registry = AgentRegistry::new();
        registry.register(Arc::new(
            StubDriver::completing(
                "bandit",
                vec![test_finding("bandit", "B602", "utils.py", 25, 0.9)],
            )
            .with_languages(vec!["py".into()]),
        ));
        // Go-only tool: completes cleanly, never looks at utils.py.
        registry.register(Arc::new(
            StubDriver::completing("gosec", vec![]).with_languages(vec!["go".into()]),
        ));

        let harness = harness_with(registry, small_config());
        let mut rx = harness.events.subscribe();
        harness.dispatcher.start().await;

        let job_id = submit(&harness, request(vec!["bandit", "gosec"])).await;
        wait_terminal(&mut rx, &job_id).await;

        let findings = harness
            .store
            .list_findings(&job_id, &Default::default())
            .await
            .unwrap();
        assert_eq!(findings.len(), 1);
        // Full agreement among the agents that could scan the file.
        assert_eq!(findings[0].finding.consensus_score, Some(1.0));
        assert_eq!(findings[0].reported_by, vec!["bandit"]);

        harness.dispatcher.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_cancellation_before_first_await_is_cancelled_not_timeout() {
        let driver: Arc<dyn AgentDriver> =
            Arc::new(StubDriver::completing("bandit", vec![]).with_delay(Duration::from_secs(5)));
        let token = CancellationToken::new();
        token.cancel();

        let result = run_agent(
            "bandit".into(),
            driver,
            ScanConfig {
                repo: "/nonexistent/repo".into(),
                branch: "main".into(),
                commit: None,
                languages: vec![],
                workdir: "/nonexistent/repo".into(),
                files: vec![],
                timeout: Duration::from_secs(1),
            },
            Arc::new(Semaphore::new(1)),
            token,
            Instant::now() + Duration::from_secs(60),
            Duration::from_secs(1),
            Duration::from_millis(10),
        )
        .await;

        assert_eq!(result.status, AgentRunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_status_reports_pool() {
        let mut registry = AgentRegistry::new();
        registry.register(Arc::new(StubDriver::completing("bandit", vec![])));
        let harness = harness_with(registry, small_config());
        harness.dispatcher.start().await;

        let status = harness.dispatcher.status().await;
        assert_eq!(status.worker_pool, 2);
        assert!(status.utilization() <= 1.0);

        harness.dispatcher.stop(Duration::from_secs(5)).await;
    }
}
