//! Scripted drivers for tests
//!
//! `StubDriver` satisfies the agent contract with canned outcomes so the
//! dispatcher, registry, and intake can be exercised without containerized
//! tools. Used by this crate's own tests and by downstream test suites.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::driver::{AgentDriver, DriverConfig, DriverVersion, HealthStatus, ScanConfig};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{AgentResult, Category, Finding};

/// One canned response from a stub driver
#[derive(Debug, Clone)]
pub enum StubOutcome {
    /// Return Completed with these findings
    Complete(Vec<Finding>),
    /// Return an AgentResult with status Failed
    Fail(String),
    /// Return Err (precondition violation)
    Error(String),
}

/// A scriptable agent driver
pub struct StubDriver {
    id: String,
    languages: Vec<String>,
    categories: Vec<Category>,
    /// Outcomes consumed one per scan; the last is repeated when exhausted
    script: Mutex<VecDeque<StubOutcome>>,
    fallback: StubOutcome,
    /// Simulated scan duration
    delay: Duration,
    calls: AtomicUsize,
    healthy: bool,
}

impl StubDriver {
    pub fn new(id: impl Into<String>, fallback: StubOutcome) -> Self {
        Self {
            id: id.into(),
            languages: vec!["py".into(), "js".into(), "go".into()],
            categories: vec![Category::CommandInjection, Category::HardcodedSecret],
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            healthy: true,
        }
    }

    /// A driver that always completes with the given findings
    pub fn completing(id: impl Into<String>, findings: Vec<Finding>) -> Self {
        Self::new(id, StubOutcome::Complete(findings))
    }

    /// A driver that always reports scanner failure
    pub fn failing(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(id, StubOutcome::Fail(message.into()))
    }

    /// A driver that always violates its preconditions
    pub fn erroring(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(id, StubOutcome::Error(message.into()))
    }

    /// Queue outcomes consumed in order before the fallback applies
    pub fn with_script(self, outcomes: Vec<StubOutcome>) -> Self {
        *self.script.lock().unwrap() = outcomes.into();
        self
    }

    /// Make every scan take this long
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_languages(mut self, languages: Vec<String>) -> Self {
        self.languages = languages;
        self
    }

    pub fn unhealthy(mut self) -> Self {
        self.healthy = false;
        self
    }

    /// How many times `scan` ran
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentDriver for StubDriver {
    async fn scan(&self, _config: ScanConfig) -> OrchestratorResult<AgentResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match outcome {
            StubOutcome::Complete(findings) => Ok(AgentResult::completed(&self.id, findings)
                .with_metadata("tool_version", "0.0.0-stub")),
            StubOutcome::Fail(message) => Ok(AgentResult::failed(&self.id, message)),
            StubOutcome::Error(message) => Err(OrchestratorError::AgentPrecondition {
                agent: self.id.clone(),
                message,
            }),
        }
    }

    async fn health_check(&self) -> HealthStatus {
        if self.healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy {
                reason: "scripted as unhealthy".into(),
            }
        }
    }

    fn config(&self) -> DriverConfig {
        DriverConfig {
            id: self.id.clone(),
            version: "0.0.0-stub".into(),
            languages: self.languages.clone(),
            categories: self.categories.clone(),
            requires_docker: false,
        }
    }

    fn version(&self) -> DriverVersion {
        DriverVersion {
            agent_version: "0.0.0-stub".into(),
            tool_version: "0.0.0-stub".into(),
            build_date: "1970-01-01".into(),
        }
    }
}

/// Shorthand for a finding in tests
pub fn test_finding(
    tool: &str,
    rule: &str,
    path: &str,
    line: u32,
    confidence: f64,
) -> Finding {
    Finding::new(
        tool,
        rule,
        crate::model::Severity::High,
        Category::CommandInjection,
        format!("{rule} at {path}:{line}"),
        path,
        line,
    )
    .with_confidence(confidence)
}
