//! Agent registry
//!
//! Maps agent ids to their drivers and tool profiles. Built once at
//! startup, then shared read-only across dispatcher workers; registration
//! requires `&mut self`, so freezing the registry behind an `Arc` makes it
//! immutable for the rest of the process lifetime.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;

use crate::driver::{AgentDriver, HealthStatus, ToolProfile};
use crate::error::{OrchestratorError, OrchestratorResult};

struct RegisteredAgent {
    driver: Arc<dyn AgentDriver>,
    profile: ToolProfile,
}

/// Registry of all available scanning agents
pub struct AgentRegistry {
    agents: HashMap<String, RegisteredAgent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
        }
    }

    /// Register a driver with a default profile derived from its version.
    pub fn register(&mut self, driver: Arc<dyn AgentDriver>) {
        let profile = ToolProfile::new(driver.version().tool_version);
        self.register_with_profile(driver, profile);
    }

    /// Register a driver with an explicit tool profile (rules, exclusions,
    /// severity threshold from deployment config).
    pub fn register_with_profile(&mut self, driver: Arc<dyn AgentDriver>, profile: ToolProfile) {
        let id = driver.config().id;
        self.agents.insert(id, RegisteredAgent { driver, profile });
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn AgentDriver>> {
        self.agents.get(id).map(|a| a.driver.clone())
    }

    pub fn profile(&self, id: &str) -> Option<&ToolProfile> {
        self.agents.get(id).map(|a| &a.profile)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    /// All registered agent ids, sorted for deterministic iteration
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Resolve a requested agent set against the registry.
    ///
    /// An empty request selects every registered agent; otherwise every
    /// requested id must be registered.
    pub fn resolve_selection(&self, requested: &[String]) -> OrchestratorResult<Vec<String>> {
        if self.agents.is_empty() {
            return Err(OrchestratorError::config("no agents registered"));
        }
        if requested.is_empty() {
            return Ok(self.ids());
        }
        for id in requested {
            if !self.contains(id) {
                return Err(OrchestratorError::invalid_input(format!(
                    "unknown agent: {id}"
                )));
            }
        }
        let mut ids = requested.to_vec();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Agents whose wrapped tool understands at least one of the given
    /// languages; with no languages given, every agent qualifies.
    pub fn agents_for_languages(&self, languages: &[String]) -> Vec<String> {
        let mut ids: Vec<String> = self
            .agents
            .iter()
            .filter(|(_, a)| {
                languages.is_empty()
                    || a.driver
                        .config()
                        .languages
                        .iter()
                        .any(|l| languages.contains(l))
            })
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Probe every driver concurrently and report per-agent health.
    pub async fn health_report(&self) -> Vec<(String, HealthStatus)> {
        let probes = self.agents.iter().map(|(id, agent)| {
            let id = id.clone();
            let driver = agent.driver.clone();
            async move { (id, driver.health_check().await) }
        });
        let mut report = join_all(probes).await;
        report.sort_by(|a, b| a.0.cmp(&b.0));
        report
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::StubDriver;

    fn registry() -> AgentRegistry {
        let mut registry = AgentRegistry::new();
        registry.register(Arc::new(StubDriver::completing("bandit", vec![])));
        registry.register(Arc::new(StubDriver::completing("semgrep", vec![])));
        registry
    }

    #[test]
    fn test_ids_sorted() {
        assert_eq!(registry().ids(), vec!["bandit", "semgrep"]);
    }

    #[test]
    fn test_resolve_empty_selects_all() {
        let selected = registry().resolve_selection(&[]).unwrap();
        assert_eq!(selected, vec!["bandit", "semgrep"]);
    }

    #[test]
    fn test_resolve_rejects_unknown_agent() {
        let err = registry()
            .resolve_selection(&["bandit".into(), "gosec".into()])
            .unwrap_err();
        assert!(err.to_string().contains("gosec"));
    }

    #[test]
    fn test_resolve_dedups_request() {
        let selected = registry()
            .resolve_selection(&["bandit".into(), "bandit".into()])
            .unwrap();
        assert_eq!(selected, vec!["bandit"]);
    }

    #[test]
    fn test_agents_for_languages() {
        let registry = registry();
        // StubDriver claims python support.
        let ids = registry.agents_for_languages(&["py".to_string()]);
        assert_eq!(ids.len(), 2);
        let ids = registry.agents_for_languages(&["scala".to_string()]);
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn test_health_report_covers_all_agents() {
        let report = registry().health_report().await;
        assert_eq!(report.len(), 2);
        assert!(report.iter().all(|(_, h)| h.is_healthy()));
    }
}
