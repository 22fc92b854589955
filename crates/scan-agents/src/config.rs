//! Runtime configuration for the daemon
//!
//! Pipeline knobs come from the environment (see
//! `orchestration::OrchestratorConfig`); agent wiring comes from a TOML
//! file describing each scanner's command line, capabilities, and tool
//! profile:
//!
//! ```toml
//! [[agents]]
//! id = "bandit"
//! command = "docker run --rm -v {repo}:/src scanhive/bandit-agent {files}"
//! health_command = "docker info"
//! languages = ["py"]
//! categories = ["command-injection", "hardcoded-secret"]
//! tool_version = "1.7.5"
//! rules = []
//! exclusions = ["tests/"]
//! severity_threshold = "low"
//! requires_docker = true
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use orchestration::{OrchestratorConfig, RuleEquivalence, ToolProfile};

/// One configured scanner agent
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSpec {
    pub id: String,
    /// Command template; `{repo}` and `{files}` are substituted per scan
    pub command: String,
    /// Optional probe command for health checks
    #[serde(default)]
    pub health_command: Option<String>,
    pub languages: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    pub tool_version: String,
    #[serde(default)]
    pub rules: Vec<String>,
    #[serde(default)]
    pub exclusions: Vec<String>,
    #[serde(default = "default_severity_threshold")]
    pub severity_threshold: String,
    #[serde(default)]
    pub requires_docker: bool,
}

fn default_severity_threshold() -> String {
    "low".into()
}

impl AgentSpec {
    pub fn tool_profile(&self) -> ToolProfile {
        ToolProfile {
            tool_version: self.tool_version.clone(),
            rules: self.rules.clone(),
            exclusions: self.exclusions.clone(),
            severity_threshold: self.severity_threshold.clone(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct AgentsFile {
    #[serde(default)]
    agents: Vec<AgentSpec>,
}

/// Full daemon configuration
#[derive(Debug)]
pub struct RuntimeConfig {
    pub orchestrator: OrchestratorConfig,
    pub agents: Vec<AgentSpec>,
    pub equivalence: RuleEquivalence,
}

impl RuntimeConfig {
    /// Load configuration: pipeline knobs from the environment, agents
    /// from the given TOML file (or `SCANHIVE_AGENTS_FILE`), rule
    /// equivalences from `SCANHIVE_RULE_EQUIVALENCE` when set.
    pub fn load(agents_file: Option<&Path>) -> Result<Self> {
        let orchestrator = OrchestratorConfig::default();
        orchestrator
            .validate()
            .context("invalid orchestrator configuration")?;

        let agents_path: Option<PathBuf> = agents_file
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("SCANHIVE_AGENTS_FILE").ok().map(PathBuf::from));

        let agents = match &agents_path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading agents file {}", path.display()))?;
                Self::parse_agents(&raw)?
            }
            None => Vec::new(),
        };

        let equivalence = match std::env::var("SCANHIVE_RULE_EQUIVALENCE") {
            Ok(path) => RuleEquivalence::from_file(&path)
                .with_context(|| format!("reading rule equivalences from {path}"))?,
            Err(_) => RuleEquivalence::default(),
        };

        Ok(Self {
            orchestrator,
            agents,
            equivalence,
        })
    }

    pub fn parse_agents(raw: &str) -> Result<Vec<AgentSpec>> {
        let file: AgentsFile = toml::from_str(raw).context("parsing agents TOML")?;
        for spec in &file.agents {
            if spec.id.trim().is_empty() {
                anyhow::bail!("agent with empty id");
            }
            if spec.command.trim().is_empty() {
                anyhow::bail!("agent {} has an empty command", spec.id);
            }
            if spec.languages.is_empty() {
                anyhow::bail!("agent {} lists no languages", spec.id);
            }
        }
        Ok(file.agents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[agents]]
id = "bandit"
command = "bandit-agent --format json {files}"
languages = ["py"]
categories = ["command-injection"]
tool_version = "1.7.5"
exclusions = ["tests/"]

[[agents]]
id = "gosec"
command = "gosec-agent {repo}"
health_command = "gosec-agent --version"
languages = ["go"]
tool_version = "2.19.0"
severity_threshold = "medium"
requires_docker = true
"#;

    #[test]
    fn test_parse_agents() {
        let agents = RuntimeConfig::parse_agents(SAMPLE).unwrap();
        assert_eq!(agents.len(), 2);

        let bandit = &agents[0];
        assert_eq!(bandit.id, "bandit");
        assert_eq!(bandit.severity_threshold, "low");
        assert!(!bandit.requires_docker);

        let gosec = &agents[1];
        assert_eq!(gosec.health_command.as_deref(), Some("gosec-agent --version"));
        assert_eq!(gosec.severity_threshold, "medium");
        assert!(gosec.requires_docker);
    }

    #[test]
    fn test_parse_rejects_incomplete_specs() {
        let missing_langs = r#"
[[agents]]
id = "x"
command = "x-agent"
languages = []
tool_version = "1.0"
"#;
        assert!(RuntimeConfig::parse_agents(missing_langs).is_err());
    }

    #[test]
    fn test_tool_profile_round_trip() {
        let agents = RuntimeConfig::parse_agents(SAMPLE).unwrap();
        let profile = agents[0].tool_profile();
        assert_eq!(profile.tool_version, "1.7.5");
        assert_eq!(profile.exclusions, vec!["tests/"]);
        // Same spec, same digest.
        assert_eq!(profile.digest(), agents[0].tool_profile().digest());
    }
}
