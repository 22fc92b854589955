//! Agent driver contract
//!
//! Every scanning tool is wrapped by a driver implementing this capability
//! set. Drivers must keep scanner-level failures inside `AgentResult`
//! (status Failed/Timeout) and may only error on precondition violations
//! such as a missing container runtime. A driver facing a repository with
//! no files in its supported languages completes cleanly with zero
//! findings.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorResult;
use crate::model::{AgentResult, Category};

/// What the dispatcher hands a driver for one scan
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Repository locator: URL or local path
    pub repo: String,
    pub branch: String,
    pub commit: Option<String>,
    /// Languages the caller cares about; empty means all
    pub languages: Vec<String>,
    /// Checked-out worktree to scan
    pub workdir: PathBuf,
    /// Files to scan; empty means the whole repository
    pub files: Vec<String>,
    /// Wall-clock budget for this invocation
    pub timeout: Duration,
}

/// Driver identity and capabilities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    pub id: String,
    pub version: String,
    /// Languages the wrapped tool understands (file-extension names)
    pub languages: Vec<String>,
    /// Vulnerability categories the tool can report
    pub categories: Vec<Category>,
    pub requires_docker: bool,
}

/// Version facts for a driver and its wrapped tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverVersion {
    pub agent_version: String,
    pub tool_version: String,
    pub build_date: String,
}

/// Driver health probe outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// The tool configuration facts that participate in cache keying.
///
/// Two scans of identical file content are only interchangeable when the
/// tool version, rule set, exclusions, and severity threshold all match;
/// the digest of this profile is the cache key's config hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolProfile {
    pub tool_version: String,
    pub rules: Vec<String>,
    pub exclusions: Vec<String>,
    pub severity_threshold: String,
}

impl ToolProfile {
    pub fn new(tool_version: impl Into<String>) -> Self {
        Self {
            tool_version: tool_version.into(),
            rules: Vec::new(),
            exclusions: Vec::new(),
            severity_threshold: "low".into(),
        }
    }

    /// Stable digest over the profile.
    ///
    /// Components are sorted before hashing so rule ordering in a config
    /// file cannot change the digest.
    pub fn digest(&self) -> String {
        let mut rules = self.rules.clone();
        rules.sort();
        let mut exclusions = self.exclusions.clone();
        exclusions.sort();

        let mut hasher = blake3::Hasher::new();
        hasher.update(self.tool_version.as_bytes());
        hasher.update(b"\n");
        for rule in &rules {
            hasher.update(rule.as_bytes());
            hasher.update(b"\x1f");
        }
        hasher.update(b"\n");
        for pattern in &exclusions {
            hasher.update(pattern.as_bytes());
            hasher.update(b"\x1f");
        }
        hasher.update(b"\n");
        hasher.update(self.severity_threshold.as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

/// Capability set every agent driver exposes
#[async_trait]
pub trait AgentDriver: Send + Sync {
    /// Run one scan. Scanner failures are reported via
    /// `AgentResult::status`, never as an Err.
    async fn scan(&self, config: ScanConfig) -> OrchestratorResult<AgentResult>;

    async fn health_check(&self) -> HealthStatus;

    fn config(&self) -> DriverConfig;

    fn version(&self) -> DriverVersion;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_digest_is_order_insensitive() {
        let mut a = ToolProfile::new("1.7.5");
        a.rules = vec!["B602".into(), "B603".into()];
        a.exclusions = vec!["tests/".into(), "vendor/".into()];

        let mut b = ToolProfile::new("1.7.5");
        b.rules = vec!["B603".into(), "B602".into()];
        b.exclusions = vec!["vendor/".into(), "tests/".into()];

        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_profile_digest_tracks_every_component() {
        let base = ToolProfile::new("1.7.5");
        let base_digest = base.digest();

        let mut v = base.clone();
        v.tool_version = "1.8.0".into();
        assert_ne!(v.digest(), base_digest);

        let mut v = base.clone();
        v.rules.push("B602".into());
        assert_ne!(v.digest(), base_digest);

        let mut v = base.clone();
        v.exclusions.push("vendor/".into());
        assert_ne!(v.digest(), base_digest);

        let mut v = base.clone();
        v.severity_threshold = "high".into();
        assert_ne!(v.digest(), base_digest);
    }
}
