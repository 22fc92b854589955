//! Work plans and file-change descriptions

use serde::{Deserialize, Serialize};

use super::finding::Finding;

/// How a changed file differs between two commits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    /// Deleted paths trigger cache invalidation and are never scanned
    Deleted,
    Renamed {
        old_path: String,
    },
    /// Treated as Added for planning purposes
    Copied,
}

/// One entry per differing file between two commits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
}

impl FileChange {
    pub fn new(path: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.kind == ChangeKind::Deleted
    }

    /// The previous path freed by this change, if any
    pub fn vacated_path(&self) -> Option<&str> {
        match &self.kind {
            ChangeKind::Deleted => Some(&self.path),
            ChangeKind::Renamed { old_path } => Some(old_path),
            _ => None,
        }
    }
}

/// Scan strategy chosen by the planner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStrategy {
    Full,
    Incremental,
}

/// A prior result taken from the cache for one (file, tool) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResult {
    pub path: String,
    pub tool: String,
    pub findings: Vec<Finding>,
}

/// The planner's output: which files to scan live and which prior results
/// substitute for a scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkPlan {
    pub strategy: PlanStrategy,
    /// Why this strategy was chosen
    pub reason: String,
    /// Files to scan live; empty means the agents decide (full scan)
    pub live_files: Vec<String>,
    /// Prior results substituting for live scans. Empty when strategy is Full.
    pub cached: Vec<CachedResult>,
    /// cached files / total scannable changed files
    pub hit_ratio: f64,
    /// Agents selected for this job
    pub agents: Vec<String>,
}

impl WorkPlan {
    /// A full scan: everything live, nothing cached.
    pub fn full(reason: impl Into<String>, agents: Vec<String>) -> Self {
        Self {
            strategy: PlanStrategy::Full,
            reason: reason.into(),
            live_files: Vec::new(),
            cached: Vec::new(),
            hit_ratio: 0.0,
            agents,
        }
    }

    pub fn is_full(&self) -> bool {
        self.strategy == PlanStrategy::Full
    }

    /// Summary for job metadata
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "strategy": self.strategy,
            "reason": self.reason,
            "live_files": self.live_files.len(),
            "cached_results": self.cached.len(),
            "hit_ratio": self.hit_ratio,
            "agents": self.agents,
        })
    }
}
