//! Findings, agent results, and consensus output types

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Severity of a finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl Severity {
    /// Numeric rank for comparisons; higher is more severe
    pub fn rank(&self) -> u8 {
        match self {
            Severity::High => 3,
            Severity::Medium => 2,
            Severity::Low => 1,
        }
    }
}

impl PartialOrd for Severity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Severity {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::High => write!(f, "high"),
            Severity::Medium => write!(f, "medium"),
            Severity::Low => write!(f, "low"),
        }
    }
}

/// Vulnerability category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    CommandInjection,
    SqlInjection,
    Xss,
    InsecureCrypto,
    HardcodedSecret,
    PathTraversal,
    InsecureDeserialization,
    Misconfiguration,
    Other,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Category::CommandInjection => "command-injection",
            Category::SqlInjection => "sql-injection",
            Category::Xss => "xss",
            Category::InsecureCrypto => "insecure-crypto",
            Category::HardcodedSecret => "hardcoded-secret",
            Category::PathTraversal => "path-traversal",
            Category::InsecureDeserialization => "insecure-deserialization",
            Category::Misconfiguration => "misconfiguration",
            Category::Other => "other",
        };
        write!(f, "{s}")
    }
}

/// Triage status of a finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingStatus {
    Open,
    Fixed,
    Ignored,
    FalsePositive,
}

/// Canonical vulnerability record emitted by agents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    /// Stable id: a pure function of (tool, rule id, file basename, line)
    pub id: String,
    /// Tool that emitted the finding
    pub tool: String,
    pub rule_id: String,
    pub severity: Severity,
    pub category: Category,
    pub title: String,
    pub description: String,
    pub file_path: String,
    pub line: u32,
    pub column: Option<u32>,
    pub snippet: Option<String>,
    /// Tool-reported confidence in [0.0, 1.0]
    pub confidence: f64,
    /// Cross-agent agreement in [0.0, 1.0]; set by consensus
    pub consensus_score: Option<f64>,
    pub status: FindingStatus,
    pub fix_suggestion: Option<String>,
    pub references: Vec<String>,
}

impl Finding {
    pub fn new(
        tool: impl Into<String>,
        rule_id: impl Into<String>,
        severity: Severity,
        category: Category,
        title: impl Into<String>,
        file_path: impl Into<String>,
        line: u32,
    ) -> Self {
        let tool = tool.into();
        let rule_id = rule_id.into();
        let file_path = file_path.into();
        Self {
            id: Self::compute_id(&tool, &rule_id, &file_path, line),
            tool,
            rule_id,
            severity,
            category,
            title: title.into(),
            description: String::new(),
            file_path,
            line,
            column: None,
            snippet: None,
            confidence: 1.0,
            consensus_score: None,
            status: FindingStatus::Open,
            fix_suggestion: None,
            references: Vec::new(),
        }
    }

    /// Stable finding id: SHA-256 over (tool, rule id, file basename, line),
    /// truncated to 32 hex characters.
    ///
    /// The basename (not the full path) participates so the id survives a
    /// repository being checked out under a different root.
    pub fn compute_id(tool: &str, rule_id: &str, file_path: &str, line: u32) -> String {
        let basename = Path::new(file_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_path.to_string());

        let mut hasher = Sha256::new();
        hasher.update(tool.as_bytes());
        hasher.update(b":");
        hasher.update(rule_id.as_bytes());
        hasher.update(b":");
        hasher.update(basename.as_bytes());
        hasher.update(b":");
        hasher.update(line.to_string().as_bytes());

        let digest = hasher.finalize();
        let mut id = String::with_capacity(32);
        for byte in &digest[..16] {
            id.push_str(&format!("{byte:02x}"));
        }
        id
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }
}

/// Status of one agent's contribution to a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    Completed,
    Failed,
    Timeout,
    Skipped,
    Cancelled,
}

impl std::fmt::Display for AgentRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentRunStatus::Completed => write!(f, "completed"),
            AgentRunStatus::Failed => write!(f, "failed"),
            AgentRunStatus::Timeout => write!(f, "timeout"),
            AgentRunStatus::Skipped => write!(f, "skipped"),
            AgentRunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One agent's contribution to a scan job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent: String,
    pub status: AgentRunStatus,
    pub findings: Vec<Finding>,
    /// Tool version, files-scanned, lines-scanned, exit code
    pub metadata: HashMap<String, serde_json::Value>,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl AgentResult {
    pub fn completed(agent: impl Into<String>, findings: Vec<Finding>) -> Self {
        Self {
            agent: agent.into(),
            status: AgentRunStatus::Completed,
            findings,
            metadata: HashMap::new(),
            duration_ms: 0,
            error: None,
        }
    }

    pub fn failed(agent: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            status: AgentRunStatus::Failed,
            findings: Vec::new(),
            metadata: HashMap::new(),
            duration_ms: 0,
            error: Some(error.into()),
        }
    }

    pub fn timeout(agent: impl Into<String>, budget_secs: u64) -> Self {
        Self {
            agent: agent.into(),
            status: AgentRunStatus::Timeout,
            findings: Vec::new(),
            metadata: HashMap::new(),
            duration_ms: budget_secs * 1_000,
            error: Some(format!("scan exceeded {budget_secs}s budget")),
        }
    }

    pub fn cancelled(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            status: AgentRunStatus::Cancelled,
            findings: Vec::new(),
            metadata: HashMap::new(),
            duration_ms: 0,
            error: Some("cancelled".into()),
        }
    }

    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = ms;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.metadata.insert(key.into(), v);
        }
        self
    }
}

/// A merged finding with cross-agent agreement applied.
///
/// The embedded finding is the cluster's canonical representative with
/// final severity, final confidence, and the consensus score written in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusFinding {
    #[serde(flatten)]
    pub finding: Finding,
    /// Agents that reported this finding, sorted
    pub reported_by: Vec<String>,
}
