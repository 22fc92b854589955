//! Cross-agent consensus
//!
//! Merges per-agent findings into a deduplicated, confidence-scored set.
//! Two findings describe the same vulnerability when they agree on
//! (category, file path, line) and their rule ids are equal or belong to
//! the same externally configured equivalence class. Consensus scores are
//! taken per cluster against the agents that actually scanned the
//! cluster's file. The merge is deterministic and invariant under
//! permutation of the input results.

mod equivalence;

pub use equivalence::RuleEquivalence;

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::config::ConfidenceFloors;
use crate::model::{AgentResult, AgentRunStatus, Category, ConsensusFinding, Finding, Severity};

/// Unanimous agreement never reports as certainty
const CONFIDENCE_CEILING: f64 = 0.99;

/// One finding together with the agent that reported it
#[derive(Debug, Clone)]
struct Reported {
    agent: String,
    finding: Finding,
}

/// Which files each agent is able to scan, by language.
///
/// The consensus-score denominator for a cluster counts only the agents
/// that completed a scan *and* cover the cluster's file; a Go-only tool
/// that ran alongside a Python-only tool never scanned the Python file
/// and must not dilute agreement on findings in it.
#[derive(Debug, Clone, Default)]
pub struct AgentCoverage {
    languages_by_agent: HashMap<String, Vec<String>>,
}

impl AgentCoverage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an agent's supported languages (file-extension names).
    pub fn insert(&mut self, agent: impl Into<String>, languages: Vec<String>) {
        self.languages_by_agent.insert(agent.into(), languages);
    }

    /// Whether the agent's tool looks at this file. An unlisted agent or
    /// an empty language list covers every file.
    fn covers(&self, agent: &str, path: &str) -> bool {
        let Some(languages) = self.languages_by_agent.get(agent) else {
            return true;
        };
        if languages.is_empty() {
            return true;
        }
        path.rsplit('.')
            .next()
            .map(|ext| languages.iter().any(|l| l == ext))
            .unwrap_or(false)
    }
}

/// The consensus engine
pub struct ConsensusEngine {
    floors: ConfidenceFloors,
    equivalence: RuleEquivalence,
}

impl ConsensusEngine {
    pub fn new(floors: ConfidenceFloors, equivalence: RuleEquivalence) -> Self {
        Self {
            floors,
            equivalence,
        }
    }

    /// Merge agent results into consensus findings, treating every
    /// completed agent as covering every file.
    pub fn merge(&self, results: &[AgentResult]) -> Vec<ConsensusFinding> {
        self.merge_with_coverage(results, &AgentCoverage::default())
    }

    /// Merge agent results into consensus findings.
    ///
    /// Only Completed results contribute findings, and each cluster's
    /// consensus score is taken against the completed agents covering
    /// that cluster's file. The output ordering is (severity desc, final
    /// confidence desc, file path asc, line asc).
    pub fn merge_with_coverage(
        &self,
        results: &[AgentResult],
        coverage: &AgentCoverage,
    ) -> Vec<ConsensusFinding> {
        let completed: Vec<&AgentResult> = results
            .iter()
            .filter(|r| r.status == AgentRunStatus::Completed)
            .collect();

        // Distinct completed agents; per-cluster denominators are carved
        // out of this set by file coverage.
        let mut completed_agents: Vec<String> = completed
            .iter()
            .map(|r| r.agent.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        completed_agents.sort();

        // Flatten to (agent, finding) pairs in a canonical order so the
        // clustering below cannot observe agent arrival order.
        let mut reported: Vec<Reported> = completed
            .iter()
            .flat_map(|r| {
                r.findings.iter().map(|f| Reported {
                    agent: r.agent.clone(),
                    finding: f.clone(),
                })
            })
            .collect();
        reported.sort_by(|a, b| {
            a.agent
                .cmp(&b.agent)
                .then_with(|| a.finding.rule_id.cmp(&b.finding.rule_id))
                .then_with(|| a.finding.id.cmp(&b.finding.id))
        });

        let clusters = self.cluster(reported);
        debug!(clusters = clusters.len(), "clustered findings");

        let mut merged: Vec<ConsensusFinding> = clusters
            .into_iter()
            .map(|cluster| self.score_cluster(cluster, &completed_agents, coverage))
            .filter(|cf| self.passes_floor(cf))
            .collect();

        merged.sort_by(|a, b| {
            b.finding
                .severity
                .cmp(&a.finding.severity)
                .then_with(|| {
                    b.finding
                        .confidence
                        .partial_cmp(&a.finding.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.finding.file_path.cmp(&b.finding.file_path))
                .then_with(|| a.finding.line.cmp(&b.finding.line))
        });
        merged
    }

    /// Group reports into same-vulnerability clusters.
    fn cluster(&self, reported: Vec<Reported>) -> Vec<Vec<Reported>> {
        // Bucket on the exact-match part of the key first.
        let mut buckets: HashMap<(Category, String, u32), Vec<Reported>> = HashMap::new();
        for report in reported {
            let key = (
                report.finding.category,
                report.finding.file_path.clone(),
                report.finding.line,
            );
            buckets.entry(key).or_default().push(report);
        }

        // Deterministic bucket order.
        let mut keys: Vec<_> = buckets.keys().cloned().collect();
        keys.sort_by(|a, b| {
            a.1.cmp(&b.1)
                .then_with(|| a.2.cmp(&b.2))
                .then_with(|| a.0.to_string().cmp(&b.0.to_string()))
        });

        let mut clusters: Vec<Vec<Reported>> = Vec::new();
        for key in keys {
            let bucket = buckets.remove(&key).expect("bucket exists");
            // Within a bucket, rule identity or a shared equivalence class
            // joins a report to a cluster.
            let mut bucket_clusters: Vec<Vec<Reported>> = Vec::new();
            for report in bucket {
                let matching = bucket_clusters.iter_mut().find(|cluster| {
                    cluster.iter().any(|member| {
                        self.equivalence
                            .equivalent(&member.finding.rule_id, &report.finding.rule_id)
                    })
                });
                match matching {
                    Some(cluster) => cluster.push(report),
                    None => bucket_clusters.push(vec![report]),
                }
            }
            clusters.extend(bucket_clusters);
        }
        clusters
    }

    /// Apply the per-cluster scoring rules.
    fn score_cluster(
        &self,
        cluster: Vec<Reported>,
        completed_agents: &[String],
        coverage: &AgentCoverage,
    ) -> ConsensusFinding {
        let final_severity = cluster
            .iter()
            .map(|r| r.finding.severity)
            .max()
            .unwrap_or(Severity::Low);

        // Probability-of-agreement combiner.
        let miss_product: f64 = cluster
            .iter()
            .map(|r| 1.0 - r.finding.confidence.clamp(0.0, 1.0))
            .product();
        let final_confidence = (1.0 - miss_product).clamp(0.0, CONFIDENCE_CEILING);

        let mut agents: Vec<String> = cluster
            .iter()
            .map(|r| r.agent.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        agents.sort();

        // Agents that scanned this cluster's file: completed agents whose
        // tool covers it, plus any agent that reported here regardless
        // (reporting a finding in a file is proof it was scanned).
        let file_path = &cluster[0].finding.file_path;
        let scanned_file = completed_agents
            .iter()
            .filter(|a| agents.contains(*a) || coverage.covers(a.as_str(), file_path))
            .count()
            .max(1);
        let consensus_score = agents.len() as f64 / scanned_file as f64;

        // Canonical representative: highest confidence, ties broken by
        // lexicographic tool id.
        let canonical = cluster
            .iter()
            .min_by(|a, b| {
                b.finding
                    .confidence
                    .partial_cmp(&a.finding.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.finding.tool.cmp(&b.finding.tool))
            })
            .expect("cluster is non-empty");

        let mut finding = canonical.finding.clone();
        finding.severity = final_severity;
        finding.confidence = final_confidence;
        finding.consensus_score = Some(consensus_score);

        ConsensusFinding {
            finding,
            reported_by: agents,
        }
    }

    fn passes_floor(&self, cf: &ConsensusFinding) -> bool {
        let floor = match cf.finding.severity {
            Severity::High => self.floors.high,
            Severity::Medium => self.floors.medium,
            Severity::Low => self.floors.low,
        };
        cf.finding.confidence >= floor
    }
}

impl Default for ConsensusEngine {
    fn default() -> Self {
        Self::new(ConfidenceFloors::default(), RuleEquivalence::default())
    }
}
