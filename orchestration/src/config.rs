//! Orchestrator configuration
//!
//! Every knob has an environment override so deployments can tune the
//! pipeline without a config file. Defaults match the documented behaviour
//! of the dispatcher, planner, cache, and consensus engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Minimum final confidence per severity; weaker findings are dropped.
///
/// Lower severities need higher confidence to survive noise.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConfidenceFloors {
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl Default for ConfidenceFloors {
    fn default() -> Self {
        Self {
            high: 0.5,
            medium: 0.6,
            low: 0.7,
        }
    }
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Dispatcher worker pool size.
    /// Populated from `SCANHIVE_WORKERS` (default: 5).
    pub workers: usize,
    /// Agent fan-out cap within a single job.
    /// Populated from `SCANHIVE_AGENT_CONCURRENCY` (default: 3).
    pub agent_concurrency: usize,
    /// Cache entry time-to-live.
    /// Populated from `SCANHIVE_CACHE_TTL_SECS` (default: 24 h).
    pub cache_ttl: Duration,
    /// Default per-agent scan budget; the effective budget is
    /// min(request timeout, this).
    /// Populated from `SCANHIVE_AGENT_TIMEOUT_SECS` (default: 120).
    pub agent_default_timeout: Duration,
    /// Diff size above which the planner falls back to a full scan.
    /// Populated from `SCANHIVE_MAX_DIFF_FILES` (default: 100).
    pub max_diff_files: usize,
    /// Cache-hit ratio at or below which the planner falls back to a
    /// full scan.
    /// Populated from `SCANHIVE_MIN_HIT_RATIO` (default: 0.3).
    pub min_hit_ratio: f64,
    /// Delay before the single transient-agent-failure retry.
    pub agent_retry_delay: Duration,
    /// Consensus confidence floors per severity.
    pub confidence_floors: ConfidenceFloors,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: env_parse("SCANHIVE_WORKERS", 5),
            agent_concurrency: env_parse("SCANHIVE_AGENT_CONCURRENCY", 3),
            cache_ttl: Duration::from_secs(env_parse("SCANHIVE_CACHE_TTL_SECS", 86_400)),
            agent_default_timeout: Duration::from_secs(env_parse(
                "SCANHIVE_AGENT_TIMEOUT_SECS",
                120,
            )),
            max_diff_files: env_parse("SCANHIVE_MAX_DIFF_FILES", 100),
            min_hit_ratio: env_parse("SCANHIVE_MIN_HIT_RATIO", 0.3),
            agent_retry_delay: Duration::from_secs(2),
            confidence_floors: ConfidenceFloors::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Validate startup invariants; violations are fatal per the error
    /// policy (surfaced at start-up, never at per-job level).
    pub fn validate(&self) -> crate::error::OrchestratorResult<()> {
        if self.workers == 0 {
            return Err(crate::error::OrchestratorError::config(
                "worker pool size must be positive",
            ));
        }
        if self.agent_concurrency == 0 {
            return Err(crate::error::OrchestratorError::config(
                "agent concurrency must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&self.min_hit_ratio) {
            return Err(crate::error::OrchestratorError::config(
                "min hit ratio must be within [0.0, 1.0]",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.workers, 5);
        assert_eq!(cfg.agent_concurrency, 3);
        assert_eq!(cfg.cache_ttl, Duration::from_secs(86_400));
        assert_eq!(cfg.max_diff_files, 100);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let cfg = OrchestratorConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_default_floors() {
        let floors = ConfidenceFloors::default();
        assert_eq!(floors.high, 0.5);
        assert_eq!(floors.medium, 0.6);
        assert_eq!(floors.low, 0.7);
    }
}
