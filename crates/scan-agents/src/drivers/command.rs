//! External-command agent driver
//!
//! Invokes the configured scanner command and parses the canonical
//! findings JSON it prints to stdout. Many scanners exit non-zero when
//! they find issues; a non-zero exit with well-formed output is a
//! completed scan, not a failure. A repository with no files in the
//! tool's languages is skipped cleanly with zero findings.

use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use orchestration::{
    AgentDriver, AgentResult, DriverConfig, DriverVersion, Finding, HealthStatus,
    OrchestratorError, OrchestratorResult, ScanConfig,
};

use crate::config::AgentSpec;

use super::{parse_category, parse_severity};

/// Canonical report printed by agent wrappers: either a bare findings
/// array or an object carrying scan metadata alongside it.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawReport {
    Findings(Vec<RawFinding>),
    Report {
        findings: Vec<RawFinding>,
        #[serde(default)]
        tool_version: Option<String>,
        #[serde(default)]
        files_scanned: Option<u64>,
        #[serde(default)]
        lines_scanned: Option<u64>,
    },
}

#[derive(Debug, Deserialize)]
struct RawFinding {
    #[serde(alias = "rule")]
    rule_id: String,
    severity: String,
    #[serde(default)]
    category: Option<String>,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(alias = "file", alias = "file_path")]
    path: String,
    line: u32,
    #[serde(default)]
    column: Option<u32>,
    #[serde(default)]
    snippet: Option<String>,
    #[serde(default = "default_confidence")]
    confidence: f64,
    #[serde(default)]
    fix_suggestion: Option<String>,
    #[serde(default)]
    references: Vec<String>,
}

fn default_confidence() -> f64 {
    0.8
}

/// Driver wrapping one configured external scanner
pub struct CommandDriver {
    spec: AgentSpec,
}

impl CommandDriver {
    pub fn new(spec: AgentSpec) -> Self {
        Self { spec }
    }

    fn supports_extension(&self, path: &str) -> bool {
        path.rsplit('.')
            .next()
            .map(|ext| self.spec.languages.iter().any(|l| l == ext))
            .unwrap_or(false)
    }

    /// Whether any file under `root` carries a supported extension.
    /// Hidden directories (.git and friends) are skipped.
    fn workdir_has_supported_files(&self, root: &Path) -> bool {
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let name = entry.file_name();
                if name.to_string_lossy().starts_with('.') {
                    continue;
                }
                if path.is_dir() {
                    stack.push(path);
                } else if self.supports_extension(&path.to_string_lossy()) {
                    return true;
                }
            }
        }
        false
    }

    fn should_skip(&self, config: &ScanConfig) -> bool {
        if !config.files.is_empty() {
            return !config.files.iter().any(|f| self.supports_extension(f));
        }
        !self.workdir_has_supported_files(&config.workdir)
    }

    fn build_argv(&self, config: &ScanConfig) -> OrchestratorResult<Vec<String>> {
        let files = config.files.join(" ");
        let command = self
            .spec
            .command
            .replace("{repo}", &config.workdir.to_string_lossy())
            .replace("{files}", &files);

        let argv = shlex::split(&command).ok_or_else(|| OrchestratorError::AgentPrecondition {
            agent: self.spec.id.clone(),
            message: format!("unparseable command template: {command}"),
        })?;
        if argv.is_empty() {
            return Err(OrchestratorError::AgentPrecondition {
                agent: self.spec.id.clone(),
                message: "empty command template".into(),
            });
        }
        Ok(argv)
    }

    fn parse_findings(&self, stdout: &[u8]) -> Result<(Vec<Finding>, serde_json::Value), String> {
        let report: RawReport =
            serde_json::from_slice(stdout).map_err(|e| format!("unparseable output: {e}"))?;

        let (raw_findings, meta) = match report {
            RawReport::Findings(findings) => (findings, serde_json::json!({})),
            RawReport::Report {
                findings,
                tool_version,
                files_scanned,
                lines_scanned,
            } => (
                findings,
                serde_json::json!({
                    "tool_version": tool_version,
                    "files_scanned": files_scanned,
                    "lines_scanned": lines_scanned,
                }),
            ),
        };

        let findings = raw_findings
            .into_iter()
            .map(|raw| {
                let mut finding = Finding::new(
                    self.spec.id.clone(),
                    raw.rule_id,
                    parse_severity(&raw.severity),
                    parse_category(raw.category.as_deref().unwrap_or("other")),
                    raw.title,
                    raw.path,
                    raw.line,
                )
                .with_description(raw.description)
                .with_confidence(raw.confidence);
                finding.column = raw.column;
                finding.snippet = raw.snippet;
                finding.fix_suggestion = raw.fix_suggestion;
                finding.references = raw.references;
                finding
            })
            .collect();

        Ok((findings, meta))
    }
}

#[async_trait]
impl AgentDriver for CommandDriver {
    async fn scan(&self, config: ScanConfig) -> OrchestratorResult<AgentResult> {
        let started = Instant::now();

        if self.should_skip(&config) {
            debug!(agent = %self.spec.id, "no supported files, skipping cleanly");
            return Ok(AgentResult::completed(&self.spec.id, Vec::new())
                .with_metadata("files_scanned", 0)
                .with_metadata("skipped", "no supported files")
                .with_duration_ms(started.elapsed().as_millis() as u64));
        }

        let argv = self.build_argv(&config)?;
        let mut command = tokio::process::Command::new(&argv[0]);
        command.args(&argv[1..]).kill_on_drop(true);
        if config.workdir.is_dir() {
            command.current_dir(&config.workdir);
        }

        let output = command.output().await.map_err(|e| {
            // A missing binary or container runtime is a precondition
            // violation, not a scan outcome.
            OrchestratorError::AgentPrecondition {
                agent: self.spec.id.clone(),
                message: format!("cannot launch {}: {e}", argv[0]),
            }
        })?;

        let exit_code = output.status.code().unwrap_or(-1);
        let duration_ms = started.elapsed().as_millis() as u64;
        let stdout_empty = output.stdout.iter().all(u8::is_ascii_whitespace);

        if stdout_empty {
            return Ok(if output.status.success() {
                AgentResult::completed(&self.spec.id, Vec::new())
                    .with_metadata("exit_code", exit_code)
                    .with_duration_ms(duration_ms)
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr);
                AgentResult::failed(
                    &self.spec.id,
                    format!("exit code {exit_code}: {}", stderr.trim()),
                )
                .with_metadata("exit_code", exit_code)
                .with_duration_ms(duration_ms)
            });
        }

        match self.parse_findings(&output.stdout) {
            Ok((findings, meta)) => {
                debug!(
                    agent = %self.spec.id,
                    findings = findings.len(),
                    exit_code,
                    "scan finished"
                );
                Ok(AgentResult::completed(&self.spec.id, findings)
                    .with_metadata("exit_code", exit_code)
                    .with_metadata("report", meta)
                    .with_duration_ms(duration_ms))
            }
            Err(parse_error) => {
                warn!(agent = %self.spec.id, error = %parse_error, "scanner output rejected");
                Ok(AgentResult::failed(&self.spec.id, parse_error)
                    .with_metadata("exit_code", exit_code)
                    .with_duration_ms(duration_ms))
            }
        }
    }

    async fn health_check(&self) -> HealthStatus {
        let Some(probe) = &self.spec.health_command else {
            return HealthStatus::Healthy;
        };
        let Some(argv) = shlex::split(probe) else {
            return HealthStatus::Unhealthy {
                reason: format!("unparseable health command: {probe}"),
            };
        };
        if argv.is_empty() {
            return HealthStatus::Unhealthy {
                reason: "empty health command".into(),
            };
        }

        match tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .output()
            .await
        {
            Ok(output) if output.status.success() => HealthStatus::Healthy,
            Ok(output) => HealthStatus::Unhealthy {
                reason: format!(
                    "probe exited {}: {}",
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            },
            Err(e) => HealthStatus::Unhealthy {
                reason: format!("cannot launch probe: {e}"),
            },
        }
    }

    fn config(&self) -> DriverConfig {
        DriverConfig {
            id: self.spec.id.clone(),
            version: env!("CARGO_PKG_VERSION").into(),
            languages: self.spec.languages.clone(),
            categories: self
                .spec
                .categories
                .iter()
                .map(|c| parse_category(c))
                .collect(),
            requires_docker: self.spec.requires_docker,
        }
    }

    fn version(&self) -> DriverVersion {
        DriverVersion {
            agent_version: env!("CARGO_PKG_VERSION").into(),
            tool_version: self.spec.tool_version.clone(),
            build_date: option_env!("SCANHIVE_BUILD_DATE").unwrap_or("unknown").into(),
        }
    }
}
