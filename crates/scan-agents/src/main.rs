mod config;
mod drivers;
mod runtime;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use orchestration::{FindingFilter, JobEvent, JobStore, Priority, ScanRequest};

use config::RuntimeConfig;
use runtime::{await_terminal, build_pipeline, build_registry, spawn_event_logger};

#[derive(Parser)]
#[command(name = "scan-agents", about = "Multi-agent security scan orchestrator")]
struct Cli {
    /// Agents TOML file (defaults to SCANHIVE_AGENTS_FILE)
    #[arg(long, global = true)]
    agents_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one scan to completion and print the merged findings
    Scan {
        /// Repository path to scan
        #[arg(long)]
        repo: String,
        #[arg(long, default_value = "main")]
        branch: String,
        #[arg(long)]
        commit: Option<String>,
        /// Baseline commit enabling an incremental plan
        #[arg(long)]
        prior_commit: Option<String>,
        /// Agents to run (defaults to all registered)
        #[arg(long, value_delimiter = ',')]
        agents: Vec<String>,
        #[arg(long, default_value = "medium")]
        priority: String,
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
        #[arg(long)]
        principal: Option<String>,
    },
    /// Probe every configured agent and report health
    Health,
    /// List configured agents and their capabilities
    Agents,
}

fn parse_priority(raw: &str) -> Result<Priority> {
    match raw.to_ascii_lowercase().as_str() {
        "high" => Ok(Priority::High),
        "medium" => Ok(Priority::Medium),
        "low" => Ok(Priority::Low),
        other => anyhow::bail!("unknown priority: {other}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = RuntimeConfig::load(cli.agents_file.as_deref())?;

    match cli.command {
        Command::Scan {
            repo,
            branch,
            commit,
            prior_commit,
            agents,
            priority,
            timeout_secs,
            principal,
        } => {
            let mut request = ScanRequest::new(repo, branch);
            request.commit = commit;
            request.incremental = prior_commit.is_some();
            request.prior_commit = prior_commit;
            request.agents = agents;
            request.priority = parse_priority(&priority)?;
            request.timeout_secs = timeout_secs;
            request.principal = principal.unwrap_or_else(whoami);

            run_scan(config, request).await
        }
        Command::Health => run_health(config).await,
        Command::Agents => run_agents(config),
    }
}

async fn run_scan(config: RuntimeConfig, request: ScanRequest) -> Result<()> {
    let job_timeout = request.timeout();
    let pipeline = build_pipeline(config)?;
    let logger = spawn_event_logger(&pipeline.events);
    let rx = pipeline.events.subscribe();

    pipeline.dispatcher.start().await;
    let job_id = pipeline.intake.submit(request).await?;
    info!(job_id = %job_id, "scan submitted");

    // Workers, planning, and persistence get a margin past the job budget.
    let event = await_terminal(rx, &job_id, job_timeout + Duration::from_secs(30)).await?;
    pipeline.dispatcher.stop(Duration::from_secs(10)).await;
    logger.abort();

    let job = pipeline.store.get_job(&job_id).await?;
    let findings = pipeline
        .store
        .list_findings(&job_id, &FindingFilter::default())
        .await?;

    let report = serde_json::json!({
        "job_id": job.id,
        "status": job.status,
        "error": job.error,
        "agents_completed": job.agents_completed,
        "metadata": job.metadata,
        "findings": findings,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if matches!(event, JobEvent::Failed { .. }) {
        anyhow::bail!("scan failed");
    }
    Ok(())
}

async fn run_health(config: RuntimeConfig) -> Result<()> {
    let registry = build_registry(&config)?;
    let mut unhealthy = 0;
    for (agent, status) in registry.health_report().await {
        if status.is_healthy() {
            println!("{agent}: ok");
        } else {
            unhealthy += 1;
            match status {
                orchestration::HealthStatus::Unhealthy { reason } => {
                    println!("{agent}: unhealthy ({reason})");
                }
                orchestration::HealthStatus::Healthy => unreachable!(),
            }
        }
    }
    if unhealthy > 0 {
        anyhow::bail!("{unhealthy} agent(s) unhealthy");
    }
    Ok(())
}

fn run_agents(config: RuntimeConfig) -> Result<()> {
    if config.agents.is_empty() {
        println!("no agents configured");
        return Ok(());
    }
    for spec in &config.agents {
        println!(
            "{}  languages={}  tool={}  docker={}",
            spec.id,
            spec.languages.join(","),
            spec.tool_version,
            spec.requires_docker,
        );
    }
    Ok(())
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "unknown".into())
}
