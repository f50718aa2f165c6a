//! Turnscope entry point
//!
//! Offline trace diagnosis and single-campaign runs against HTTP collaborators.

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use turnscope_campaign::client::{
    outcomes_from_body, parse_segments, HttpJudge, HttpTargetClient, HttpTraceStore,
};
use turnscope_campaign::{CampaignKind, CampaignOrchestrator, CampaignRequest, CampaignStatus, EngineConfig};
use turnscope_trace::{analyze, correlate, CorrelationConfig, TraceAnalysis};

#[derive(Parser)]
#[command(name = "turnscope")]
#[command(about = "Turnscope - conversational AI evaluation with trace-based root cause analysis")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Diagnose a saved trace against a saved judge payload
    Analyze {
        /// Raw segments (JSON array or {"segments": [...]})
        #[arg(long)]
        trace: PathBuf,

        /// Judge payload for the turn
        #[arg(long)]
        outcome: PathBuf,

        /// Reporting threshold for the primary cause
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Run one campaign and print its report
    Run {
        /// Engine configuration file (YAML, TOML or JSON)
        #[arg(short, long, env = "TURNSCOPE_CONFIG")]
        config: Option<PathBuf>,

        #[arg(long)]
        target_url: String,

        #[arg(long, env = "TURNSCOPE_JUDGE_URL")]
        judge_url: String,

        #[arg(long, env = "TURNSCOPE_TRACE_STORE_URL")]
        trace_store_url: String,

        /// persona, red_team or combined
        #[arg(long, default_value = "persona")]
        kind: String,

        #[arg(long)]
        persona_type: Option<String>,

        #[arg(long)]
        attack_type: Option<String>,

        /// User messages, a JSON array or one message per line
        #[arg(long)]
        messages: Option<PathBuf>,

        #[arg(long)]
        max_turns: Option<u32>,

        /// Stop after this many failed turns
        #[arg(long)]
        stop_after_failures: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze {
            trace,
            outcome,
            threshold,
        } => {
            let output = run_analyze(&trace, &outcome, threshold)?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }

        Commands::Run {
            config,
            target_url,
            judge_url,
            trace_store_url,
            kind,
            persona_type,
            attack_type,
            messages,
            max_turns,
            stop_after_failures,
        } => {
            let config = match config {
                Some(path) => EngineConfig::from_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => EngineConfig::from_env(),
            };
            let kind: CampaignKind = kind.parse()?;

            let mut request = CampaignRequest::new(kind, target_url);
            request.persona_type = persona_type;
            request.attack_type = attack_type;
            request.stop_after_failures = stop_after_failures;
            if let Some(path) = messages {
                request.messages = read_messages(&path)?;
            }
            let mut campaign_config = config.default_campaign_config();
            if let Some(max_turns) = max_turns {
                campaign_config.max_turns = max_turns;
            }
            request.config = Some(campaign_config);

            let orchestrator = CampaignOrchestrator::builder(config)
                .target(Arc::new(HttpTargetClient::new()?))
                .trace_store(Arc::new(HttpTraceStore::new(trace_store_url)?))
                .judge(Arc::new(HttpJudge::new(judge_url)?))
                .build()?;

            let campaign = orchestrator.create_campaign(request).await?;
            orchestrator.start(campaign.id).await?;
            let finished = orchestrator.wait(campaign.id).await?;
            let report = orchestrator.report(campaign.id).await?;

            println!("{}", serde_json::to_string_pretty(&report)?);

            let stats = &finished.stats;
            let status = if finished.status == CampaignStatus::Failed {
                finished.status.as_str().red().bold()
            } else {
                finished.status.as_str().green().bold()
            };
            eprintln!(
                "{} {} turns, {} completed, {} failed ({} timed out)",
                status,
                stats.turns_total,
                stats.turns_completed.to_string().green(),
                stats.turns_failed.to_string().red(),
                stats.turns_timed_out
            );

            if finished.status == CampaignStatus::Failed {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

fn run_analyze(trace: &Path, outcome: &Path, threshold: Option<f64>) -> anyhow::Result<Value> {
    let segments = parse_segments(&read_json(trace)?)?;
    let trace_id = segments
        .iter()
        .find_map(|s| s.document().get("trace_id").and_then(Value::as_str))
        .unwrap_or("offline")
        .to_string();
    let analysis = analyze(&trace_id, &segments).unwrap_or_else(|_| TraceAnalysis::empty(&trace_id));

    let mut config = CorrelationConfig::builder();
    if let Some(threshold) = threshold {
        config = config.reporting_threshold(threshold);
    }
    let config = config.build();

    let outcomes = outcomes_from_body(&format!("offline:{}", trace_id), &read_json(outcome)?);
    let root_causes: Vec<_> = outcomes
        .iter()
        .filter(|o| !o.passed)
        .map(|o| correlate(o, &analysis, &config))
        .collect();

    Ok(json!({
        "trace": {
            "trace_id": analysis.trace_id,
            "span_count": analysis.spans.len(),
            "total_duration_ms": analysis.total_duration_ms,
            "critical_path": analysis.critical_path,
            "error_spans": analysis.error_spans,
            "span_kind_counts": analysis.span_kind_counts,
        },
        "outcomes": outcomes,
        "root_causes": root_causes,
    }))
}

fn read_messages(path: &Path) -> anyhow::Result<Vec<String>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    if let Ok(messages) = serde_json::from_str::<Vec<String>>(&content) {
        return Ok(messages);
    }
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}
