//! Metricwatch CLI
//!
//! Command-line interface for evaluating threshold rules against the metric store.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use metricwatch::alerting::{self, EvaluationOptions, GroupOutcome, RuleEvaluations};
use metricwatch::db::{PostgresMetricStore, PostgresPool};
use metricwatch::models::{EvaluatedRuleParams, Timeframe};
use metricwatch::Config;

/// Metricwatch - threshold alerting over grouped metrics
#[derive(Parser)]
#[command(name = "metricwatch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "METRICWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a rule once against the metric store
    Evaluate {
        /// Rule file (JSON)
        #[arg(long)]
        rule: PathBuf,

        /// Continue from the end of the previous evaluation (RFC 3339)
        #[arg(long)]
        last_period_end: Option<DateTime<Utc>>,

        /// Earliest instant to cover (RFC 3339)
        #[arg(long)]
        start: Option<DateTime<Utc>>,

        /// End of the evaluation (RFC 3339, defaults to now)
        #[arg(long)]
        end: Option<DateTime<Utc>>,

        /// Group reported on the previous run; repeat for several
        #[arg(long = "missing-group")]
        missing_groups: Vec<String>,

        /// Groups requested per page
        #[arg(long)]
        composite_size: Option<usize>,

        /// Do not report groups that stopped sending data
        #[arg(long)]
        no_alert_on_group_disappear: bool,

        /// Abort the evaluation after this long (e.g. "30s")
        #[arg(long, value_parser = humantime::parse_duration)]
        deadline: Option<Duration>,
    },

    /// Validate a rule file without touching the store
    Check {
        /// Rule file (JSON)
        #[arg(long)]
        rule: PathBuf,
    },

    /// Database management
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },
}

#[derive(Subcommand)]
enum DbCommands {
    /// Apply pending migrations
    Migrate,
    /// Check database connectivity
    Health,
}

/// A named rule as stored on disk
#[derive(Debug, Deserialize)]
struct RuleFile {
    name: String,
    params: EvaluatedRuleParams,
}

#[derive(Serialize)]
struct EvaluationReport<'a> {
    rule: &'a str,
    evaluations: &'a RuleEvaluations,
    groups: &'a [GroupOutcome],
    missing_groups: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config, cli.verbose);

    // Execute command
    let result = match cli.command {
        Commands::Evaluate {
            rule,
            last_period_end,
            start,
            end,
            missing_groups,
            composite_size,
            no_alert_on_group_disappear,
            deadline,
        } => {
            let mut options = EvaluationOptions::from(&config.evaluation);
            options.last_period_end = last_period_end;
            options.missing_groups = missing_groups;
            if start.is_some() || end.is_some() {
                options.timeframe = Some(Timeframe {
                    start,
                    end: end.unwrap_or_else(Utc::now),
                });
            }
            if let Some(size) = composite_size {
                options.composite_size = size;
            }
            if no_alert_on_group_disappear {
                options.alert_on_group_disappear = false;
            }
            let deadline = deadline.unwrap_or(config.evaluation.deadline);
            run_evaluate(&config, &rule, options, deadline, cli.format).await
        }
        Commands::Check { rule } => run_check(&rule, cli.format),
        Commands::Db { command } => run_db(&config, command).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &Config, verbose: bool) {
    let level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_rule(path: &Path) -> anyhow::Result<RuleFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading rule file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing rule file {}", path.display()))
}

/// Cancel `token` once `deadline` passes or on Ctrl-C
fn spawn_deadline(token: CancellationToken, deadline: Duration) {
    tokio::spawn(async move {
        tokio::select! {
            () = tokio::time::sleep(deadline) => {
                warn!(?deadline, "Evaluation deadline reached");
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted");
            }
            () = token.cancelled() => return,
        }
        token.cancel();
    });
}

async fn run_evaluate(
    config: &Config,
    rule_path: &Path,
    options: EvaluationOptions,
    deadline: Duration,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let rule = load_rule(rule_path)?;
    info!(rule = %rule.name, "Evaluating rule");

    let pool = PostgresPool::new(&config.database).await?;
    let store = PostgresMetricStore::new(&pool);

    let cancel = CancellationToken::new();
    spawn_deadline(cancel.clone(), deadline);

    let evaluations = alerting::evaluate_rule(&store, &rule.params, &config.source, &options, &cancel)
        .await
        .with_context(|| format!("evaluating rule '{}'", rule.name))?;
    cancel.cancel();

    let groups = alerting::summarize_groups(&evaluations);
    let report = EvaluationReport {
        rule: &rule.name,
        evaluations: &evaluations,
        groups: &groups,
        missing_groups: alerting::next_missing_groups(&groups),
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_report(&report),
    }
    Ok(())
}

fn print_report(report: &EvaluationReport<'_>) {
    println!("Rule: {}", report.rule);
    for (index, criterion) in report.evaluations.iter().enumerate() {
        println!();
        println!("Criterion {index}:");
        if criterion.is_empty() {
            println!("  (all groups in bounds)");
        }
        for (group, eval) in criterion {
            let value = eval
                .current_value
                .map_or_else(|| "-".to_string(), |v| format!("{v:.4}"));
            let status = if eval.is_no_data {
                "NO DATA"
            } else if eval.should_fire {
                "FIRE"
            } else {
                "WARN"
            };
            println!(
                "  {:<30} {}({}) = {:<12} {:<8} @ {}",
                group, eval.agg_type, eval.metric, value, status, eval.timestamp
            );
        }
    }

    println!();
    println!("Groups:");
    if report.groups.is_empty() {
        println!("  (none)");
    }
    for outcome in report.groups {
        println!("  {:<30} {}", outcome.group, outcome.state);
    }
}

fn run_check(rule_path: &Path, format: OutputFormat) -> anyhow::Result<()> {
    let rule = load_rule(rule_path)?;
    rule.params
        .validate()
        .with_context(|| format!("rule '{}' is invalid", rule.name))?;

    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "rule": rule.name,
                "valid": true,
                "criteria": rule.params.criteria.len(),
                "group_by": rule.params.group_fields(),
            })
        ),
        OutputFormat::Text => println!(
            "Rule '{}' is valid ({} criteria)",
            rule.name,
            rule.params.criteria.len()
        ),
    }
    Ok(())
}

async fn run_db(config: &Config, command: DbCommands) -> anyhow::Result<()> {
    let pool = PostgresPool::new(&config.database).await?;
    match command {
        DbCommands::Migrate => {
            println!("Running migrations...");
            pool.migrate().await?;
            println!("Migrations applied");
        }
        DbCommands::Health => {
            pool.health_check().await?;
            println!("Database: ok");
        }
    }
    Ok(())
}
