//! Hypergraph CLI - incremental knowledge-graph indexing

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::Context;
use clap::{Parser, Subcommand};
use hypergraph_core::canonical::{ProposalKind, TypeProposal};
use hypergraph_core::config::{Config, parse_overrides};
use hypergraph_core::graph::{JsonlTableProvider, read_records_or_empty, tables};
use hypergraph_core::index::{IndexRun, RunMode, RunResult};
use hypergraph_core::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Log file written under `reporting.base_dir`
const LOG_FILE: &str = "indexing-engine.log";
/// Run statistics written next to the log
const STATS_FILE: &str = "stats.json";

#[derive(Parser)]
#[command(name = "hypergraph")]
#[command(author, version, about = "Incremental knowledge-graph indexer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project root containing settings.toml
    #[arg(short, long, global = true, default_value = ".")]
    root: PathBuf,

    /// Override a setting, e.g. `--set extract_graph.max_gleanings=0`
    #[arg(long = "set", global = true, value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the knowledge graph from the input documents
    Index,

    /// Index new documents and merge them into the existing graph
    Update,

    /// List type proposals from the last run
    Proposals {
        /// Only show one kind of proposal
        #[arg(short, long)]
        kind: Option<KindFilter>,
        /// Show at most this many proposals
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum KindFilter {
    Entity,
    Relationship,
}

impl KindFilter {
    fn matches(self, kind: ProposalKind) -> bool {
        matches!(
            (self, kind),
            (Self::Entity, ProposalKind::Entity) | (Self::Relationship, ProposalKind::Relationship)
        )
    }
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Get a configuration value by dotted key
    Get {
        /// Configuration key (e.g. prune_graph.min_node_freq)
        key: String,
    },
    /// Show the settings file path
    Path,
}

/// Console logging to stderr plus, when `log_dir` is given, a log file
fn init_logging(verbose: bool, log_dir: Option<&Path>) -> anyhow::Result<()> {
    let default_level = if verbose {
        "hypergraph=debug,hypergraph_core=debug"
    } else {
        "hypergraph=info,hypergraph_core=info"
    };
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };

    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .with_filter(filter());

    let file = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let path = dir.join(LOG_FILE);
            let handle = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(handle))
                    .with_filter(filter()),
            )
        }
        None => None,
    };

    tracing_subscriber::registry().with(console).with(file).init();
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let overrides = parse_overrides(&cli.overrides)?;
    Config::load(&cli.root, Some(&overrides))
        .with_context(|| format!("Failed to load configuration from {}", cli.root.display()))
}

/// Cancel the run on Ctrl-C; workflows stop at their next checkpoint
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            token.cancel();
        }
    });
    cancel
}

async fn write_stats(config: &Config, result: &RunResult) -> anyhow::Result<PathBuf> {
    let dir = &config.reporting.base_dir;
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(STATS_FILE);
    let body = serde_json::to_string_pretty(&serde_json::json!({
        "mode": result.mode,
        "stats": result.stats,
        "metrics": result.metrics,
    }))?;
    tokio::fs::write(&path, body)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

async fn cmd_run(cli: &Cli, config: Config, mode: RunMode) -> anyhow::Result<()> {
    let run = IndexRun::new(config.clone())
        .mode(mode)
        .cancel_token(cancel_on_interrupt());
    if !cli.quiet && cli.format == OutputFormat::Text {
        println!("Running {} pipeline: {}", mode, run.pipeline_names().join(", "));
    }

    let result = run.run().await?;
    let stats_path = write_stats(&config, &result).await?;
    info!(path = %stats_path.display(), "Wrote run statistics");

    if cli.format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }
    if cli.quiet {
        return Ok(());
    }

    if result.stopped_by.as_deref() == Some("load_input") && mode == RunMode::Update {
        println!("No new documents to index; the graph is up to date.");
        return Ok(());
    }
    println!();
    println!("Indexed {} document(s)", result.stats.num_documents);
    for (workflow, stats) in &result.stats.workflows {
        println!("  {:<32} {:>8.2}s", workflow, stats.overall_secs);
    }
    println!();
    println!("Tables written: {}", result.committed.join(", "));
    for (instance, metrics) in &result.metrics {
        println!(
            "  {}: {} requests, {} cache hits, {} retries, {} tokens, ${:.4}",
            instance,
            metrics.requests,
            metrics.cache_hits,
            metrics.retries,
            metrics.total_tokens(),
            metrics.cost_usd
        );
    }
    println!("Total time: {:.2}s", result.stats.total_runtime_secs);
    Ok(())
}

async fn cmd_proposals(
    cli: &Cli,
    config: &Config,
    kind: Option<KindFilter>,
    limit: Option<usize>,
) -> anyhow::Result<()> {
    let store = JsonlTableProvider::new(&config.output_storage.base_dir);
    let proposals: Vec<TypeProposal> = read_records_or_empty(&store, tables::TYPE_PROPOSALS).await?;
    let proposals: Vec<TypeProposal> = proposals
        .into_iter()
        .filter(|p| kind.is_none_or(|k| k.matches(p.proposal_kind)))
        .take(limit.unwrap_or(usize::MAX))
        .collect();

    if cli.format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&proposals)?);
        return Ok(());
    }
    if proposals.is_empty() {
        if !cli.quiet {
            println!("No type proposals found.");
        }
        return Ok(());
    }

    println!("{:<14} {:<28} {:>6}  RAW LABELS", "KIND", "LABEL", "COUNT");
    for proposal in &proposals {
        println!(
            "{:<14} {:<28} {:>6}  {}",
            proposal.proposal_kind,
            proposal.canonical_label,
            proposal.occurrences,
            proposal.raw_labels.join(", ")
        );
        if cli.verbose {
            for sample in &proposal.sample_descriptions {
                println!("{:>16}- {}", "", sample);
            }
        }
    }
    Ok(())
}

fn cmd_config(cli: &Cli, config: &Config, action: &ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            if cli.format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                print!("{}", config.to_toml()?);
            }
        }
        ConfigAction::Get { key } => {
            println!("{}", config.get(key)?);
        }
        ConfigAction::Path => {
            println!("{}", Config::settings_path(&cli.root).display());
        }
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let dotenv = cli.root.join(".env");
    if dotenv.exists() {
        dotenvy::from_path(&dotenv)
            .with_context(|| format!("Failed to read {}", dotenv.display()))?;
    }

    let config = load_config(&cli)?;
    let log_dir = match cli.command {
        Commands::Index | Commands::Update => Some(config.reporting.base_dir.as_path()),
        _ => None,
    };
    init_logging(cli.verbose, log_dir)?;

    match &cli.command {
        Commands::Index => cmd_run(&cli, config, RunMode::Standard).await,
        Commands::Update => cmd_run(&cli, config, RunMode::Update).await,
        Commands::Proposals { kind, limit } => cmd_proposals(&cli, &config, *kind, *limit).await,
        Commands::Config { action } => cmd_config(&cli, &config, action),
    }
}

fn report(err: &anyhow::Error) {
    match err.downcast_ref::<Error>() {
        Some(core) => {
            eprintln!("Error [{}]: {}", core.code(), core);
            if let Some(suggestion) = core.suggestion() {
                eprintln!("  Suggestion: {}", suggestion);
            }
        }
        None => eprintln!("Error: {:#}", err),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "hypergraph",
            "index",
            "--root",
            "/tmp/project",
            "--set",
            "concurrent_requests=4",
            "--set",
            "extract_graph.max_gleanings=0",
            "-v",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Index));
        assert_eq!(cli.root, PathBuf::from("/tmp/project"));
        assert_eq!(cli.overrides.len(), 2);
        assert!(cli.verbose);
    }

    #[test]
    fn test_proposals_kind_filter() {
        let cli = Cli::try_parse_from(["hypergraph", "proposals", "--kind", "relationship"]).unwrap();
        match cli.command {
            Commands::Proposals { kind: Some(kind), limit: None } => {
                assert!(kind.matches(ProposalKind::Relationship));
                assert!(!kind.matches(ProposalKind::Entity));
            }
            _ => panic!("expected proposals command"),
        }
    }
}
