use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use testgrid::balancer::BalancingAlgorithm;
use testgrid::capability::NodeCapabilities;
use testgrid::config::OrchestratorConfig;
use testgrid::executor::SimulatedExecutor;
use testgrid::scheduler::{NodeDescriptor, SelectionStrategy};
use testgrid::sharding::{DurationHistory, Shard, ShardStrategy, TestCase};
use testgrid::shutdown::install_shutdown_handler;
use testgrid::stats::ShardStats;
use testgrid::{Orchestrator, OrchestratorError, RunReport};

#[derive(Parser, Debug)]
#[command(name = "testgrid")]
#[command(version)]
#[command(about = "Shard a test suite and dispatch it across execution nodes")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Split a test suite into shards and print the plan
    Plan(PlanArgs),

    /// Plan, then run the suite on simulated nodes
    Simulate {
        #[command(flatten)]
        plan: PlanArgs,

        #[command(flatten)]
        cluster: ClusterArgs,
    },
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct PlanArgs {
    /// JSON file with an array of test cases
    #[arg(long, short = 't')]
    tests: PathBuf,

    /// Duration history to estimate from (JSON map of test id to durations)
    #[arg(long)]
    history: Option<PathBuf>,

    /// Write the updated duration history here after a run
    #[arg(long)]
    save_history: Option<PathBuf>,

    /// Orchestrator configuration (JSON); omitted fields use defaults
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Sharding strategy (overrides the config file)
    #[arg(long)]
    strategy: Option<ShardStrategy>,

    /// Fixed shard count; derived from estimated durations if omitted
    #[arg(long)]
    shards: Option<usize>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Parser, Debug)]
struct ClusterArgs {
    /// Number of simulated nodes
    #[arg(long, default_value = "4")]
    nodes: usize,

    /// Cores per simulated node
    #[arg(long, default_value = "2")]
    cores: usize,

    /// Node selection policy (overrides the config file)
    #[arg(long)]
    selection: Option<SelectionStrategy>,

    /// Balancing algorithm (overrides the config file)
    #[arg(long)]
    algorithm: Option<BalancingAlgorithm>,

    /// Multiplier applied to every simulated test duration
    #[arg(long, default_value = "0.01")]
    time_scale: f64,

    /// Test ids that should fail (comma-separated)
    #[arg(long, value_delimiter = ',')]
    fail: Vec<String>,

    /// Give up after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct PlanOutput<'a> {
    strategy: ShardStrategy,
    shards: &'a [Shard],
    stats: ShardStats,
}

// =============================================================================
// Helper Functions
// =============================================================================

async fn load_config(args: &PlanArgs) -> Result<OrchestratorConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => OrchestratorConfig::from_json(&tokio::fs::read_to_string(path).await?)?,
        None => OrchestratorConfig::default(),
    };
    if let Some(strategy) = args.strategy {
        config.sharding.strategy = strategy;
    }
    Ok(config)
}

async fn load_tests(path: &Path) -> Result<Vec<TestCase>, Box<dyn std::error::Error>> {
    let json = tokio::fs::read_to_string(path).await?;
    let tests: Vec<TestCase> = serde_json::from_str(&json)?;
    tracing::info!(path = %path.display(), tests = tests.len(), "Loaded test suite");
    Ok(tests)
}

async fn load_history(
    path: Option<&Path>,
    window: usize,
) -> Result<DurationHistory, Box<dyn std::error::Error>> {
    match path {
        Some(path) if path.exists() => {
            let history = DurationHistory::load(path, window).await?;
            tracing::info!(path = %path.display(), tests = history.len(), "Loaded duration history");
            Ok(history)
        }
        Some(path) => {
            tracing::warn!(path = %path.display(), "History file not found, starting empty");
            Ok(DurationHistory::new(window))
        }
        None => Ok(DurationHistory::new(window)),
    }
}

fn print_plan(strategy: ShardStrategy, shards: &[Shard]) {
    let stats = ShardStats::from_shards(shards);
    println!("Shard Plan ({})", strategy);
    println!("{}", "=".repeat(50));
    println!("{:<8} {:<8} {:>16}", "SHARD", "TESTS", "ESTIMATED (ms)");
    println!("{}", "-".repeat(50));
    for shard in shards {
        println!(
            "{:<8} {:<8} {:>16}",
            format!("{}/{}", shard.index + 1, shard.total),
            shard.len(),
            shard.estimated_duration_ms
        );
    }
    println!();
    println!(
        "{} tests, longest shard {} ms, balance {:.2}",
        stats.total_tests, stats.max_duration_ms, stats.balance
    );
}

fn print_report(report: &RunReport) {
    println!("Run Report");
    println!("{}", "=".repeat(60));
    println!(
        "{:<8} {:<8} {:<8} {:<8} {:<8} {:>12}",
        "SHARD", "RUN", "PASSED", "FAILED", "SKIPPED", "TIME (ms)"
    );
    println!("{}", "-".repeat(60));
    for shard in &report.shards {
        println!(
            "{:<8} {:<8} {:<8} {:<8} {:<8} {:>12}",
            shard.index + 1,
            shard.tests_run,
            shard.passed,
            shard.failed,
            shard.skipped,
            shard.duration_ms
        );
    }
    println!();
    println!(
        "Passed: {}  Failed: {}  Skipped: {}",
        report.passed, report.failed, report.skipped
    );
    println!(
        "Wall time: {} ms  Throughput: {:.2}/s  Shard balance: {:.2}",
        report.wall_time_ms, report.dispatcher.throughput_per_sec, report.shard_stats.balance
    );
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_plan(args: PlanArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args).await?;
    let tests = load_tests(&args.tests).await?;
    let history = load_history(args.history.as_deref(), config.sharding.history_window).await?;

    let engine = testgrid::sharding::ShardingEngine::with_history(config.sharding.clone(), history);
    let count = args
        .shards
        .unwrap_or_else(|| engine.optimal_shard_count(&tests));
    let shards = engine.shard(&tests, count)?;

    match args.output {
        OutputFormat::Json => {
            let output = PlanOutput {
                strategy: config.sharding.strategy,
                stats: ShardStats::from_shards(&shards),
                shards: &shards,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => print_plan(config.sharding.strategy, &shards),
    }
    Ok(())
}

async fn handle_simulate(
    args: PlanArgs,
    cluster: ClusterArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(&args).await?;
    if let Some(selection) = cluster.selection {
        config.dispatcher.selection = selection;
    }
    if let Some(algorithm) = cluster.algorithm {
        config.balancer.algorithm = algorithm;
    }
    if cluster.timeout_ms.is_some() {
        config.run_timeout_ms = cluster.timeout_ms;
    }

    let tests = load_tests(&args.tests).await?;
    let history = load_history(args.history.as_deref(), config.sharding.history_window).await?;

    let executor = SimulatedExecutor::new(cluster.time_scale)
        .with_default_duration_ms(config.sharding.default_duration_ms)
        .fail_tests(cluster.fail);
    let mut orchestrator = Orchestrator::with_history(config, executor, history)?;

    for i in 0..cluster.nodes {
        let capabilities = NodeCapabilities {
            cores: cluster.cores,
            ..Default::default()
        };
        orchestrator
            .register_node(NodeDescriptor::new(
                format!("sim-{}", i + 1),
                "127.0.0.1",
                5555 + i as u16,
                capabilities,
            ))
            .await?;
    }

    let shards = match args.shards {
        Some(count) => orchestrator.plan_with_shards(&tests, count)?,
        None => orchestrator.plan(&tests)?,
    };

    let shutdown = install_shutdown_handler();
    let result = tokio::select! {
        result = orchestrator.run_shards(shards) => result,
        _ = shutdown.cancelled() => Err(OrchestratorError::DispatcherStopped),
    };

    if let Some(path) = &args.save_history {
        orchestrator.history().save(path).await?;
        tracing::info!(path = %path.display(), "Saved duration history");
    }
    orchestrator.shutdown().await;

    let report = result?;
    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Table => print_report(&report),
    }

    if !report.succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Plan(plan_args) => {
            handle_plan(plan_args).await?;
        }
        Commands::Simulate { plan, cluster } => {
            handle_simulate(plan, cluster).await?;
        }
    }

    Ok(())
}
