use anyhow::{Context, Result};
use bench_core::{
    Config, ConsoleSink, JsonFileSink, LoadRun, RateController, ResultSink, SimulatedTarget,
    StopCondition, TargetSystem,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "worker")]
#[command(about = "Load test worker - paces requests, tracks confirmations, writes a summary")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.local.toml")]
    config: PathBuf,

    /// Worker ID (overrides config)
    #[arg(long)]
    worker_id: Option<String>,

    /// Print progress every N milliseconds (overrides config, 0 disables)
    #[arg(long)]
    print_every_ms: Option<u64>,

    /// Directory for the JSON summary (overrides config)
    #[arg(long)]
    results_dir: Option<PathBuf>,

    /// Print the pacing plan and exit without sending anything
    #[arg(long)]
    plan_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Load configuration
    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Command-line overrides
    if let Some(worker_id) = args.worker_id {
        config.worker.id = worker_id;
    }
    if let Some(print_every_ms) = args.print_every_ms {
        config.worker.print_every_ms = print_every_ms;
    }
    let results_dir = args
        .results_dir
        .unwrap_or_else(|| PathBuf::from(&config.worker.results_dir));

    let plan = RateController::new(
        config.schedule,
        StopCondition::from_scenario(&config.scenario, CancellationToken::new()),
    )
    .plan();

    if args.plan_only {
        println!("{}", plan);
        return Ok(());
    }

    info!(
        "Starting worker '{}' ({})",
        config.worker.id, config.scenario.test_type
    );
    info!("Seed: {}", config.scenario.seed);
    info!("Senders: {}", config.target.senders.join(", "));
    info!("Destinations: {}", config.target.destinations.len());
    info!("Value: {}", config.target.value);
    for line in plan.to_string().lines() {
        info!("{}", line);
    }

    // Only the in-process target ships with the worker
    let simulation = config.simulation.clone().unwrap_or_default();
    let target: Arc<dyn TargetSystem> =
        Arc::new(SimulatedTarget::from_config(&simulation, config.scenario.seed));
    info!("Using target: {}", target.name());

    // Ctrl-C stops dispatch; in-flight requests are still tracked
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping dispatch and draining in-flight requests");
                cancel.cancel();
            }
        });
    }

    let summary = LoadRun::new(config, target).run(cancel).await;

    // Write results
    let json_sink = JsonFileSink::new(&results_dir);
    let sinks: [&dyn ResultSink; 2] = [&json_sink, &ConsoleSink];
    for sink in sinks {
        sink.write(&summary)?;
    }

    if summary.incomplete {
        anyhow::bail!(
            "run incomplete: {}",
            summary
                .fatal_error
                .as_deref()
                .unwrap_or("requests still in flight")
        );
    }

    Ok(())
}
