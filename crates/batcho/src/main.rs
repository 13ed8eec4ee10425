//! batcho - define, run and collect batches of jobs
//!
//! Subcommands:
//! - `batcho set-batch <name> <jobs.json>` - replace a batch's job list
//! - `batcho prepare <name>` - validate jobs and fetch their inputs
//! - `batcho run <name>` - claim and run jobs until the batch is stopped
//! - `batcho assemble <name>` / `batcho results <name>` - gather results
//! - `batcho status|console|stop|clear|list` - inspect and manage batches

use std::path::PathBuf;

use anyhow::{Context, Result};
use batcho::{
    status_label, BatchCoordinator, BatchJob, CommandRegistry, JobOutcome, JobProgress, RunOptions,
    RunSummary,
};
use clap::{Parser, Subcommand};
use mlprocessors::JobCache;
use mountaintools::MountainClient;
use mtconfig::MountainConfig;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "batcho")]
#[command(about = "Run batches of cached jobs across cooperating workers")]
#[command(version)]
struct Cli {
    /// Config file (defaults to the usual search path)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Remote alias to coordinate through [default: default_remote]
    #[arg(short, long, global = true)]
    remote: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replace a batch's job list from a JSON array of jobs
    SetBatch {
        name: String,
        /// File holding `[{"command": ..., "label": ..., <params>}, ...]`
        jobs: PathBuf,
    },

    /// Validate jobs against their commands and fetch inputs
    Prepare { name: String },

    /// Claim and run jobs
    Run {
        name: String,

        /// Visit pending jobs in random order
        #[arg(long)]
        randomize: bool,

        /// Concurrent workers in this process
        #[arg(short, long, default_value = "1")]
        workers: usize,

        /// Exit once no pending jobs remain instead of waiting for a stop
        #[arg(long)]
        once: bool,

        /// Run at most this many jobs per worker
        #[arg(long)]
        max_jobs: Option<usize>,
    },

    /// Gather results of a finished batch
    Assemble { name: String },

    /// Show per-job statuses
    Status { name: String },

    /// Print a job's console output
    Console { name: String, index: usize },

    /// Ask all workers on a batch to stop
    Stop { name: String },

    /// Remove a batch and its statuses
    Clear { name: String },

    /// Print assembled results as JSON
    Results { name: String },

    /// Summarize every known batch
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = MountainConfig::load_from(cli.config.as_deref()).context("failed to load config")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.infra.telemetry.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let client = MountainClient::from_config(&config, cli.remote.as_deref())
        .context("failed to open storage")?;
    let registry = CommandRegistry::new().with_commands(&config.commands);
    let coordinator =
        BatchCoordinator::new(JobCache::new(client), registry).with_batch_config(&config.batch);

    match cli.command {
        Commands::SetBatch { name, jobs } => {
            let text = std::fs::read_to_string(&jobs)
                .with_context(|| format!("failed to read {}", jobs.display()))?;
            let jobs: Vec<BatchJob> = serde_json::from_str(&text)
                .with_context(|| format!("{} is not a list of jobs", jobs.display()))?;
            let count = jobs.len();
            coordinator.set_batch(&name, jobs).await?;
            println!("{}: {} jobs", name, count);
        }
        Commands::Prepare { name } => {
            let report = coordinator.prepare_batch(&name).await?;
            for (index, message) in &report.invalid {
                println!("job {}: {}", index, message);
            }
            println!(
                "{}: {} jobs prepared, {} invalid, {} inputs fetched",
                name,
                report.jobs,
                report.invalid.len(),
                report.inputs_realized
            );
        }
        Commands::Run {
            name,
            randomize,
            workers,
            once,
            max_jobs,
        } => {
            let summary = tokio::select! {
                result = run_workers(&coordinator, &name, workers.max(1), randomize, once, max_jobs) => result?,
                _ = tokio::signal::ctrl_c() => {
                    warn!("interrupted; in-process claims will be reclaimed once stale");
                    return Ok(());
                }
            };
            println!(
                "{}: {} completed, {} errored, {} claims lost{}",
                name,
                summary.completed,
                summary.errored,
                summary.claims_lost,
                if summary.stopped { " (stopped)" } else { "" }
            );
        }
        Commands::Assemble { name } => {
            let results = coordinator.assemble_batch(&name).await?;
            let failed = results.results.iter().filter(|r| r.retcode != 0).count();
            println!("{}: assembled {} results ({} failed)", name, results.results.len(), failed);
        }
        Commands::Status { name } => {
            let jobs = coordinator.get_batch_jobs(&name).await?;
            let statuses = coordinator.get_batch_job_statuses(&name).await?;
            println!("{} [{}]", name, coordinator.get_batch_state(&name).await?);
            for (index, (job, status)) in jobs.iter().zip(&statuses).enumerate() {
                println!("{:>5}  {:<24} {}", index, job.label, status_label(status.as_ref()));
            }
        }
        Commands::Console { name, index } => {
            match coordinator.get_batch_job_console_output(&name, index).await? {
                Some(text) => print!("{}", text),
                None => println!("job {} has not finished", index),
            }
        }
        Commands::Stop { name } => {
            coordinator.stop_batch(&name).await?;
            println!("{}: stop requested", name);
        }
        Commands::Clear { name } => {
            coordinator.clear_batch(&name).await?;
            println!("{}: cleared", name);
        }
        Commands::Results { name } => {
            let results = coordinator.get_batch_results(&name).await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Commands::List => {
            for s in coordinator.list_batch_summary().await? {
                let state = s.state.map(|st| st.to_string()).unwrap_or_default();
                println!(
                    "{:<24} {:<10} total {:>5}  not-started {:>5}  in-process {:>5}  complete {:>5}  error {:>5}",
                    s.name, state, s.total, s.not_started, s.in_process, s.complete, s.error
                );
            }
        }
    }

    Ok(())
}

/// Run `count` workers until the batch is stopped (or, with `once`, until
/// nothing is pending) and add up what they did.
async fn run_workers(
    coordinator: &BatchCoordinator,
    name: &str,
    count: usize,
    randomize: bool,
    once: bool,
    max_jobs: Option<usize>,
) -> Result<RunSummary> {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
    let mut handles = Vec::with_capacity(count);
    for i in 0..count {
        let coordinator = coordinator.clone();
        let name = name.to_string();
        let options = RunOptions {
            randomize_order: randomize || count > 1,
            worker_label: format!("{}-{}-{}", host, std::process::id(), i),
            max_jobs,
        };
        handles.push(tokio::spawn(async move {
            worker_loop(&coordinator, &name, &options, once).await
        }));
    }

    let mut total = RunSummary::default();
    for handle in handles {
        let summary = handle.await.context("worker panicked")??;
        total.completed += summary.completed;
        total.errored += summary.errored;
        total.claims_lost += summary.claims_lost;
        total.stopped |= summary.stopped;
    }
    Ok(total)
}

async fn worker_loop(
    coordinator: &BatchCoordinator,
    name: &str,
    options: &RunOptions,
    once: bool,
) -> Result<RunSummary> {
    let mut total = RunSummary::default();
    loop {
        let pass = RunOptions {
            max_jobs: options.max_jobs.map(|max| max.saturating_sub(total.ran())),
            ..options.clone()
        };
        let summary = coordinator
            .run_batch_with(name, &pass, |p| print_progress(&options.worker_label, p))
            .await
            .with_context(|| format!("batch {} run failed", name))?;
        total.completed += summary.completed;
        total.errored += summary.errored;
        total.claims_lost += summary.claims_lost;

        let budget_spent = options.max_jobs.is_some_and(|max| total.ran() >= max);
        if summary.stopped || once || budget_spent {
            total.stopped = summary.stopped;
            break;
        }
        if summary.ran() == 0 {
            tokio::time::sleep(coordinator.poll_interval()).await;
        }
    }
    info!(worker = %options.worker_label, "worker done");
    Ok(total)
}

fn print_progress(worker: &str, p: &JobProgress) {
    let outcome = match p.outcome {
        JobOutcome::Complete => "complete",
        JobOutcome::Error => "error",
        JobOutcome::ClaimLost => "claim lost",
    };
    let cached = if p.from_cache { " (cached)" } else { "" };
    match p.retcode {
        Some(code) if code != 0 => {
            println!("[{}] job {} {}: {} (retcode {}){}", worker, p.index, p.label, outcome, code, cached)
        }
        _ => println!("[{}] job {} {}: {}{}", worker, p.index, p.label, outcome, cached),
    }
}
