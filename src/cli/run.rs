//! Daemon and one-shot tournament commands

use anyhow::{Context, Result};
use evolver_core::daemon::Daemon;
use evolver_core::tournament::{InvestigationRequest, SubmitOutcome};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use super::helpers::{open_services, print_json, read_search_space, GlobalOpts};

/// Handle `evolver run`
pub async fn handle_run(opts: &GlobalOpts) -> Result<()> {
    let services = open_services(opts)?;
    if services.config.investigations.is_empty() {
        info!("No standing investigations configured; only queued requests will run");
    }
    let daemon = Arc::new(Daemon::new(services));
    daemon.run().await.context("Daemon failed")?;
    Ok(())
}

/// Arguments of `evolver submit`
#[derive(Debug, clap::Args)]
pub struct SubmitArgs {
    /// Question identifier (deduplication key)
    #[arg(long)]
    pub question_id: String,

    /// Hypothesis under test
    #[arg(long)]
    pub hypothesis: String,

    /// Search space file (.toml or .json)
    #[arg(long)]
    pub search_space: PathBuf,

    /// Evaluator name from the [evaluators] table
    #[arg(long)]
    pub evaluator: String,

    /// Fallback evaluators, tried in order after retries are exhausted
    #[arg(long = "fallback")]
    pub fallbacks: Vec<String>,

    /// Bandit category
    #[arg(long, default_value = "default")]
    pub category: String,

    /// Print the outcome as JSON
    #[arg(long)]
    pub json: bool,
}

/// Handle `evolver submit`
pub async fn handle_submit(args: SubmitArgs, opts: &GlobalOpts) -> Result<()> {
    let space = read_search_space(&args.search_space)?;
    let services = open_services(opts)?;

    let mut request = InvestigationRequest::new(&args.question_id, &args.hypothesis, space, &args.evaluator)
        .with_category(&args.category);
    for fallback in &args.fallbacks {
        request = request.with_fallback(fallback);
    }

    let outcome = services
        .executor
        .submit(request)
        .await
        .with_context(|| format!("Investigation {} failed", args.question_id))?;

    if args.json {
        return print_json(&outcome);
    }
    match outcome {
        SubmitOutcome::Completed(t) => {
            println!("Tournament {} finished", t.tournament_id);
            println!("  Champion:  {} ({})", t.champion, &t.champion_hash[..12]);
            println!("  Fitness:   {:.4}", t.champion_fitness);
            println!("  Regime:    {}", t.regime);
            println!("  Converged: {}", t.converged);
            if t.skipped_duplicates > 0 {
                println!("  Skipped {} already-tested genomes", t.skipped_duplicates);
            }
            println!("  Winner:    {}", t.winner_path.display());
        }
        SubmitOutcome::AlreadyConverged => {
            println!("{} has converged; no tournament run", args.question_id)
        }
        SubmitOutcome::Exhausted => {
            println!("{}: every sampled genome was already tested", args.question_id)
        }
        SubmitOutcome::Queued {
            reason,
            position,
            evicted,
        } => {
            println!("Queued at position {} ({})", position, reason);
            if let Some(evicted) = evicted {
                println!("  Queue full: evicted {}", evicted);
            }
        }
        SubmitOutcome::Duplicate => println!("{} is already queued", args.question_id),
        SubmitOutcome::QueueFull => anyhow::bail!("Deferred queue is full; {} rejected", args.question_id),
    }
    Ok(())
}

/// Handle `evolver reset-circuit`
pub fn handle_reset_circuit(opts: &GlobalOpts) -> Result<()> {
    let services = open_services(opts)?;
    services.executor.reset_circuit().context("Failed to reset circuit")?;
    println!("Circuit breaker reset");
    Ok(())
}
