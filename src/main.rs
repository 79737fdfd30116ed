//! Evolver - evolutionary tuning scheduler
//!
//! Entry point for the `evolver` binary: the long-running daemon plus
//! one-shot commands for submitting investigations, inspecting scheduler
//! state, managing the candidate registry and driving the promotion gate.

mod cli;

use clap::{Parser, Subcommand};
use cli::config::ConfigAction;
use cli::helpers::GlobalOpts;
use cli::registry::RegistryAction;
use cli::run::SubmitArgs;
use std::path::PathBuf;
use tracing::{debug, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "evolver")]
#[command(about = "Evolutionary tuning scheduler", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Config file (TOML)
    #[arg(short, long, env = "EVOLVER_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory (overrides paths.data_dir)
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler daemon until Ctrl-C
    Run,

    /// Run one investigation now, or report how it was deferred
    Submit(SubmitArgs),

    /// Show circuit, rate limit, queue and per-question status
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Close the circuit breaker and clear its failure history
    ResetCircuit,

    /// Print the fused fitness of a candidate (name or genome hash)
    Fuse {
        candidate: String,

        #[arg(long)]
        json: bool,
    },

    /// Print bandit scores, weights and the current regime
    Weights {
        #[arg(long)]
        json: bool,
    },

    /// Candidate registry operations
    Registry {
        #[command(subcommand)]
        action: RegistryAction,
    },

    /// Record one shadow trial of a candidate against the baseline
    RecordTrial {
        candidate: String,

        /// Candidate score
        #[arg(long)]
        score: f64,

        /// Baseline score of the same trial
        #[arg(long)]
        baseline: f64,
    },

    /// Run the promotion gate for a candidate
    Promote {
        candidate: String,

        #[arg(long)]
        json: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // RUST_LOG wins over --log-level when set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "evolver={level},evolver_core={level}",
            level = level.as_str().to_lowercase()
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr) // Write logs to stderr, not stdout
        .init();

    debug!("Evolver v{} starting...", env!("CARGO_PKG_VERSION"));

    let opts = GlobalOpts {
        config: cli.config,
        data_dir: cli.data_dir,
    };

    match cli.command {
        Commands::Run => cli::run::handle_run(&opts).await,
        Commands::Submit(args) => cli::run::handle_submit(args, &opts).await,
        Commands::Status { json } => cli::status::handle_status(json, &opts),
        Commands::ResetCircuit => cli::run::handle_reset_circuit(&opts),
        Commands::Fuse { candidate, json } => cli::status::handle_fuse(&candidate, json, &opts),
        Commands::Weights { json } => cli::status::handle_weights(json, &opts),
        Commands::Registry { action } => cli::registry::handle(action, &opts),
        Commands::RecordTrial {
            candidate,
            score,
            baseline,
        } => cli::promote::handle_record_trial(&candidate, score, baseline, &opts),
        Commands::Promote { candidate, json } => cli::promote::handle_promote(&candidate, json, &opts),
        Commands::Config { action } => cli::config::handle(action, &opts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_submit() {
        let cli = Cli::try_parse_from([
            "evolver",
            "--data-dir",
            "/tmp/evolver",
            "submit",
            "--question-id",
            "q1",
            "--hypothesis",
            "h",
            "--search-space",
            "space.toml",
            "--evaluator",
            "bench",
            "--fallback",
            "cheap",
        ])
        .unwrap();
        match cli.command {
            Commands::Submit(args) => {
                assert_eq!(args.question_id, "q1");
                assert_eq!(args.fallbacks, vec!["cheap".to_string()]);
                assert_eq!(args.category, "default");
            }
            _ => panic!("expected submit"),
        }
    }
}
