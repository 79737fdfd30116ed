//! Candidate registry commands

use anyhow::{Context, Result};
use clap::Subcommand;
use evolver_core::genome::LifecycleState;
use evolver_core::registry::CandidateRegistry;

use super::helpers::{load_config, print_json, GlobalOpts};

#[derive(Subcommand)]
pub enum RegistryAction {
    /// List candidates
    List {
        /// Only candidates in this lifecycle state
        #[arg(short, long)]
        state: Option<String>,

        /// Only candidates of this ecosystem
        #[arg(short, long)]
        ecosystem: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Move a candidate to another lifecycle state
    Transition {
        name: String,
        /// pluripotent | differentiated | active | dormant | pruned
        state: String,
    },

    /// List snapshot versions on disk
    Snapshots,

    /// Restore a snapshot (recorded as a new version)
    Restore { version: u64 },
}

/// Handle registry command
pub fn handle(action: RegistryAction, opts: &GlobalOpts) -> Result<()> {
    let config = load_config(opts)?;
    let mut registry = CandidateRegistry::load(&config.paths.registry_file(), &config.paths.snapshot_dir())
        .context("Failed to open candidate registry")?
        .with_snapshot_retention(config.registry.snapshot_retention);

    match action {
        RegistryAction::List { state, ecosystem, json } => {
            let state = state
                .map(|s| s.parse::<LifecycleState>().map_err(anyhow::Error::msg))
                .transpose()?;
            let candidates: Vec<_> = registry
                .candidates()
                .filter(|g| state.map_or(true, |s| g.state() == s))
                .filter(|g| ecosystem.as_deref().map_or(true, |e| g.ecosystem == e))
                .collect();
            if json {
                return print_json(&candidates);
            }

            let stats = registry.stats();
            println!(
                "Registry v{}: {} candidates in {} ecosystems / {} niches",
                stats.version, stats.total_candidates, stats.ecosystems, stats.niches
            );
            for genome in candidates {
                println!(
                    "  {:<40} {:<14} {}/{} {}",
                    genome.name,
                    genome.state(),
                    genome.ecosystem,
                    genome.niche,
                    &genome.hash()[..12]
                );
            }
        }
        RegistryAction::Transition { name, state } => {
            let state: LifecycleState = state.parse().map_err(anyhow::Error::msg)?;
            registry
                .transition(&name, state)
                .with_context(|| format!("Failed to move {} to {}", name, state))?;
            println!("{} is now {} (registry v{})", name, state, registry.version());
        }
        RegistryAction::Snapshots => {
            let snapshots = registry.list_snapshots()?;
            if snapshots.is_empty() {
                println!("No snapshots");
            }
            for (version, path) in snapshots {
                println!("  v{:<6} {}", version, path.display());
            }
        }
        RegistryAction::Restore { version } => {
            registry
                .restore(version)
                .with_context(|| format!("Failed to restore snapshot v{}", version))?;
            println!("Restored v{} as registry v{}", version, registry.version());
        }
    }
    Ok(())
}
