//! Configuration management command

use anyhow::{Context, Result};
use clap::Subcommand;
use evolver_core::config::EvolverConfig;
use std::path::PathBuf;

use super::helpers::{load_config, GlobalOpts};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Write a config file with every default spelled out
    Init {
        /// Destination (default: ./evolver.toml)
        #[arg(short, long, default_value = "evolver.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration (defaults + file + environment)
    Show,
}

/// Handle configuration management command
pub fn handle(action: ConfigAction, opts: &GlobalOpts) -> Result<()> {
    match action {
        ConfigAction::Init { path, force } => {
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
            EvolverConfig::default()
                .to_file(&path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote default configuration to {}", path.display());
        }
        ConfigAction::Show => {
            let config = load_config(opts)?;
            let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
            print!("{}", rendered);
        }
    }
    Ok(())
}
