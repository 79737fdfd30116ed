//! Shared helper functions for CLI commands

use anyhow::{Context, Result};
use evolver_core::config::EvolverConfig;
use evolver_core::daemon::Services;
use evolver_core::tournament::search::SearchSpace;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Options every subcommand shares
#[derive(Debug, Clone, Default)]
pub struct GlobalOpts {
    pub config: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
}

/// Load config from file + environment, with `--data-dir` applied last
pub fn load_config(opts: &GlobalOpts) -> Result<EvolverConfig> {
    let mut config = EvolverConfig::load(opts.config.as_deref()).with_context(|| match &opts.config {
        Some(path) => format!("Failed to load config from {}", path.display()),
        None => "Failed to load config".to_string(),
    })?;
    if let Some(data_dir) = &opts.data_dir {
        config.paths.data_dir = data_dir.clone();
    }
    debug!("Using data dir {}", config.paths.data_dir.display());
    Ok(config)
}

pub fn open_services(opts: &GlobalOpts) -> Result<Services> {
    let config = load_config(opts)?;
    let data_dir = config.paths.data_dir.clone();
    Services::open(config).with_context(|| format!("Failed to open scheduler state in {}", data_dir.display()))
}

/// Read a search space from a `.json` or `.toml` file
pub fn read_search_space(path: &Path) -> Result<SearchSpace> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let space: SearchSpace = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&contents)
            .with_context(|| format!("Invalid JSON search space in {}", path.display()))?,
        _ => toml::from_str(&contents)
            .with_context(|| format!("Invalid TOML search space in {}", path.display()))?,
    };
    space
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid search space in {}: {}", path.display(), e))?;
    Ok(space)
}

pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_search_space_by_extension() {
        let temp = TempDir::new().unwrap();
        let toml_path = temp.path().join("space.toml");
        std::fs::write(&toml_path, "[x]\ntype = \"int\"\nmin = 0\nmax = 4\n").unwrap();
        assert_eq!(read_search_space(&toml_path).unwrap().len(), 1);

        let json_path = temp.path().join("space.json");
        std::fs::write(&json_path, r#"{"x": {"type": "bool"}, "y": {"type": "fixed", "value": 3}}"#).unwrap();
        assert_eq!(read_search_space(&json_path).unwrap().len(), 2);

        let empty = temp.path().join("empty.json");
        std::fs::write(&empty, "{}").unwrap();
        assert!(read_search_space(&empty).is_err());
    }
}
