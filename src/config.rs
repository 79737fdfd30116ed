// Evolver Configuration
//
// Typed configuration for every scheduler component, validated once at load
// time. Values are layered: built-in defaults, then an optional TOML file,
// then EVOLVER_* environment variables (`__` separates nesting levels, e.g.
// EVOLVER_FUSION__WEIGHT_PRODUCTION=0.7).

use crate::retry::{PolicyError, RetryPolicy};
use crate::tournament::queue::OverflowPolicy;
use crate::tournament::search::SearchSpace;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to layer config sources: {0}")]
    SourceError(#[from] config::ConfigError),

    #[error("Invalid retry policy: {0}")]
    RetryPolicy(#[from] PolicyError),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// Custom serde module for Duration (serialize/deserialize as seconds)
pub(crate) mod serde_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolverConfig {
    pub paths: PathsConfig,

    pub registry: RegistryConfig,

    /// Policy applied around every evaluator batch call
    pub retry: RetryPolicy,

    pub fusion: FusionConfig,

    pub bandit: BanditConfig,

    pub tournament: TournamentConfig,

    pub promotion: PromotionConfig,

    pub safety: SafetyConfig,

    pub daemon: DaemonConfig,

    /// Named external evaluators
    pub evaluators: BTreeMap<String, EvaluatorConfig>,

    /// Standing investigations the daemon timer draws from
    pub investigations: Vec<InvestigationConfig>,
}

/// Where durable state lives
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("evolver"),
        }
    }
}

impl PathsConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn production_ledger(&self) -> PathBuf {
        self.data_dir.join("ledgers").join("production.jsonl")
    }

    pub fn synthetic_ledger(&self) -> PathBuf {
        self.data_dir.join("ledgers").join("synthetic.jsonl")
    }

    pub fn registry_file(&self) -> PathBuf {
        self.data_dir.join("registry.json")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    pub fn winners_dir(&self) -> PathBuf {
        self.data_dir.join("winners")
    }

    pub fn state_file(&self) -> PathBuf {
        self.data_dir.join("scheduler_state.json")
    }

    pub fn tournament_log(&self) -> PathBuf {
        self.data_dir.join("tournaments.jsonl")
    }

    pub fn promotion_state_file(&self) -> PathBuf {
        self.data_dir.join("promotion_state.json")
    }

    pub fn evidence_dir(&self) -> PathBuf {
        self.data_dir.join("evidence")
    }
}

/// Candidate registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Newest snapshots kept on disk; 0 keeps every snapshot
    pub snapshot_retention: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            snapshot_retention: 50,
        }
    }
}

/// Fitness fusion settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Window over which production observations count
    #[serde(with = "serde_duration")]
    pub production_window: Duration,

    /// Window over which synthetic observations count
    #[serde(with = "serde_duration")]
    pub synthetic_window: Duration,

    /// Half-life of synthetic observation weight
    #[serde(with = "serde_duration")]
    pub half_life: Duration,

    /// Minimum in-window observations for a component to be defined
    pub min_samples: usize,

    pub weight_production: f64,

    pub weight_synthetic: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            production_window: Duration::from_secs(3600), // 1 hour
            synthetic_window: Duration::from_secs(86400), // 24 hours
            half_life: Duration::from_secs(43200),        // 12 hours
            min_samples: 3,
            weight_production: 0.6,
            weight_synthetic: 0.4,
        }
    }
}

/// Bandit prioritization and regime classification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BanditConfig {
    /// UCB1 exploration constant
    pub exploration_c: f64,

    pub min_weight: f64,

    pub max_weight: f64,

    /// Average minutes per trial above which the regime is degraded
    pub cost_pressure_minutes: f64,

    pub novelty_threshold: f64,

    pub acceptance_threshold: f64,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            exploration_c: 1.4,
            min_weight: 0.10,
            max_weight: 0.50,
            cost_pressure_minutes: 10.0,
            novelty_threshold: 0.5,
            acceptance_threshold: 0.3,
        }
    }
}

/// Tournament execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TournamentConfig {
    pub candidates_per_tournament: usize,

    /// Number of champion fitness values considered for convergence
    pub convergence_window: usize,

    /// Variance strictly below this declares convergence
    pub convergence_threshold: f64,

    /// Minimum spacing between tournament starts
    #[serde(with = "serde_duration")]
    pub min_interval: Duration,

    /// Failures within `circuit_window` that open the circuit
    pub circuit_failure_threshold: usize,

    #[serde(with = "serde_duration")]
    pub circuit_window: Duration,

    #[serde(with = "serde_duration")]
    pub circuit_cooldown: Duration,

    pub queue_capacity: usize,

    pub overflow_policy: OverflowPolicy,

    /// Resampling budget when a sampled candidate is a known genome
    pub max_resample_attempts: usize,
}

impl Default for TournamentConfig {
    fn default() -> Self {
        Self {
            candidates_per_tournament: 8,
            convergence_window: 5,
            convergence_threshold: 0.02,
            min_interval: Duration::from_secs(60),
            circuit_failure_threshold: 3,
            circuit_window: Duration::from_secs(120),   // 2 minutes
            circuit_cooldown: Duration::from_secs(600), // 10 minutes
            queue_capacity: 100,
            overflow_policy: OverflowPolicy::EvictOldest,
            max_resample_attempts: 16,
        }
    }
}

/// Promotion gate settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionConfig {
    pub min_trials: u32,

    /// Fraction of paired trials the candidate must win
    pub min_win_rate: f64,

    /// Promotions allowed per UTC calendar day
    pub daily_quota: u32,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            min_trials: 20,
            min_win_rate: 0.70,
            daily_quota: 3,
        }
    }
}

/// Safety policy applied before promotion
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Parameter keys a candidate may set; empty allows any key
    pub allowed_parameters: Vec<String>,

    /// Regexes no string parameter value may match
    pub forbidden_patterns: Vec<String>,

    /// Upper bounds for numeric parameters
    pub resource_limits: BTreeMap<String, f64>,
}

/// Daemon loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Queue drain poll interval
    #[serde(with = "serde_duration")]
    pub poll_interval: Duration,

    /// Interval at which a standing investigation is enqueued
    #[serde(with = "serde_duration")]
    pub timer_interval: Duration,

    pub timer_enabled: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            timer_interval: Duration::from_secs(300), // 5 minutes
            timer_enabled: true,
        }
    }
}

/// External process evaluator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Program and arguments
    pub command: Vec<String>,

    pub working_dir: Option<PathBuf>,

    pub env: BTreeMap<String, String>,
}

/// A standing investigation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvestigationConfig {
    pub question_id: String,

    pub hypothesis: String,

    /// Bandit category (test chamber) this investigation belongs to
    pub category: String,

    pub evaluator: String,

    #[serde(default)]
    pub fallback_evaluators: Vec<String>,

    pub search_space: SearchSpace,
}

impl EvolverConfig {
    /// Layer defaults, an optional TOML file and EVOLVER_* variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&EvolverConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path.to_path_buf()).format(config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix("EVOLVER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: EvolverConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from TOML file without environment layering
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: EvolverConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_str = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml_str)?;
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.validate()?;
        self.validate_fusion()?;
        self.validate_bandit()?;
        self.validate_tournament()?;
        self.validate_promotion()?;
        self.validate_investigations()?;
        Ok(())
    }

    fn validate_fusion(&self) -> Result<(), ConfigError> {
        let f = &self.fusion;
        for (name, weight) in [
            ("weight_production", f.weight_production),
            ("weight_synthetic", f.weight_synthetic),
        ] {
            if !(0.0..=1.0).contains(&weight) {
                return Err(invalid(format!("fusion.{} must be within [0, 1]", name)));
            }
        }
        if (f.weight_production + f.weight_synthetic - 1.0).abs() > 1e-9 {
            return Err(invalid("fusion weights must sum to 1".to_string()));
        }
        if f.production_window.is_zero() || f.synthetic_window.is_zero() || f.half_life.is_zero() {
            return Err(invalid(
                "fusion windows and half_life must be positive".to_string(),
            ));
        }
        if f.min_samples == 0 {
            return Err(invalid("fusion.min_samples must be at least 1".to_string()));
        }
        Ok(())
    }

    fn validate_bandit(&self) -> Result<(), ConfigError> {
        let b = &self.bandit;
        if !(b.exploration_c >= 0.0) {
            return Err(invalid("bandit.exploration_c must be non-negative".to_string()));
        }
        if !(b.min_weight > 0.0 && b.max_weight <= 1.0 && b.min_weight <= b.max_weight) {
            return Err(invalid(
                "bandit weights must satisfy 0 < min_weight <= max_weight <= 1".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_tournament(&self) -> Result<(), ConfigError> {
        let t = &self.tournament;
        if t.candidates_per_tournament == 0 {
            return Err(invalid(
                "tournament.candidates_per_tournament must be at least 1".to_string(),
            ));
        }
        if t.convergence_window < 2 {
            return Err(invalid(
                "tournament.convergence_window must be at least 2".to_string(),
            ));
        }
        if !(t.convergence_threshold > 0.0) {
            return Err(invalid(
                "tournament.convergence_threshold must be positive".to_string(),
            ));
        }
        if t.circuit_failure_threshold == 0 {
            return Err(invalid(
                "tournament.circuit_failure_threshold must be at least 1".to_string(),
            ));
        }
        if t.circuit_window.is_zero() || t.circuit_cooldown.is_zero() {
            return Err(invalid(
                "tournament circuit window and cooldown must be positive".to_string(),
            ));
        }
        if t.queue_capacity == 0 {
            return Err(invalid("tournament.queue_capacity must be at least 1".to_string()));
        }
        Ok(())
    }

    fn validate_promotion(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.promotion.min_win_rate) {
            return Err(invalid("promotion.min_win_rate must be within [0, 1]".to_string()));
        }
        for pattern in &self.safety.forbidden_patterns {
            regex::Regex::new(pattern)
                .map_err(|e| invalid(format!("safety.forbidden_patterns: {}", e)))?;
        }
        Ok(())
    }

    fn validate_investigations(&self) -> Result<(), ConfigError> {
        for (name, evaluator) in &self.evaluators {
            if evaluator.command.is_empty() {
                return Err(invalid(format!("evaluator '{}' has an empty command", name)));
            }
        }
        for investigation in &self.investigations {
            for name in std::iter::once(&investigation.evaluator)
                .chain(investigation.fallback_evaluators.iter())
            {
                if !self.evaluators.contains_key(name) {
                    return Err(invalid(format!(
                        "investigation '{}' names unknown evaluator '{}'",
                        investigation.question_id, name
                    )));
                }
            }
            investigation
                .search_space
                .validate()
                .map_err(|e| invalid(format!("investigation '{}': {}", investigation.question_id, e)))?;
        }
        Ok(())
    }
}

fn invalid(message: String) -> ConfigError {
    ConfigError::ValidationError(message)
}
