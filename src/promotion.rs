//! Promotion gate
//!
//! Decides whether a tournament winner may replace the production artifact.
//! Candidates accumulate paired shadow trials against the current baseline;
//! `evaluate` then runs the gates in order of increasing cost and stops at
//! the first failure:
//!
//! ```text
//! trials >= min_trials → win rate >= min_win_rate → daily quota → safety policy → promoted
//! ```
//!
//! A promotion moves the genome to `active` in the registry, then writes an
//! immutable evidence record under `evidence/`. A genome the registry cannot
//! activate gets no evidence, and a failed evidence write restores the
//! registry. Once a candidate has been promoted its trial history is frozen.

use crate::config::{PathsConfig, PromotionConfig, SafetyConfig};
use crate::error::{EvolverError, Result};
use crate::genome::{CandidateGenome, LifecycleState};
use crate::persist;
use crate::tournament::SharedRegistry;
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Reason code of a gate decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionOutcome {
    Promoted,
    InsufficientTrials,
    LowWinRate,
    QuotaExhausted,
    SafetyViolation,
}

impl PromotionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromotionOutcome::Promoted => "promoted",
            PromotionOutcome::InsufficientTrials => "insufficient_trials",
            PromotionOutcome::LowWinRate => "low_win_rate",
            PromotionOutcome::QuotaExhausted => "quota_exhausted",
            PromotionOutcome::SafetyViolation => "safety_violation",
        }
    }

    pub fn is_promoted(&self) -> bool {
        matches!(self, PromotionOutcome::Promoted)
    }
}

impl fmt::Display for PromotionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One paired comparison against the baseline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowTrial {
    pub candidate_score: f64,
    pub baseline_score: f64,
    pub win: bool,
    pub recorded_at: DateTime<Utc>,
}

impl ShadowTrial {
    pub fn delta(&self) -> f64 {
        self.candidate_score - self.baseline_score
    }
}

/// Aggregate view of a candidate's trials
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrialStatistics {
    pub trials: u32,
    pub wins: u32,
    pub win_rate: f64,
    pub average_delta: f64,
}

/// Final decision, recorded only for promotions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedDecision {
    pub outcome: PromotionOutcome,
    pub decided_at: DateTime<Utc>,
    pub evidence_path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateTrials {
    pub trials: Vec<ShadowTrial>,
    pub decision: Option<RecordedDecision>,
}

impl CandidateTrials {
    pub fn statistics(&self) -> TrialStatistics {
        let trials = self.trials.len() as u32;
        let wins = self.trials.iter().filter(|t| t.win).count() as u32;
        let (win_rate, average_delta) = if trials == 0 {
            (0.0, 0.0)
        } else {
            let n = f64::from(trials);
            (
                f64::from(wins) / n,
                self.trials.iter().map(ShadowTrial::delta).sum::<f64>() / n,
            )
        };
        TrialStatistics {
            trials,
            wins,
            win_rate,
            average_delta,
        }
    }
}

/// Promotions used on one UTC calendar day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyQuota {
    pub day: NaiveDate,
    pub used: u32,
}

impl DailyQuota {
    fn roll(&mut self, today: NaiveDate) {
        if self.day != today {
            debug!("Promotion quota reset for {}", today);
            self.day = today;
            self.used = 0;
        }
    }
}

/// Persistent gate state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionState {
    pub candidates: BTreeMap<String, CandidateTrials>,
    pub quota: Option<DailyQuota>,
    /// Number of `evaluate` calls
    pub evaluations: u64,
    pub promotions: u64,
}

impl PromotionState {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        match serde_json::from_str(&contents) {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!("Promotion state {} unreadable: {}", path.display(), e);
                persist::backup_corrupt(path)?;
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        persist::write_json_atomic(path, self)
    }

    /// Promotions used today, after any calendar-day rollover
    pub fn quota_used(&mut self, today: NaiveDate) -> u32 {
        let quota = self.quota.get_or_insert(DailyQuota { day: today, used: 0 });
        quota.roll(today);
        quota.used
    }

    /// Fraction of evaluations that promoted
    pub fn acceptance_rate(&self) -> Option<f64> {
        (self.evaluations > 0).then(|| self.promotions as f64 / self.evaluations as f64)
    }
}

/// Result of one safety rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyCheck {
    pub rule: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl SafetyCheck {
    fn pass(rule: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            passed: true,
            detail: None,
        }
    }

    fn fail(rule: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            passed: false,
            detail: Some(detail.into()),
        }
    }
}

/// External safety validation of a candidate's parameters
pub trait SafetyPolicy: Send + Sync {
    fn check(&self, genome: &CandidateGenome) -> Vec<SafetyCheck>;
}

/// Allowlist, forbidden patterns and resource limits from configuration
pub struct StaticSafetyPolicy {
    allowed: Vec<String>,
    forbidden: Vec<Regex>,
    limits: BTreeMap<String, f64>,
}

impl StaticSafetyPolicy {
    pub fn from_config(config: &SafetyConfig) -> Result<Self> {
        let forbidden = config
            .forbidden_patterns
            .iter()
            .map(|p| Regex::new(p).map_err(|e| EvolverError::InvalidInput(format!("forbidden pattern {}: {}", p, e))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            allowed: config.allowed_parameters.clone(),
            forbidden,
            limits: config.resource_limits.clone(),
        })
    }

    /// Accepts everything
    pub fn permissive() -> Self {
        Self {
            allowed: Vec::new(),
            forbidden: Vec::new(),
            limits: BTreeMap::new(),
        }
    }
}

fn string_values<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| string_values(v, out)),
        Value::Object(map) => map.values().for_each(|v| string_values(v, out)),
        _ => {}
    }
}

impl SafetyPolicy for StaticSafetyPolicy {
    fn check(&self, genome: &CandidateGenome) -> Vec<SafetyCheck> {
        let params = &genome.phenotype().parameters;
        let mut checks = Vec::new();

        let disallowed: Vec<&str> = if self.allowed.is_empty() {
            Vec::new()
        } else {
            params
                .keys()
                .filter(|k| !self.allowed.contains(k))
                .map(String::as_str)
                .collect()
        };
        checks.push(if disallowed.is_empty() {
            SafetyCheck::pass("allowlist")
        } else {
            SafetyCheck::fail("allowlist", format!("parameters not allowed: {}", disallowed.join(", ")))
        });

        let mut strings = Vec::new();
        for (key, value) in params {
            let mut found = Vec::new();
            string_values(value, &mut found);
            strings.extend(found.into_iter().map(|s| (key.as_str(), s)));
        }
        let hits: Vec<String> = strings
            .iter()
            .filter_map(|(key, s)| {
                self.forbidden
                    .iter()
                    .find(|re| re.is_match(s))
                    .map(|re| format!("{} matches /{}/", key, re.as_str()))
            })
            .collect();
        checks.push(if hits.is_empty() {
            SafetyCheck::pass("forbidden_patterns")
        } else {
            SafetyCheck::fail("forbidden_patterns", hits.join("; "))
        });

        let exceeded: Vec<String> = self
            .limits
            .iter()
            .filter_map(|(key, limit)| {
                let value = params.get(key)?.as_f64()?;
                (value > *limit).then(|| format!("{} = {} exceeds {}", key, value, limit))
            })
            .collect();
        checks.push(if exceeded.is_empty() {
            SafetyCheck::pass("resource_limits")
        } else {
            SafetyCheck::fail("resource_limits", exceeded.join("; "))
        });

        checks
    }
}

/// Immutable audit record written on promotion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub candidate: String,
    pub genome_hash: String,
    pub ecosystem: String,
    pub niche: String,
    pub trials: Vec<ShadowTrial>,
    pub statistics: TrialStatistics,
    pub safety: Vec<SafetyCheck>,
    pub thresholds: PromotionConfig,
    pub decision: PromotionOutcome,
    pub decided_at: DateTime<Utc>,
}

/// What `evaluate` returns
#[derive(Debug, Clone, Serialize)]
pub struct GateDecision {
    pub candidate: String,
    pub outcome: PromotionOutcome,
    pub statistics: TrialStatistics,
    /// Failure detail for the gate that stopped evaluation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_path: Option<PathBuf>,
}

pub struct PromotionGate {
    config: PromotionConfig,
    registry: SharedRegistry,
    safety: Arc<dyn SafetyPolicy>,
    evidence_dir: PathBuf,
    state_path: PathBuf,
    state: Mutex<PromotionState>,
}

impl PromotionGate {
    pub fn new(
        config: PromotionConfig,
        paths: &PathsConfig,
        registry: SharedRegistry,
        safety: Arc<dyn SafetyPolicy>,
    ) -> Result<Self> {
        let state_path = paths.promotion_state_file();
        let state = PromotionState::load(&state_path)?;
        Ok(Self {
            config,
            registry,
            safety,
            evidence_dir: paths.evidence_dir(),
            state_path,
            state: Mutex::new(state),
        })
    }

    fn state(&self) -> MutexGuard<'_, PromotionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &PromotionConfig {
        &self.config
    }

    pub fn acceptance_rate(&self) -> Option<f64> {
        self.state().acceptance_rate()
    }

    pub fn statistics(&self, candidate: &str) -> TrialStatistics {
        self.state()
            .candidates
            .get(candidate)
            .map(CandidateTrials::statistics)
            .unwrap_or_else(|| CandidateTrials::default().statistics())
    }

    pub fn snapshot_state(&self) -> PromotionState {
        self.state().clone()
    }

    /// Record one paired shadow trial; the candidate wins iff it scores
    /// strictly higher than the baseline
    pub fn record_trial(&self, candidate: &str, candidate_score: f64, baseline_score: f64) -> Result<TrialStatistics> {
        if !(candidate_score.is_finite() && baseline_score.is_finite()) {
            return Err(EvolverError::InvalidInput(format!(
                "non-finite trial scores for {}",
                candidate
            )));
        }
        let mut state = self.state();
        let entry = state.candidates.entry(candidate.to_string()).or_default();
        if entry.decision.is_some() {
            return Err(EvolverError::AlreadyDecided(candidate.to_string()));
        }
        entry.trials.push(ShadowTrial {
            candidate_score,
            baseline_score,
            win: candidate_score > baseline_score,
            recorded_at: Utc::now(),
        });
        let stats = entry.statistics();
        state.save(&self.state_path)?;
        debug!(
            candidate = %candidate,
            trials = stats.trials,
            win_rate = stats.win_rate,
            "Shadow trial recorded"
        );
        Ok(stats)
    }

    pub fn evaluate(&self, candidate: &str) -> Result<GateDecision> {
        self.evaluate_at(candidate, Utc::now())
    }

    /// Run the gates at `now` (quota day is the UTC date of `now`)
    pub fn evaluate_at(&self, candidate: &str, now: DateTime<Utc>) -> Result<GateDecision> {
        let mut state = self.state();
        let trials = state.candidates.get(candidate).cloned().unwrap_or_default();
        if trials.decision.is_some() {
            return Err(EvolverError::AlreadyDecided(candidate.to_string()));
        }
        let stats = trials.statistics();

        let rejected = |outcome: PromotionOutcome, detail: String| GateDecision {
            candidate: candidate.to_string(),
            outcome,
            statistics: stats,
            detail: Some(detail),
            evidence_path: None,
        };

        let decision = if stats.trials < self.config.min_trials {
            rejected(
                PromotionOutcome::InsufficientTrials,
                format!("{} of {} trials", stats.trials, self.config.min_trials),
            )
        } else if stats.win_rate < self.config.min_win_rate {
            rejected(
                PromotionOutcome::LowWinRate,
                format!("win rate {:.3} below {:.3}", stats.win_rate, self.config.min_win_rate),
            )
        } else if state.quota_used(now.date_naive()) >= self.config.daily_quota {
            rejected(
                PromotionOutcome::QuotaExhausted,
                format!("{} promotions already today", self.config.daily_quota),
            )
        } else {
            let genome = self
                .registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(candidate)
                .cloned()
                .ok_or_else(|| EvolverError::NotFound(format!("candidate '{}'", candidate)))?;
            let safety = self.safety.check(&genome);
            let violations: Vec<String> = safety
                .iter()
                .filter(|c| !c.passed)
                .map(|c| format!("{}: {}", c.rule, c.detail.as_deref().unwrap_or("failed")))
                .collect();
            if !violations.is_empty() {
                rejected(PromotionOutcome::SafetyViolation, violations.join("; "))
            } else {
                let evidence_path = self.promote(&genome, &trials, stats, safety, now)?;
                state.promotions += 1;
                if let Some(quota) = state.quota.as_mut() {
                    quota.used += 1;
                }
                state
                    .candidates
                    .entry(candidate.to_string())
                    .or_default()
                    .decision = Some(RecordedDecision {
                    outcome: PromotionOutcome::Promoted,
                    decided_at: now,
                    evidence_path: evidence_path.clone(),
                });
                GateDecision {
                    candidate: candidate.to_string(),
                    outcome: PromotionOutcome::Promoted,
                    statistics: stats,
                    detail: None,
                    evidence_path: Some(evidence_path),
                }
            }
        };

        // only decisions count, errors above leave the counter alone
        state.evaluations += 1;
        state.save(&self.state_path)?;
        info!(
            candidate = %candidate,
            outcome = %decision.outcome,
            trials = stats.trials,
            win_rate = stats.win_rate,
            "Promotion decision{}",
            decision.detail.as_deref().map(|d| format!(": {}", d)).unwrap_or_default()
        );
        Ok(decision)
    }

    /// Activate the genome, then write the evidence record
    fn promote(
        &self,
        genome: &CandidateGenome,
        trials: &CandidateTrials,
        statistics: TrialStatistics,
        safety: Vec<SafetyCheck>,
        now: DateTime<Utc>,
    ) -> Result<PathBuf> {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let current = registry
            .get(&genome.name)
            .map(CandidateGenome::state)
            .ok_or_else(|| EvolverError::NotFound(format!("candidate '{}'", genome.name)))?;
        let path: &[LifecycleState] = match current {
            LifecycleState::Pluripotent => &[LifecycleState::Differentiated, LifecycleState::Active],
            _ => &[LifecycleState::Active],
        };
        let previous_version = registry.version();
        registry.transition_through(&genome.name, path)?;

        let record = EvidenceRecord {
            candidate: genome.name.clone(),
            genome_hash: genome.hash().to_string(),
            ecosystem: genome.ecosystem.clone(),
            niche: genome.niche.clone(),
            trials: trials.trials.clone(),
            statistics,
            safety,
            thresholds: self.config.clone(),
            decision: PromotionOutcome::Promoted,
            decided_at: now,
        };
        let evidence_path = self
            .evidence_dir
            .join(format!("{}-{}.json", genome.hash(), now.timestamp_millis()));
        if let Err(e) = persist::write_json_new(&evidence_path, &record) {
            match registry.restore(previous_version) {
                Ok(()) => warn!("Evidence for {} not written, registry restored: {}", genome.name, e),
                Err(restore) => warn!(
                    "Evidence for {} not written and registry restore failed: {}; {}",
                    genome.name, e, restore
                ),
            }
            return Err(e);
        }
        Ok(evidence_path)
    }
}
