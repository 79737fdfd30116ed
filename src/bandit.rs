//! Bandit prioritization of test categories
//!
//! Each category (test chamber) is scored with a UCB1-style value: categories
//! that have never run score `+inf` so they are explored first, the rest
//! score `exploit + explore` where
//!
//! - `exploit = yield / (cost + 0.1)`, yield being distinct failures found per
//!   hour of runtime and cost the average minutes per trial
//! - `explore = C * sqrt(ln(total_trials) / category_trials)`
//!
//! Scores become weights through a softmax, then every weight is clamped into
//! `[min_weight, max_weight]` so no category monopolizes or starves the lane.

use crate::config::BanditConfig;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;
use tracing::debug;

const COST_FLOOR_MINUTES: f64 = 0.1;
const WEIGHT_EPSILON: f64 = 1e-12;

/// Historical statistics for one category
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryStats {
    pub trials: u64,
    pub passes: u64,
    pub failures: u64,
    /// Cumulative runtime in seconds
    pub runtime_secs: f64,
    /// Distinct failure signatures seen so far
    pub distinct_failures: BTreeSet<String>,
    pub flakes: u64,
}

impl CategoryStats {
    /// Average minutes per trial
    pub fn cost_minutes(&self) -> f64 {
        if self.trials == 0 {
            return 0.0;
        }
        self.runtime_secs / 60.0 / self.trials as f64
    }

    /// Distinct failures per hour of runtime
    pub fn yield_per_hour(&self) -> f64 {
        let hours = self.runtime_secs / 3600.0;
        if hours <= 0.0 {
            return 0.0;
        }
        self.distinct_failures.len() as f64 / hours
    }
}

/// Result of one trial in a category
#[derive(Debug, Clone)]
pub struct TrialOutcome {
    pub passed: bool,
    pub runtime: Duration,
    pub failure_signature: Option<String>,
    /// Trial result disagreed with a rerun of the same input
    pub flaky: bool,
}

impl TrialOutcome {
    pub fn passed(runtime: Duration) -> Self {
        Self {
            passed: true,
            runtime,
            failure_signature: None,
            flaky: false,
        }
    }

    pub fn failed(runtime: Duration, signature: impl Into<String>) -> Self {
        Self {
            passed: false,
            runtime,
            failure_signature: Some(signature.into()),
            flaky: false,
        }
    }
}

/// Operating mode derived from aggregate signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    /// Balanced default
    Normal,
    /// Cost pressure: favour cheaper evaluation
    Degraded,
    /// High novelty and acceptance: explore deeper
    Exploratory,
}

impl Regime {
    /// Scale a tournament's candidate count for this regime
    pub fn adjust_candidates(self, base: usize) -> usize {
        match self {
            Regime::Normal => base,
            Regime::Degraded => (base / 2).max(2),
            Regime::Exploratory => (base * 3).div_ceil(2),
        }
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Regime::Normal => "normal",
            Regime::Degraded => "degraded",
            Regime::Exploratory => "exploratory",
        };
        f.write_str(s)
    }
}

/// Aggregate signals for regime classification; `None` means unknown
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RegimeSignals {
    pub avg_cost_minutes: Option<f64>,
    pub novelty: Option<f64>,
    pub acceptance_rate: Option<f64>,
}

/// Score and weight of one category
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryWeight {
    pub category: String,
    pub score: f64,
    pub weight: f64,
}

pub struct BanditScheduler {
    config: BanditConfig,
    categories: BTreeMap<String, CategoryStats>,
}

impl BanditScheduler {
    pub fn new(config: BanditConfig) -> Self {
        Self {
            config,
            categories: BTreeMap::new(),
        }
    }

    /// Resume from checkpointed statistics
    pub fn with_stats(config: BanditConfig, categories: BTreeMap<String, CategoryStats>) -> Self {
        Self { config, categories }
    }

    pub fn config(&self) -> &BanditConfig {
        &self.config
    }

    pub fn stats(&self) -> &BTreeMap<String, CategoryStats> {
        &self.categories
    }

    /// Make a category known without recording a trial
    pub fn ensure_category(&mut self, category: &str) {
        self.categories.entry(category.to_string()).or_default();
    }

    pub fn total_trials(&self) -> u64 {
        self.categories.values().map(|s| s.trials).sum()
    }

    pub fn record_trial(&mut self, category: &str, outcome: &TrialOutcome) {
        let stats = self.categories.entry(category.to_string()).or_default();
        stats.trials += 1;
        if outcome.passed {
            stats.passes += 1;
        } else {
            stats.failures += 1;
        }
        stats.runtime_secs += outcome.runtime.as_secs_f64();
        if let Some(signature) = &outcome.failure_signature {
            stats.distinct_failures.insert(signature.clone());
        }
        if outcome.flaky {
            stats.flakes += 1;
        }
        debug!(category, trials = stats.trials, passed = outcome.passed, "recorded trial");
    }

    /// UCB1 score for `category`; unknown categories count as untried
    pub fn score(&self, category: &str, total_trials: u64) -> f64 {
        match self.categories.get(category) {
            Some(stats) => ucb_score(stats, total_trials, self.config.exploration_c),
            None => f64::INFINITY,
        }
    }

    /// Clamped weights over every known category, in name order
    pub fn compute_weights(&self) -> Vec<CategoryWeight> {
        let total = self.total_trials();
        let scored: Vec<(String, f64)> = self
            .categories
            .iter()
            .map(|(name, stats)| (name.clone(), ucb_score(stats, total, self.config.exploration_c)))
            .collect();
        let scores: Vec<f64> = scored.iter().map(|(_, s)| *s).collect();
        let weights = clamp_weights(
            &softmax(&scores),
            self.config.min_weight,
            self.config.max_weight,
        );

        scored
            .into_iter()
            .zip(weights)
            .map(|((category, score), weight)| CategoryWeight {
                category,
                score,
                weight,
            })
            .collect()
    }

    /// Signals derived from the recorded statistics plus an external acceptance rate
    pub fn signals(&self, acceptance_rate: Option<f64>) -> RegimeSignals {
        let total = self.total_trials();
        if total == 0 {
            return RegimeSignals {
                acceptance_rate,
                ..RegimeSignals::default()
            };
        }
        let runtime: f64 = self.categories.values().map(|s| s.runtime_secs).sum();
        let distinct: usize = self.categories.values().map(|s| s.distinct_failures.len()).sum();
        RegimeSignals {
            avg_cost_minutes: Some(runtime / 60.0 / total as f64),
            novelty: Some(distinct as f64 / total as f64),
            acceptance_rate,
        }
    }

    pub fn classify_regime(&self, signals: &RegimeSignals) -> Regime {
        classify_regime(&self.config, signals)
    }
}

fn ucb_score(stats: &CategoryStats, total_trials: u64, exploration_c: f64) -> f64 {
    if stats.trials == 0 {
        return f64::INFINITY;
    }
    let n = stats.trials as f64;
    let exploit = stats.yield_per_hour() / (stats.cost_minutes() + COST_FLOOR_MINUTES);
    let ln_total = (total_trials.max(stats.trials) as f64).ln();
    let explore = exploration_c * (ln_total / n).sqrt();
    exploit + explore
}

/// Exponentiated, normalized scores; infinite scores share the mass equally
pub fn softmax(scores: &[f64]) -> Vec<f64> {
    if scores.is_empty() {
        return Vec::new();
    }
    let infinite = scores.iter().filter(|s| **s == f64::INFINITY).count();
    if infinite > 0 {
        let share = 1.0 / infinite as f64;
        return scores
            .iter()
            .map(|s| if *s == f64::INFINITY { share } else { 0.0 })
            .collect();
    }

    let max = scores
        .iter()
        .copied()
        .filter(|s| s.is_finite())
        .fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return vec![1.0 / scores.len() as f64; scores.len()];
    }
    let exps: Vec<f64> = scores
        .iter()
        .map(|s| if s.is_finite() { (s - max).exp() } else { 0.0 })
        .collect();
    let sum: f64 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

/// Clamp every weight into `[min, max]` keeping the total at 1
///
/// Weights that hit a bound are fixed there and the remaining mass is spread
/// over the others in proportion to their raw weight. Infeasible bounds
/// (`n * min > 1` or `n * max < 1`) yield the uniform distribution.
pub fn clamp_weights(raw: &[f64], min: f64, max: f64) -> Vec<f64> {
    let n = raw.len();
    match n {
        0 => return Vec::new(),
        1 => return vec![1.0],
        _ => {}
    }
    let uniform = vec![1.0 / n as f64; n];
    if n as f64 * min > 1.0 + WEIGHT_EPSILON || (n as f64) * max < 1.0 - WEIGHT_EPSILON {
        return uniform;
    }

    let mut fixed: Vec<Option<f64>> = vec![None; n];
    let mut weights = vec![0.0; n];

    for _ in 0..=n {
        let remaining = 1.0 - fixed.iter().flatten().sum::<f64>();
        let free: Vec<usize> = (0..n).filter(|i| fixed[*i].is_none()).collect();
        if free.is_empty() {
            break;
        }
        let raw_sum: f64 = free.iter().map(|i| raw[*i].max(0.0)).sum();
        for &i in &free {
            weights[i] = if raw_sum > 0.0 {
                raw[i].max(0.0) / raw_sum * remaining
            } else {
                remaining / free.len() as f64
            };
        }

        let over: Vec<usize> = free
            .iter()
            .copied()
            .filter(|i| weights[*i] > max + WEIGHT_EPSILON)
            .collect();
        if !over.is_empty() {
            for i in over {
                fixed[i] = Some(max);
            }
            continue;
        }
        let under: Vec<usize> = free
            .iter()
            .copied()
            .filter(|i| weights[*i] < min - WEIGHT_EPSILON)
            .collect();
        if !under.is_empty() {
            for i in under {
                fixed[i] = Some(min);
            }
            continue;
        }
        break;
    }

    for (i, value) in fixed.iter().enumerate() {
        if let Some(v) = value {
            weights[i] = *v;
        }
    }

    let total: f64 = weights.iter().sum();
    let in_bounds = weights
        .iter()
        .all(|w| *w >= min - 1e-9 && *w <= max + 1e-9);
    if (total - 1.0).abs() > 1e-9 || !in_bounds {
        return uniform;
    }
    weights
}

/// Map aggregate signals to an operating mode
///
/// Cost pressure wins over everything else. Exploration needs both novelty and
/// acceptance strictly above their thresholds; ties and unknowns stay normal.
pub fn classify_regime(config: &BanditConfig, signals: &RegimeSignals) -> Regime {
    if let Some(cost) = signals.avg_cost_minutes {
        if cost > config.cost_pressure_minutes {
            return Regime::Degraded;
        }
    }
    match (signals.novelty, signals.acceptance_rate) {
        (Some(novelty), Some(acceptance))
            if novelty > config.novelty_threshold && acceptance > config.acceptance_threshold =>
        {
            Regime::Exploratory
        }
        _ => Regime::Normal,
    }
}

/// Weighted draw of a category name
pub fn sample_category<'a, R: Rng + ?Sized>(weights: &'a [CategoryWeight], rng: &mut R) -> Option<&'a str> {
    let index = WeightedIndex::new(weights.iter().map(|w| w.weight)).ok()?;
    weights.get(index.sample(rng)).map(|w| w.category.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn scheduler() -> BanditScheduler {
        BanditScheduler::new(BanditConfig::default())
    }

    #[test]
    fn test_untried_category_scores_infinite() {
        let mut bandit = scheduler();
        bandit.ensure_category("vm");
        assert_eq!(bandit.score("vm", 10), f64::INFINITY);
        assert_eq!(bandit.score("unknown", 10), f64::INFINITY);
    }

    #[test]
    fn test_score_combines_exploit_and_explore() {
        let mut bandit = scheduler();
        // 2 trials of 30 minutes each, 1 distinct failure -> 1 hour runtime
        bandit.record_trial("io", &TrialOutcome::failed(Duration::from_secs(1800), "oom"));
        bandit.record_trial("io", &TrialOutcome::passed(Duration::from_secs(1800)));

        let exploit = 1.0 / (30.0 + 0.1);
        let explore = 1.4 * ((4.0f64).ln() / 2.0).sqrt();
        assert!((bandit.score("io", 4) - (exploit + explore)).abs() < 1e-12);
    }

    #[test]
    fn test_record_trial_counts() {
        let mut bandit = scheduler();
        bandit.record_trial("vm", &TrialOutcome::failed(Duration::from_secs(60), "panic"));
        bandit.record_trial("vm", &TrialOutcome::failed(Duration::from_secs(60), "panic"));
        bandit.record_trial(
            "vm",
            &TrialOutcome {
                flaky: true,
                ..TrialOutcome::passed(Duration::from_secs(60))
            },
        );

        let stats = &bandit.stats()["vm"];
        assert_eq!(stats.trials, 3);
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.passes, 1);
        assert_eq!(stats.distinct_failures.len(), 1);
        assert_eq!(stats.flakes, 1);
        assert!((stats.cost_minutes() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_untried_category_gets_max_weight() {
        let mut bandit = scheduler();
        bandit.record_trial("a", &TrialOutcome::passed(Duration::from_secs(60)));
        bandit.record_trial("b", &TrialOutcome::passed(Duration::from_secs(60)));
        bandit.ensure_category("c");

        let weights = bandit.compute_weights();
        let c = weights.iter().find(|w| w.category == "c").unwrap();
        assert!((c.weight - 0.5).abs() < 1e-9);
        let total: f64 = weights.iter().map(|w| w.weight).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_clamp_infeasible_bounds_is_uniform() {
        // 12 categories cannot each get 0.10
        let weights = clamp_weights(&[1.0 / 12.0; 12], 0.10, 0.50);
        assert!(weights.iter().all(|w| (*w - 1.0 / 12.0).abs() < 1e-12));
        assert_eq!(clamp_weights(&[0.3], 0.1, 0.5), vec![1.0]);
    }

    #[test]
    fn test_regime_classification() {
        let config = BanditConfig::default();
        let degraded = RegimeSignals {
            avg_cost_minutes: Some(12.0),
            novelty: Some(0.9),
            acceptance_rate: Some(0.9),
        };
        assert_eq!(classify_regime(&config, &degraded), Regime::Degraded);

        let exploratory = RegimeSignals {
            avg_cost_minutes: Some(2.0),
            novelty: Some(0.6),
            acceptance_rate: Some(0.4),
        };
        assert_eq!(classify_regime(&config, &exploratory), Regime::Exploratory);

        // tie on novelty stays normal
        let tie = RegimeSignals {
            novelty: Some(0.5),
            ..exploratory
        };
        assert_eq!(classify_regime(&config, &tie), Regime::Normal);

        // missing acceptance stays normal
        let missing = RegimeSignals {
            acceptance_rate: None,
            ..exploratory
        };
        assert_eq!(classify_regime(&config, &missing), Regime::Normal);
        assert_eq!(classify_regime(&config, &RegimeSignals::default()), Regime::Normal);
    }

    #[test]
    fn test_regime_adjusts_candidate_count() {
        assert_eq!(Regime::Normal.adjust_candidates(8), 8);
        assert_eq!(Regime::Degraded.adjust_candidates(8), 4);
        assert_eq!(Regime::Degraded.adjust_candidates(3), 2);
        assert_eq!(Regime::Exploratory.adjust_candidates(8), 12);
        assert_eq!(Regime::Exploratory.adjust_candidates(5), 8);
    }

    #[test]
    fn test_sample_category_respects_zero_weight() {
        let weights = vec![
            CategoryWeight {
                category: "a".into(),
                score: 1.0,
                weight: 0.0,
            },
            CategoryWeight {
                category: "b".into(),
                score: 1.0,
                weight: 1.0,
            },
        ];
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            assert_eq!(sample_category(&weights, &mut rng), Some("b"));
        }
        assert_eq!(sample_category(&[], &mut rng), None);
    }

    proptest! {
        #[test]
        fn prop_weights_within_bounds(scores in proptest::collection::vec(-50.0f64..50.0, 2..10)) {
            let weights = clamp_weights(&softmax(&scores), 0.10, 0.50);
            let total: f64 = weights.iter().sum();
            prop_assert!((total - 1.0).abs() < 1e-9);
            for w in weights {
                prop_assert!(w >= 0.10 - 1e-9 && w <= 0.50 + 1e-9);
            }
        }

        #[test]
        fn prop_weights_sum_to_one_with_untried(
            trials in proptest::collection::vec(0u64..20, 2..8),
        ) {
            let mut bandit = BanditScheduler::new(BanditConfig::default());
            for (i, n) in trials.iter().enumerate() {
                let name = format!("c{}", i);
                bandit.ensure_category(&name);
                for _ in 0..*n {
                    bandit.record_trial(&name, &TrialOutcome::passed(Duration::from_secs(30)));
                }
            }
            let total: f64 = bandit.compute_weights().iter().map(|w| w.weight).sum();
            prop_assert!((total - 1.0).abs() < 1e-9);
        }
    }
}
