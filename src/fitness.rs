//! Fitness fusion
//!
//! Combines the production and synthetic ledgers into one confidence-weighted
//! score. Results are derived on demand and never cached.
//!
//! - production component: `0.6 * success_rate + 0.4 / (1 + avg_ttr_ms / 500)`
//!   over the production window
//! - synthetic component: mean composite score weighted by `2^(-age / half_life)`
//!   over the (longer) synthetic window
//!
//! A component with fewer than `min_samples` in-window observations is
//! undefined. When only one component is defined it carries the full weight,
//! so a candidate with synthetic data alone is still rankable.

use crate::config::FusionConfig;
use crate::error::Result;
use crate::ledger::{epoch_seconds, FitnessLedger, ProductionObservation, SyntheticObservation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

const SUCCESS_WEIGHT: f64 = 0.6;
const SPEED_WEIGHT: f64 = 0.4;
const SPEED_SCALE_MS: f64 = 500.0;

/// Which sources contributed to a fused score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceReason {
    InsufficientData,
    ProductionOnly,
    SyntheticOnly,
    Both,
}

impl fmt::Display for ConfidenceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConfidenceReason::InsufficientData => "insufficient_data",
            ConfidenceReason::ProductionOnly => "production_only",
            ConfidenceReason::SyntheticOnly => "synthetic_only",
            ConfidenceReason::Both => "both",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedFitness {
    pub score: f64,
    pub production_component: Option<f64>,
    pub synthetic_component: Option<f64>,
    pub weight_production: f64,
    pub weight_synthetic: f64,
    pub sample_count_production: usize,
    pub sample_count_synthetic: usize,
    pub confidence_reason: ConfidenceReason,
}

impl FusedFitness {
    pub fn has_data(&self) -> bool {
        self.confidence_reason != ConfidenceReason::InsufficientData
    }
}

pub struct FitnessFusionEngine {
    config: FusionConfig,
    ledger: Arc<dyn FitnessLedger>,
}

impl FitnessFusionEngine {
    pub fn new(config: FusionConfig, ledger: Arc<dyn FitnessLedger>) -> Self {
        Self { config, ledger }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<dyn FitnessLedger> {
        &self.ledger
    }

    /// Fuse both ledgers for `candidate_id` as of `now`
    pub fn fuse(&self, candidate_id: &str, now: DateTime<Utc>) -> Result<FusedFitness> {
        let now_ts = epoch_seconds(now);
        let production = self.ledger.production_since(
            candidate_id,
            now_ts - self.config.production_window.as_secs_f64(),
        )?;
        let synthetic = self.ledger.synthetic_since(
            candidate_id,
            now_ts - self.config.synthetic_window.as_secs_f64(),
        )?;

        let fused = fuse_observations(&self.config, &production, &synthetic, now_ts);
        debug!(
            candidate = candidate_id,
            score = fused.score,
            reason = %fused.confidence_reason,
            "fused fitness"
        );
        Ok(fused)
    }

    /// Fuse several candidates with one pass over each ledger
    ///
    /// `pending` synthetic observations are counted as if already recorded,
    /// so a batch can be ranked before anything is written.
    pub fn fuse_batch(
        &self,
        candidate_ids: &[&str],
        now: DateTime<Utc>,
        pending: &[SyntheticObservation],
    ) -> Result<Vec<FusedFitness>> {
        let now_ts = epoch_seconds(now);
        let production_since = now_ts - self.config.production_window.as_secs_f64();
        let synthetic_since = now_ts - self.config.synthetic_window.as_secs_f64();
        let mut production = self.ledger.production_since_many(candidate_ids, production_since)?;
        let mut synthetic = self.ledger.synthetic_since_many(candidate_ids, synthetic_since)?;
        for observation in pending.iter().filter(|o| o.ts >= synthetic_since) {
            if let Some(observations) = synthetic.get_mut(&observation.candidate) {
                observations.push(observation.clone());
            }
        }

        Ok(candidate_ids
            .iter()
            .map(|id| {
                let production = production.remove(*id).unwrap_or_default();
                let synthetic = synthetic.remove(*id).unwrap_or_default();
                fuse_observations(&self.config, &production, &synthetic, now_ts)
            })
            .collect())
    }
}

/// Production component, or `None` below `min_samples`
pub fn production_component(observations: &[ProductionObservation], min_samples: usize) -> Option<f64> {
    if observations.is_empty() || observations.len() < min_samples {
        return None;
    }
    let n = observations.len() as f64;
    let successes = observations.iter().filter(|o| o.ok).count() as f64;
    let avg_ttr = observations.iter().map(|o| o.ttr_ms.max(0.0)).sum::<f64>() / n;
    let speed = 1.0 / (1.0 + avg_ttr / SPEED_SCALE_MS);
    Some(SUCCESS_WEIGHT * (successes / n) + SPEED_WEIGHT * speed)
}

/// Decay-weighted synthetic component, or `None` below `min_samples`
pub fn synthetic_component(
    observations: &[SyntheticObservation],
    min_samples: usize,
    half_life_secs: f64,
    now_ts: f64,
) -> Option<f64> {
    if observations.is_empty() || observations.len() < min_samples {
        return None;
    }
    let mut weighted = 0.0;
    let mut total = 0.0;
    for o in observations {
        // observations stamped in the future count as fresh
        let age = (now_ts - o.ts).max(0.0);
        let w = (-age / half_life_secs).exp2();
        weighted += w * o.composite_phase_fitness;
        total += w;
    }
    if total > 0.0 {
        Some(weighted / total)
    } else {
        None
    }
}

/// Gate and combine already-windowed observations
pub fn fuse_observations(
    config: &FusionConfig,
    production: &[ProductionObservation],
    synthetic: &[SyntheticObservation],
    now_ts: f64,
) -> FusedFitness {
    let prod = production_component(production, config.min_samples);
    let synth = synthetic_component(
        synthetic,
        config.min_samples,
        config.half_life.as_secs_f64(),
        now_ts,
    );

    let (score, weight_production, weight_synthetic, confidence_reason) = match (prod, synth) {
        (None, None) => (0.0, 0.0, 0.0, ConfidenceReason::InsufficientData),
        (Some(p), None) => (p, 1.0, 0.0, ConfidenceReason::ProductionOnly),
        (None, Some(s)) => (s, 0.0, 1.0, ConfidenceReason::SyntheticOnly),
        (Some(p), Some(s)) => (
            config.weight_production * p + config.weight_synthetic * s,
            config.weight_production,
            config.weight_synthetic,
            ConfidenceReason::Both,
        ),
    };

    FusedFitness {
        score,
        production_component: prod,
        synthetic_component: synth,
        weight_production,
        weight_synthetic,
        sample_count_production: production.len(),
        sample_count_synthetic: synthetic.len(),
        confidence_reason,
    }
}
