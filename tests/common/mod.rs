//! Common test utilities and helpers

#![allow(dead_code)]

use async_trait::async_trait;
use evolver_core::config::{EvolverConfig, InvestigationConfig, PathsConfig};
use evolver_core::daemon::Services;
use evolver_core::error::{EvolverError, Result};
use evolver_core::retry::RetryPolicy;
use evolver_core::tournament::evaluator::{EvaluationBatch, EvaluationContext, Evaluator, EvaluatorRegistry};
use evolver_core::tournament::search::{ParamSpec, Params, SearchSpace};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Scores each candidate as `1 - |swappiness - 30| / 100`
pub struct PeakEvaluator;

#[async_trait]
impl Evaluator for PeakEvaluator {
    fn name(&self) -> &str {
        "peak"
    }

    async fn evaluate(&self, candidates: &[Params], _context: &EvaluationContext) -> Result<EvaluationBatch> {
        let fitnesses = candidates
            .iter()
            .map(|p| {
                let x = p.get("swappiness").and_then(|v| v.as_f64()).unwrap_or(0.0);
                1.0 - (x - 30.0).abs() / 100.0
            })
            .collect();
        Ok(EvaluationBatch {
            fitnesses,
            artifacts: BTreeMap::new(),
        })
    }
}

/// Fails every call and counts them
#[derive(Default)]
pub struct FlakyEvaluator {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Evaluator for FlakyEvaluator {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn evaluate(&self, _: &[Params], _: &EvaluationContext) -> Result<EvaluationBatch> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(EvolverError::Evaluation("benchmark host unreachable".to_string()))
    }
}

pub fn swappiness_space() -> SearchSpace {
    SearchSpace::new().with("swappiness", ParamSpec::Int { min: 0, max: 100 })
}

/// Config rooted in `data_dir` with fast retries and no rate limit
pub fn test_config(data_dir: &Path) -> EvolverConfig {
    let mut config = EvolverConfig::default();
    config.paths = PathsConfig::with_data_dir(data_dir);
    config.retry = RetryPolicy::new(1, 1, 5_000).unwrap();
    config.tournament.min_interval = Duration::ZERO;
    config.investigations.push(InvestigationConfig {
        question_id: "vm-swappiness".to_string(),
        hypothesis: "swappiness near 30 minimises stalls".to_string(),
        category: "vm".to_string(),
        evaluator: "peak".to_string(),
        fallback_evaluators: Vec::new(),
        search_space: swappiness_space(),
    });
    config
}

pub fn evaluators(flaky: Arc<FlakyEvaluator>) -> EvaluatorRegistry {
    let mut registry = EvaluatorRegistry::new();
    registry.register(Arc::new(PeakEvaluator)).unwrap();
    registry.register(flaky).unwrap();
    registry
}

pub fn open(config: EvolverConfig) -> Services {
    Services::open_with(config, evaluators(Arc::new(FlakyEvaluator::default()))).unwrap()
}
