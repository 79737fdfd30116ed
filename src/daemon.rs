// Scheduler Daemon
//
// Long-running service around the tournament executor:
// - a queue drain poller (daemon.poll_interval)
// - an investigation timer (daemon.timer_interval) that picks a category by
//   bandit weight and enqueues one of that category's standing investigations
// On Ctrl-C the executor stops accepting work, the in-flight tournament is
// allowed to finish and scheduler state is written to disk.

use crate::bandit::sample_category;
use crate::config::EvolverConfig;
use crate::error::Result;
use crate::fitness::FitnessFusionEngine;
use crate::ledger::JsonlLedger;
use crate::promotion::{PromotionGate, StaticSafetyPolicy};
use crate::registry::CandidateRegistry;
use crate::tournament::evaluator::EvaluatorRegistry;
use crate::tournament::{InvestigationRequest, SharedRegistry, SubmitOutcome, TournamentExecutor};
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Every long-lived component, wired from one configuration
pub struct Services {
    pub config: EvolverConfig,
    pub registry: SharedRegistry,
    pub fusion: Arc<FitnessFusionEngine>,
    pub evaluators: Arc<EvaluatorRegistry>,
    pub executor: Arc<TournamentExecutor>,
    pub gate: Arc<PromotionGate>,
}

impl Services {
    /// Open with the command evaluators declared in `[evaluators]`
    pub fn open(config: EvolverConfig) -> Result<Self> {
        let evaluators = EvaluatorRegistry::from_config(&config.evaluators)?;
        Self::open_with(config, evaluators)
    }

    /// Open with an explicit evaluator registry
    pub fn open_with(config: EvolverConfig, evaluators: EvaluatorRegistry) -> Result<Self> {
        let paths = &config.paths;
        let registry = Arc::new(Mutex::new(
            CandidateRegistry::load(&paths.registry_file(), &paths.snapshot_dir())?
                .with_snapshot_retention(config.registry.snapshot_retention),
        ));
        let ledger = Arc::new(JsonlLedger::new(paths.production_ledger(), paths.synthetic_ledger()));
        let fusion = Arc::new(FitnessFusionEngine::new(config.fusion.clone(), ledger));
        let evaluators = Arc::new(evaluators);
        let executor = Arc::new(TournamentExecutor::new(
            &config,
            Arc::clone(&registry),
            Arc::clone(&fusion),
            Arc::clone(&evaluators),
        )?);
        let safety = Arc::new(StaticSafetyPolicy::from_config(&config.safety)?);
        let gate = Arc::new(PromotionGate::new(
            config.promotion.clone(),
            paths,
            Arc::clone(&registry),
            safety,
        )?);
        executor.set_acceptance_rate(gate.acceptance_rate());

        Ok(Self {
            config,
            registry,
            fusion,
            evaluators,
            executor,
            gate,
        })
    }
}

pub struct Daemon {
    services: Services,
}

impl Daemon {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Cancelling this token stops the daemon as Ctrl-C would
    pub fn shutdown_token(&self) -> CancellationToken {
        self.services.executor.shutdown_token()
    }

    /// One timer firing: choose a category and enqueue its investigation
    ///
    /// Returns `None` when no investigation is configured.
    pub fn timer_tick<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Option<SubmitOutcome>> {
        let executor = &self.services.executor;
        let investigations = &self.services.config.investigations;
        executor.set_acceptance_rate(self.services.gate.acceptance_rate());

        let weights: Vec<_> = executor
            .bandit_weights()
            .into_iter()
            .filter(|w| investigations.iter().any(|i| i.category == w.category))
            .collect();
        let Some(category) = sample_category(&weights, rng) else {
            debug!("No standing investigations, timer idle");
            return Ok(None);
        };
        let candidates: Vec<_> = investigations.iter().filter(|i| i.category == category).collect();
        let Some(investigation) = candidates.choose(rng) else {
            return Ok(None);
        };

        info!(
            category = %category,
            question_id = %investigation.question_id,
            "Timer scheduling investigation"
        );
        executor
            .enqueue(InvestigationRequest::from(*investigation))
            .map(Some)
    }

    fn spawn_timer(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let daemon = Arc::clone(self);
        let token = self.shutdown_token();
        tokio::spawn(async move {
            info!("Investigation timer started ({:?} interval)", interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match daemon.timer_tick(&mut rand::thread_rng()) {
                    Ok(Some(outcome)) => debug!("Timer enqueue: {:?}", outcome),
                    Ok(None) => {}
                    Err(e) => warn!("Timer enqueue failed: {}", e),
                }
            }
            info!("Investigation timer stopped");
        })
    }

    /// Run until Ctrl-C or until the shutdown token is cancelled
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let daemon_config = self.services.config.daemon.clone();
        let executor = Arc::clone(&self.services.executor);
        let token = self.shutdown_token();

        info!(
            investigations = self.services.config.investigations.len(),
            evaluators = self.services.evaluators.names().count(),
            "Evolver daemon starting"
        );

        let mut tasks = vec![executor.spawn_drain_loop(daemon_config.poll_interval)];
        if daemon_config.timer_enabled {
            tasks.push(self.spawn_timer(daemon_config.timer_interval));
        }

        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Received Ctrl-C, shutting down");
            }
            _ = token.cancelled() => {
                info!("Shutdown requested");
            }
        }

        executor.shutdown().await?;
        for task in tasks {
            if let Err(e) = task.await {
                error!("Background task ended abnormally: {}", e);
            }
        }
        info!("Evolver daemon stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InvestigationConfig, PathsConfig};
    use crate::error::EvolverError;
    use crate::tournament::evaluator::{EvaluationBatch, EvaluationContext, Evaluator};
    use crate::tournament::search::{ParamSpec, Params, SearchSpace};
    use crate::tournament::state::{QuestionStatus, SchedulerState};
    use async_trait::async_trait;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct Half;

    #[async_trait]
    impl Evaluator for Half {
        fn name(&self) -> &str {
            "half"
        }

        async fn evaluate(
            &self,
            candidates: &[Params],
            _: &EvaluationContext,
        ) -> std::result::Result<EvaluationBatch, EvolverError> {
            Ok(EvaluationBatch {
                fitnesses: vec![0.5; candidates.len()],
                artifacts: BTreeMap::new(),
            })
        }
    }

    fn config(temp: &TempDir) -> EvolverConfig {
        let mut config = EvolverConfig::default();
        config.paths = PathsConfig::with_data_dir(temp.path());
        config.tournament.min_interval = Duration::ZERO;
        config.daemon.poll_interval = Duration::from_millis(10);
        config.daemon.timer_interval = Duration::from_millis(10);
        config.investigations.push(InvestigationConfig {
            question_id: "vm-swappiness".to_string(),
            hypothesis: "lower swappiness reduces stalls".to_string(),
            category: "vm".to_string(),
            evaluator: "half".to_string(),
            fallback_evaluators: Vec::new(),
            search_space: SearchSpace::new().with("swappiness", ParamSpec::Int { min: 0, max: 100 }),
        });
        config
    }

    fn services(config: EvolverConfig) -> Services {
        let mut evaluators = EvaluatorRegistry::new();
        evaluators.register(Arc::new(Half)).unwrap();
        Services::open_with(config, evaluators).unwrap()
    }

    #[test]
    fn test_timer_tick_enqueues_configured_investigation() {
        let temp = TempDir::new().unwrap();
        let daemon = Daemon::new(services(config(&temp)));
        let mut rng = StdRng::seed_from_u64(7);

        let outcome = daemon.timer_tick(&mut rng).unwrap().unwrap();
        assert!(matches!(outcome, SubmitOutcome::Queued { position: 0, .. }));
        assert!(matches!(
            daemon.timer_tick(&mut rng).unwrap().unwrap(),
            SubmitOutcome::Duplicate
        ));
        assert_eq!(
            daemon.services().executor.status("vm-swappiness"),
            QuestionStatus::Queued
        );
    }

    #[test]
    fn test_timer_idle_without_investigations() {
        let temp = TempDir::new().unwrap();
        let mut config = config(&temp);
        config.investigations.clear();
        let daemon = Daemon::new(services(config));
        assert!(daemon.timer_tick(&mut StdRng::seed_from_u64(1)).unwrap().is_none());
    }

    #[test]
    fn test_unknown_evaluator_fails_at_startup() {
        let temp = TempDir::new().unwrap();
        let result = Services::open_with(config(&temp), EvaluatorRegistry::new());
        assert!(matches!(result, Err(EvolverError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_run_drains_and_checkpoints_on_shutdown() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let state_file = config.paths.state_file();
        let daemon = Arc::new(Daemon::new(services(config)));
        let token = daemon.shutdown_token();

        let handle = tokio::spawn(Arc::clone(&daemon).run());
        let executor = Arc::clone(&daemon.services().executor);
        for _ in 0..500 {
            if matches!(
                executor.status("vm-swappiness"),
                QuestionStatus::Completed | QuestionStatus::Converged
            ) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        token.cancel();
        handle.await.unwrap().unwrap();

        let saved = SchedulerState::load(&state_file).unwrap();
        assert!(saved.bandit["vm"].trials >= 1);
        assert!(saved.convergence["vm-swappiness"].len() >= 1);
    }
}
