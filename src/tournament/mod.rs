// Tournament Executor
//
// Single execution lane for investigations. At most one tournament runs at a
// time; a caller that cannot take the execution lock immediately, or that is
// held back by the rate limiter or an open circuit, is put in the bounded
// deferred queue instead of waiting. A background poller drains the queue.
//
// Two locks:
// - the execution lock (tokio Mutex, only ever try_lock'ed by producers)
// - the state lock (std Mutex around SchedulerCore, never held across .await)
// so status queries never wait behind a running tournament.

pub mod circuit;
pub mod convergence;
pub mod evaluator;
pub mod queue;
pub mod rate_limit;
pub mod record;
pub mod search;
pub mod state;

use crate::bandit::{BanditScheduler, CategoryWeight, Regime, TrialOutcome};
use crate::config::{BanditConfig, EvolverConfig, InvestigationConfig, PathsConfig, TournamentConfig};
use crate::error::{EvolverError, Result};
use crate::fitness::FitnessFusionEngine;
use crate::genome::{CandidateGenome, Phenotype};
use crate::ledger::{epoch_seconds, SyntheticObservation};
use crate::registry::CandidateRegistry;
use crate::retry::{AsyncRetryExecutor, RetryError, RetryPolicy, RetryReport};
use chrono::{DateTime, Utc};
use circuit::CircuitBreaker;
use convergence::ConvergenceTracker;
use evaluator::{evaluator_operation, EvaluationBatch, EvaluationContext, EvaluationInput, EvaluatorRegistry};
use queue::{DedupQueue, Enqueued, QueueKey};
use rate_limit::RateLimiter;
use record::{TournamentRecord, WinnerRecord};
use search::SearchSpace;
use serde::{Deserialize, Serialize};
use state::{QuestionStatus, SchedulerState};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Registry shared between the executor and the promotion gate
pub type SharedRegistry = Arc<Mutex<CandidateRegistry>>;

fn default_category() -> String {
    "default".to_string()
}

/// Investigation request, agnostic of the transport it arrived on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestigationRequest {
    pub question_id: String,
    pub hypothesis: String,
    /// Bandit category; also the registry ecosystem of generated candidates
    #[serde(default = "default_category")]
    pub category: String,
    pub search_space: SearchSpace,
    pub evaluator: String,
    #[serde(default)]
    pub fallback_evaluators: Vec<String>,
}

impl InvestigationRequest {
    pub fn new(
        question_id: impl Into<String>,
        hypothesis: impl Into<String>,
        search_space: SearchSpace,
        evaluator: impl Into<String>,
    ) -> Self {
        Self {
            question_id: question_id.into(),
            hypothesis: hypothesis.into(),
            category: default_category(),
            search_space,
            evaluator: evaluator.into(),
            fallback_evaluators: Vec::new(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_fallback(mut self, evaluator: impl Into<String>) -> Self {
        self.fallback_evaluators.push(evaluator.into());
        self
    }
}

impl From<&InvestigationConfig> for InvestigationRequest {
    fn from(config: &InvestigationConfig) -> Self {
        Self {
            question_id: config.question_id.clone(),
            hypothesis: config.hypothesis.clone(),
            category: config.category.clone(),
            search_space: config.search_space.clone(),
            evaluator: config.evaluator.clone(),
            fallback_evaluators: config.fallback_evaluators.clone(),
        }
    }
}

impl QueueKey for InvestigationRequest {
    fn queue_key(&self) -> &str {
        &self.question_id
    }
}

/// Why a request was queued instead of run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DeferReason {
    /// Another tournament holds the execution lock
    Busy,
    RateLimited { retry_in_secs: u64 },
    CircuitOpen { until: DateTime<Utc> },
    /// Enqueued by the investigation timer
    Scheduled,
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferReason::Busy => write!(f, "tournament in progress"),
            DeferReason::RateLimited { retry_in_secs } => write!(f, "rate limited for {}s", retry_in_secs),
            DeferReason::CircuitOpen { until } => write!(f, "circuit open until {}", until),
            DeferReason::Scheduled => write!(f, "scheduled"),
        }
    }
}

/// Result of a completed tournament
#[derive(Debug, Clone, Serialize)]
pub struct TournamentOutcome {
    pub tournament_id: String,
    pub question_id: String,
    pub champion: String,
    pub champion_hash: String,
    pub champion_fitness: f64,
    /// Ranking fitness per candidate
    pub fitnesses: Vec<f64>,
    pub regime: Regime,
    pub converged: bool,
    /// Sampled candidates dropped because their genome was already known
    pub skipped_duplicates: usize,
    pub winner_path: PathBuf,
    pub retry: RetryReport,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Completed(TournamentOutcome),
    /// Question already converged; nothing was run
    AlreadyConverged,
    /// Every sampled genome had been tested before
    Exhausted,
    Queued {
        reason: DeferReason,
        position: usize,
        /// Question id dropped from the front of a full queue
        evicted: Option<String>,
    },
    /// Question id already queued; no-op
    Duplicate,
    /// Queue full and the overflow policy rejects
    QueueFull,
}

/// Per-question view for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct QuestionReport {
    pub status: QuestionStatus,
    pub history: Vec<f64>,
    pub variance: Option<f64>,
}

/// Read-only snapshot for `status`
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub circuit_open: bool,
    pub circuit_open_until: Option<DateTime<Utc>>,
    pub recent_failures: usize,
    pub last_start: Option<DateTime<Utc>>,
    pub rate_limit_remaining_secs: u64,
    pub queue: Vec<String>,
    pub queue_capacity: usize,
    pub questions: BTreeMap<String, QuestionReport>,
    pub regime: Regime,
    pub weights: Vec<CategoryWeight>,
}

/// Mutable scheduler state, guarded by the state lock
struct SchedulerCore {
    bandit: BanditScheduler,
    circuit: CircuitBreaker,
    rate: RateLimiter,
    queue: DedupQueue<InvestigationRequest>,
    convergence: ConvergenceTracker,
    statuses: BTreeMap<String, QuestionStatus>,
    acceptance_rate: Option<f64>,
}

impl SchedulerCore {
    fn from_state(config: &TournamentConfig, bandit: BanditConfig, state: SchedulerState) -> Self {
        let queue = DedupQueue::from_entries(config.queue_capacity, config.overflow_policy, state.queue);
        let mut statuses = state.statuses;
        for (question_id, status) in statuses.iter_mut() {
            if *status == QuestionStatus::Queued && !queue.contains(question_id) {
                *status = QuestionStatus::Idle;
            }
        }
        Self {
            bandit: BanditScheduler::with_stats(bandit, state.bandit),
            circuit: CircuitBreaker::with_state(
                config.circuit_failure_threshold,
                config.circuit_window,
                config.circuit_cooldown,
                state.circuit,
            ),
            rate: RateLimiter::new(config.min_interval, state.last_start),
            queue,
            convergence: ConvergenceTracker::with_history(
                config.convergence_window,
                config.convergence_threshold,
                state.convergence,
            ),
            statuses,
            acceptance_rate: state.acceptance_rate,
        }
    }

    fn to_state(&self) -> SchedulerState {
        SchedulerState {
            bandit: self.bandit.stats().clone(),
            convergence: self.convergence.to_map(),
            circuit: self.circuit.state().clone(),
            last_start: self.rate.last_start(),
            queue: self.queue.to_vec(),
            statuses: self.statuses.clone(),
            acceptance_rate: self.acceptance_rate,
            saved_at: None,
        }
    }

    fn regime(&self) -> Regime {
        let signals = self.bandit.signals(self.acceptance_rate);
        self.bandit.classify_regime(&signals)
    }

    /// Circuit first, then rate limit
    fn gate(&mut self, now: DateTime<Utc>) -> std::result::Result<(), DeferReason> {
        if let Err(until) = self.circuit.check(now) {
            return Err(DeferReason::CircuitOpen { until });
        }
        if let Err(remaining) = self.rate.check(now) {
            return Err(DeferReason::RateLimited {
                retry_in_secs: remaining.as_secs_f64().ceil() as u64,
            });
        }
        Ok(())
    }

    /// Outcome for a question that must not run again
    fn settled(&mut self, question_id: &str) -> Option<SubmitOutcome> {
        if self.convergence.is_converged(question_id) {
            self.statuses
                .insert(question_id.to_string(), QuestionStatus::Converged);
            info!(question_id = %question_id, "Already converged, skipping");
            return Some(SubmitOutcome::AlreadyConverged);
        }
        if self.statuses.get(question_id) == Some(&QuestionStatus::Exhausted) {
            info!(question_id = %question_id, "Search space exhausted, skipping");
            return Some(SubmitOutcome::Exhausted);
        }
        None
    }

    fn start(&mut self, question_id: &str, now: DateTime<Utc>) {
        self.rate.mark_started(now);
        self.statuses.insert(question_id.to_string(), QuestionStatus::Running);
    }

    fn enqueue(&mut self, request: InvestigationRequest, reason: DeferReason) -> SubmitOutcome {
        let question_id = request.question_id.clone();
        match self.queue.push(request) {
            Enqueued::Added { position } => {
                self.statuses.insert(question_id.clone(), QuestionStatus::Queued);
                info!(question_id = %question_id, position, "Deferred: {}", reason);
                SubmitOutcome::Queued {
                    reason,
                    position,
                    evicted: None,
                }
            }
            Enqueued::AddedWithEviction { position, evicted } => {
                warn!(
                    evicted = %evicted.question_id,
                    question_id = %question_id,
                    "Deferred queue full, evicted oldest request"
                );
                self.statuses.insert(evicted.question_id.clone(), QuestionStatus::Idle);
                self.statuses.insert(question_id, QuestionStatus::Queued);
                SubmitOutcome::Queued {
                    reason,
                    position,
                    evicted: Some(evicted.question_id),
                }
            }
            Enqueued::Duplicate => {
                debug!(question_id = %question_id, "Already queued");
                SubmitOutcome::Duplicate
            }
            Enqueued::Rejected => {
                warn!(question_id = %question_id, "Deferred queue full, rejecting request");
                SubmitOutcome::QueueFull
            }
        }
    }
}

/// Tournament executor
pub struct TournamentExecutor {
    config: TournamentConfig,
    retry: RetryPolicy,
    paths: PathsConfig,
    registry: SharedRegistry,
    fusion: Arc<FitnessFusionEngine>,
    evaluators: Arc<EvaluatorRegistry>,
    exec_lock: tokio::sync::Mutex<()>,
    state: Mutex<SchedulerCore>,
    checkpoint_lock: Mutex<()>,
    shutdown: CancellationToken,
}

impl TournamentExecutor {
    /// Build the executor and resume from the last checkpoint
    ///
    /// Every configured investigation must name registered evaluators.
    pub fn new(
        config: &EvolverConfig,
        registry: SharedRegistry,
        fusion: Arc<FitnessFusionEngine>,
        evaluators: Arc<EvaluatorRegistry>,
    ) -> Result<Self> {
        for investigation in &config.investigations {
            for name in std::iter::once(&investigation.evaluator).chain(&investigation.fallback_evaluators) {
                evaluators.get(name)?;
            }
        }

        let state = SchedulerState::load(&config.paths.state_file())?;
        let mut core = SchedulerCore::from_state(&config.tournament, config.bandit.clone(), state);
        for investigation in &config.investigations {
            core.bandit.ensure_category(&investigation.category);
        }

        Ok(Self {
            config: config.tournament.clone(),
            retry: config.retry,
            paths: config.paths.clone(),
            registry,
            fusion,
            evaluators,
            exec_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(core),
            checkpoint_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
        })
    }

    fn core(&self) -> MutexGuard<'_, SchedulerCore> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry(&self) -> MutexGuard<'_, CandidateRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn validate(&self, request: &InvestigationRequest) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(EvolverError::ShuttingDown);
        }
        if request.question_id.trim().is_empty() {
            return Err(EvolverError::InvalidInput("question_id is empty".to_string()));
        }
        request
            .search_space
            .validate()
            .map_err(|e| EvolverError::InvalidInput(format!("{}: {}", request.question_id, e)))?;
        for name in std::iter::once(&request.evaluator).chain(&request.fallback_evaluators) {
            self.evaluators.get(name)?;
        }
        Ok(())
    }

    /// Run the investigation now if the lane is free, otherwise defer it
    pub async fn submit(&self, request: InvestigationRequest) -> Result<SubmitOutcome> {
        self.validate(&request)?;
        {
            let mut core = self.core();
            if let Some(outcome) = core.settled(&request.question_id) {
                return Ok(outcome);
            }
            if core.queue.contains(&request.question_id) {
                debug!(question_id = %request.question_id, "Already queued");
                return Ok(SubmitOutcome::Duplicate);
            }
        }

        let Ok(_lane) = self.exec_lock.try_lock() else {
            let outcome = self.core().enqueue(request, DeferReason::Busy);
            self.checkpoint_logged();
            return Ok(outcome);
        };

        let request = {
            let mut core = self.core();
            let now = Utc::now();
            match core.gate(now) {
                Ok(()) => {
                    core.start(&request.question_id, now);
                    request
                }
                Err(reason) => {
                    let outcome = core.enqueue(request, reason);
                    drop(core);
                    self.checkpoint_logged();
                    return Ok(outcome);
                }
            }
        };

        self.run_tournament(request).await
    }

    /// Put a request straight into the deferred queue
    pub fn enqueue(&self, request: InvestigationRequest) -> Result<SubmitOutcome> {
        self.validate(&request)?;
        let outcome = {
            let mut core = self.core();
            if let Some(outcome) = core.settled(&request.question_id) {
                return Ok(outcome);
            }
            core.enqueue(request, DeferReason::Scheduled)
        };
        self.checkpoint_logged();
        Ok(outcome)
    }

    /// Run the oldest queued request if the lane is free and the gates allow
    pub async fn drain_once(&self) -> Result<Option<SubmitOutcome>> {
        if self.shutdown.is_cancelled() {
            return Ok(None);
        }
        let Ok(_lane) = self.exec_lock.try_lock() else {
            return Ok(None);
        };

        let request = {
            let mut core = self.core();
            if core.queue.is_empty() {
                return Ok(None);
            }
            let now = Utc::now();
            if let Err(reason) = core.gate(now) {
                debug!("Queue drain held back: {}", reason);
                return Ok(None);
            }
            let Some(request) = core.queue.pop() else {
                return Ok(None);
            };
            if let Some(outcome) = core.settled(&request.question_id) {
                drop(core);
                self.checkpoint_logged();
                return Ok(Some(outcome));
            }
            core.start(&request.question_id, now);
            request
        };

        self.run_tournament(request).await.map(Some)
    }

    /// Poll the queue every `interval` until shutdown
    pub fn spawn_drain_loop(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let executor = Arc::clone(self);
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            info!("Queue drain poller started ({:?} interval)", interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match executor.drain_once().await {
                    Ok(Some(outcome)) => debug!("Drained queued request: {:?}", outcome),
                    Ok(None) => {}
                    Err(e) => error!("Queued tournament failed: {}", e),
                }
            }
            info!("Queue drain poller stopped");
        })
    }

    /// Stop accepting work, wait for the in-flight tournament, persist state
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        info!("Waiting for in-flight tournament before shutdown");
        let _lane = self.exec_lock.lock().await;
        self.checkpoint()?;
        info!("Scheduler state saved");
        Ok(())
    }

    /// Current status of one question
    pub fn status(&self, question_id: &str) -> QuestionStatus {
        self.core().statuses.get(question_id).copied().unwrap_or_default()
    }

    pub fn is_circuit_open(&self) -> bool {
        self.core().circuit.is_open(Utc::now())
    }

    pub fn queue_len(&self) -> usize {
        self.core().queue.len()
    }

    pub fn reset_circuit(&self) -> Result<()> {
        self.core().circuit.reset();
        self.checkpoint()
    }

    pub fn snapshot_state(&self) -> SchedulerState {
        self.core().to_state()
    }

    pub fn bandit_weights(&self) -> Vec<CategoryWeight> {
        self.core().bandit.compute_weights()
    }

    pub fn regime(&self) -> Regime {
        self.core().regime()
    }

    /// Downstream acceptance signal used for regime classification
    pub fn set_acceptance_rate(&self, rate: Option<f64>) {
        self.core().acceptance_rate = rate;
    }

    pub fn status_report(&self) -> SchedulerStatus {
        let core = self.core();
        let now = Utc::now();
        let mut questions: BTreeMap<String, QuestionReport> = core
            .statuses
            .iter()
            .map(|(id, status)| {
                (
                    id.clone(),
                    QuestionReport {
                        status: *status,
                        history: core.convergence.history(id),
                        variance: core.convergence.variance(id),
                    },
                )
            })
            .collect();
        for (id, history) in core.convergence.to_map() {
            questions.entry(id.clone()).or_insert_with(|| QuestionReport {
                status: QuestionStatus::Idle,
                variance: core.convergence.variance(&id),
                history,
            });
        }

        SchedulerStatus {
            circuit_open: core.circuit.is_open(now),
            circuit_open_until: core.circuit.open_until(),
            recent_failures: core.circuit.state().failures.len(),
            last_start: core.rate.last_start(),
            rate_limit_remaining_secs: core.rate.remaining(now).as_secs(),
            queue: core.queue.iter().map(|r| r.question_id.clone()).collect(),
            queue_capacity: core.queue.capacity(),
            questions,
            regime: core.regime(),
            weights: core.bandit.compute_weights(),
        }
    }

    /// Persist the scheduler state atomically
    pub fn checkpoint(&self) -> Result<()> {
        let _serial = self.checkpoint_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut state = self.core().to_state();
        state.save(&self.paths.state_file())
    }

    fn checkpoint_logged(&self) {
        if let Err(e) = self.checkpoint() {
            warn!("Failed to checkpoint scheduler state: {}", e);
        }
    }

    /// Count a failed tick against the circuit and the bandit, mark the
    /// question failed and hand the error back
    fn abort(
        &self,
        request: &InvestigationRequest,
        runtime: Duration,
        signature: String,
        err: EvolverError,
    ) -> EvolverError {
        {
            let mut core = self.core();
            core.circuit.record_failure(Utc::now());
            core.bandit
                .record_trial(&request.category, &TrialOutcome::failed(runtime, signature));
            core.statuses
                .insert(request.question_id.clone(), QuestionStatus::Failed);
        }
        self.checkpoint_logged();
        error!(question_id = %request.question_id, "Tournament failed: {}", err);
        err
    }

    fn abort_with(
        &self,
        request: &InvestigationRequest,
        runtime: Duration,
        err: EvolverError,
    ) -> EvolverError {
        let signature = err.to_string();
        self.abort(request, runtime, signature, err)
    }

    /// Undo a registry commit whose tick could not be completed
    fn rollback_registry(&self, version: u64) {
        match self.registry().restore(version) {
            Ok(()) => warn!("Rolled registry back to v{}", version),
            Err(e) => error!("Failed to roll registry back to v{}: {}", version, e),
        }
    }

    /// Caller holds the execution lock and has marked the question running
    async fn run_tournament(&self, request: InvestigationRequest) -> Result<SubmitOutcome> {
        let tournament_id = Uuid::new_v4().simple().to_string();
        let started = Instant::now();
        let regime = self.core().regime();
        let size = regime.adjust_candidates(self.config.candidates_per_tournament);
        info!(
            question_id = %request.question_id,
            tournament_id = %tournament_id,
            %regime,
            candidates = size,
            "Tournament started"
        );

        let executor = match self.retry_executor(&request) {
            Ok(executor) => executor,
            Err(e) => return Err(self.abort_with(&request, started.elapsed(), e)),
        };

        let (candidates, skipped) = match self.generate_candidates(&request, size, &tournament_id) {
            Ok(generated) => generated,
            Err(e) => return Err(self.abort_with(&request, started.elapsed(), e)),
        };
        if candidates.is_empty() {
            info!(question_id = %request.question_id, "Search space exhausted");
            self.core()
                .statuses
                .insert(request.question_id.clone(), QuestionStatus::Exhausted);
            self.checkpoint_logged();
            return Ok(SubmitOutcome::Exhausted);
        }

        let input = Arc::new(EvaluationInput {
            candidates: candidates
                .iter()
                .map(|g| g.phenotype().parameters.clone())
                .collect(),
            context: EvaluationContext {
                tournament_id: tournament_id.clone(),
                question_id: request.question_id.clone(),
                hypothesis: request.hypothesis.clone(),
                category: request.category.clone(),
            },
        });

        let evaluated = executor.execute(input).await;
        let runtime = started.elapsed();
        let outcome = match evaluated {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.record_failure(&request, runtime, e)),
        };

        let result = self.conclude(
            &request,
            &tournament_id,
            regime,
            candidates,
            outcome.value,
            runtime,
        );
        match result {
            Ok((mut tournament, record)) => {
                tournament.skipped_duplicates = skipped;
                tournament.retry = outcome.report;
                if let Err(e) = record.append(&self.paths.tournament_log()) {
                    warn!("Failed to append tournament record: {}", e);
                }
                self.checkpoint_logged();
                info!(
                    question_id = %tournament.question_id,
                    champion = %tournament.champion,
                    fitness = tournament.champion_fitness,
                    converged = tournament.converged,
                    elapsed_ms = runtime.as_millis() as u64,
                    "Tournament finished"
                );
                Ok(SubmitOutcome::Completed(tournament))
            }
            Err(e) => Err(self.abort_with(&request, runtime, e)),
        }
    }

    fn retry_executor(
        &self,
        request: &InvestigationRequest,
    ) -> Result<AsyncRetryExecutor<Arc<EvaluationInput>, EvaluationBatch, EvolverError>> {
        let primary = self.evaluators.get(&request.evaluator)?;
        let mut executor = AsyncRetryExecutor::new(self.retry, evaluator_operation(primary));
        for name in &request.fallback_evaluators {
            executor = executor.with_fallback(evaluator_operation(self.evaluators.get(name)?));
        }
        Ok(executor)
    }

    /// Sample `size` genomes not seen before in this niche
    ///
    /// Nothing is registered here; the batch is committed only once it has
    /// been scored.
    fn generate_candidates(
        &self,
        request: &InvestigationRequest,
        size: usize,
        tournament_id: &str,
    ) -> Result<(Vec<CandidateGenome>, usize)> {
        let mut rng = rand::thread_rng();
        let registry = self.registry();
        let mut batch_hashes = HashSet::with_capacity(size);
        let prefix = &tournament_id[..tournament_id.len().min(8)];
        let mut candidates = Vec::with_capacity(size);
        let mut skipped = 0;

        for index in 0..size {
            let mut placed = false;
            for _ in 0..=self.config.max_resample_attempts {
                let params = request.search_space.sample(&mut rng);
                let genome = CandidateGenome::new(
                    format!("{}-{}-{:02}", request.question_id, prefix, index),
                    &request.category,
                    &request.question_id,
                    Phenotype::from_params(params),
                )?;
                if registry.contains_hash(genome.hash()) || !batch_hashes.insert(genome.hash().to_string()) {
                    continue;
                }
                candidates.push(genome);
                placed = true;
                break;
            }
            if !placed {
                skipped += 1;
                debug!(question_id = %request.question_id, index, "No unseen genome found, skipping slot");
            }
        }

        Ok((candidates, skipped))
    }

    fn record_failure(
        &self,
        request: &InvestigationRequest,
        runtime: Duration,
        err: RetryError<EvolverError>,
    ) -> EvolverError {
        let signature = err
            .errors
            .last()
            .map(|(source, failure)| format!("{}: {}", source, failure))
            .unwrap_or_else(|| "unknown".to_string());
        self.abort(request, runtime, signature, EvolverError::Evaluation(err.to_string()))
    }

    /// Score, pick the champion, publish it and update scheduler state
    ///
    /// Durable writes happen in this order: registry (one snapshot-guarded
    /// commit), winner record, synthetic ledger. A failed registry commit
    /// leaves everything untouched; a failed winner write rolls the registry
    /// back.
    fn conclude(
        &self,
        request: &InvestigationRequest,
        tournament_id: &str,
        regime: Regime,
        candidates: Vec<CandidateGenome>,
        batch: EvaluationBatch,
        runtime: Duration,
    ) -> Result<(TournamentOutcome, TournamentRecord)> {
        let now = Utc::now();
        let ts = epoch_seconds(now);

        let observations: Vec<SyntheticObservation> = candidates
            .iter()
            .zip(&batch.fitnesses)
            .map(|(genome, raw)| SyntheticObservation {
                candidate: genome.hash().to_string(),
                composite_phase_fitness: raw.clamp(0.0, 1.0),
                ts,
            })
            .collect();
        let hashes: Vec<&str> = candidates.iter().map(CandidateGenome::hash).collect();
        let fused = self.fusion.fuse_batch(&hashes, now, &observations)?;
        // fresh candidates rank on the raw evaluator score
        let ranking: Vec<f64> = fused
            .iter()
            .zip(&batch.fitnesses)
            .map(|(fusion, raw)| if fusion.has_data() { fusion.score } else { *raw })
            .collect();

        let champion_idx = argmax(&ranking)
            .ok_or_else(|| EvolverError::Evaluation("no candidate was scored".to_string()))?;
        let champion = &candidates[champion_idx];
        let champion_fitness = ranking[champion_idx];
        let winner = WinnerRecord::new(
            &request.question_id,
            &request.hypothesis,
            champion,
            champion_idx,
            &ranking,
            now,
        )
        .ok_or_else(|| EvolverError::Evaluation("champion index out of range".to_string()))?;

        let previous_version = {
            let mut registry = self.registry();
            let version = registry.version();
            registry.commit_tournament(&candidates, &champion.name)?;
            version
        };
        let winner_path = match winner.write(&self.paths.winners_dir()) {
            Ok(path) => path,
            Err(e) => {
                self.rollback_registry(previous_version);
                return Err(e);
            }
        };

        let ledger = self.fusion.ledger();
        for observation in &observations {
            if let Err(e) = ledger.record_synthetic(observation) {
                warn!(
                    question_id = %request.question_id,
                    "Failed to record synthetic fitness for {}: {}",
                    observation.candidate,
                    e
                );
            }
        }

        let converged = {
            let mut core = self.core();
            core.convergence.record(&request.question_id, champion_fitness);
            let converged = core.convergence.is_converged(&request.question_id);
            core.circuit.record_success();
            core.bandit
                .record_trial(&request.category, &TrialOutcome::passed(runtime));
            core.statuses.insert(
                request.question_id.clone(),
                if converged {
                    QuestionStatus::Converged
                } else {
                    QuestionStatus::Completed
                },
            );
            converged
        };

        let record = TournamentRecord {
            tournament_id: tournament_id.to_string(),
            question_id: request.question_id.clone(),
            hypothesis: request.hypothesis.clone(),
            category: request.category.clone(),
            regime,
            candidates: candidates.clone(),
            fitnesses: ranking.clone(),
            fused,
            champion: champion.name.clone(),
            converged,
            timestamp: now,
        };

        let outcome = TournamentOutcome {
            tournament_id: tournament_id.to_string(),
            question_id: request.question_id.clone(),
            champion: champion.name.clone(),
            champion_hash: champion.hash().to_string(),
            champion_fitness,
            fitnesses: ranking,
            regime,
            converged,
            skipped_duplicates: 0,
            winner_path,
            retry: RetryReport::default(),
        };

        Ok((outcome, record))
    }
}

/// Index of the largest value; the first one wins ties
fn argmax(values: &[f64]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, v) in values.iter().enumerate() {
        match best {
            Some(b) if values[b] >= *v => {}
            _ => best = Some(i),
        }
    }
    best
}
