//! Evolver - Evolutionary Tuning Scheduler
//!
//! Decides which configuration candidate to test next, runs tournaments
//! between candidates safely under failure, fuses fitness signals from
//! production and synthetic ledgers into one score, and gates promotion of
//! winners into the live registry.
//!
//! # Architecture
//!
//! - **Primitives**: `retry` (bounded retries + fallback chain), `persist`
//!   (atomic JSON writes)
//! - **Data**: `genome`, `registry` (versioned candidate registry), `ledger`
//! - **Scoring**: `fitness` (fusion engine), `bandit` (UCB1 category weights
//!   and regime)
//! - **Execution**: `tournament` (single-lane executor with rate limit,
//!   circuit breaker, deferred queue and convergence detection)
//! - **Promotion**: `promotion` (statistical + safety gate, evidence records)
//! - **Service**: `daemon` (drain poller, investigation timer, shutdown)
//!
//! # Example
//!
//! ```ignore
//! use evolver_core::{daemon::Services, tournament::InvestigationRequest, EvolverConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EvolverConfig::load(Some("evolver.toml".as_ref()))?;
//!     let services = Services::open(config)?;
//!
//!     let request = InvestigationRequest::new("vm-swappiness", "lower is better", space, "bench");
//!     let outcome = services.executor.submit(request).await?;
//!     println!("{:?}", outcome);
//!     Ok(())
//! }
//! ```

pub mod bandit;
pub mod config;
pub mod daemon;
pub mod error;
pub mod fitness;
pub mod genome;
pub mod ledger;
pub mod persist;
pub mod promotion;
pub mod registry;
pub mod retry;
pub mod tournament;

// Re-export commonly used types
pub use bandit::{BanditScheduler, CategoryStats, Regime};
pub use config::EvolverConfig;
pub use error::{EvolverError, Result};
pub use fitness::{FitnessFusionEngine, FusedFitness};
pub use genome::{CandidateGenome, LifecycleState, Phenotype};
pub use ledger::{FitnessLedger, JsonlLedger, MemoryLedger};
pub use promotion::{PromotionGate, PromotionOutcome};
pub use registry::CandidateRegistry;
pub use retry::{AsyncRetryExecutor, RetryExecutor, RetryPolicy};
pub use tournament::{InvestigationRequest, SubmitOutcome, TournamentExecutor};
