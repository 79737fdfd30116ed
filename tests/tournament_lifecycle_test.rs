//! End-to-end tournament lifecycle through the public API

mod common;

use common::{evaluators, open, swappiness_space, test_config, FlakyEvaluator};
use evolver_core::daemon::Services;
use evolver_core::genome::LifecycleState;
use evolver_core::tournament::record::{TournamentRecord, WinnerRecord};
use evolver_core::tournament::state::QuestionStatus;
use evolver_core::tournament::{DeferReason, InvestigationRequest, SubmitOutcome};
use evolver_core::EvolverError;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::TempDir;

fn request(id: &str, evaluator: &str) -> InvestigationRequest {
    InvestigationRequest::new(id, "swappiness near 30", swappiness_space(), evaluator).with_category("vm")
}

#[tokio::test]
async fn test_tournament_publishes_champion() {
    let temp = TempDir::new().unwrap();
    let services = open(test_config(temp.path()));

    let outcome = services.executor.submit(request("q1", "peak")).await.unwrap();
    let SubmitOutcome::Completed(t) = outcome else {
        panic!("expected completion, got {:?}", outcome);
    };

    let winner = WinnerRecord::read(&services.config.paths.winners_dir(), "q1")
        .unwrap()
        .unwrap();
    assert_eq!(winner.best.spica_id, t.champion);
    assert_eq!(winner.tournament_summary.total_candidates, t.fitnesses.len());
    let max = t.fitnesses.iter().copied().fold(f64::MIN, f64::max);
    assert_eq!(winner.best.fitness, max);

    let registry = services.registry.lock().unwrap();
    let champion = registry.get(&t.champion).unwrap();
    assert_eq!(champion.state(), LifecycleState::Differentiated);
    assert_eq!(champion.ecosystem, "vm");
    assert_eq!(champion.niche, "q1");
    drop(registry);

    // every candidate's evaluator score lands in the synthetic ledger
    let fused = services
        .fusion
        .fuse(&t.champion_hash, chrono::Utc::now())
        .unwrap();
    assert_eq!(fused.sample_count_synthetic, 1);

    let log = std::fs::read_to_string(services.config.paths.tournament_log()).unwrap();
    let record: TournamentRecord = serde_json::from_str(log.lines().next().unwrap()).unwrap();
    assert_eq!(record.champion, t.champion);
    assert_eq!(record.fused.len(), record.candidates.len());
}

#[tokio::test]
async fn test_failures_open_circuit_and_defer() {
    let temp = TempDir::new().unwrap();
    let flaky = Arc::new(FlakyEvaluator::default());
    let services = Services::open_with(test_config(temp.path()), evaluators(Arc::clone(&flaky))).unwrap();

    for i in 0..3 {
        let result = services.executor.submit(request(&format!("f{}", i), "flaky")).await;
        assert!(matches!(result, Err(EvolverError::Evaluation(_))));
    }
    // one retry per tournament
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 6);
    assert!(services.executor.is_circuit_open());

    let deferred = services.executor.submit(request("q1", "peak")).await.unwrap();
    assert!(matches!(
        deferred,
        SubmitOutcome::Queued {
            reason: DeferReason::CircuitOpen { .. },
            ..
        }
    ));
    assert_eq!(services.executor.status("q1"), QuestionStatus::Queued);

    let report = services.executor.status_report();
    assert!(report.circuit_open);
    assert_eq!(report.queue, vec!["q1".to_string()]);
    assert_eq!(report.questions["f2"].status, QuestionStatus::Failed);

    services.executor.reset_circuit().unwrap();
    let drained = services.executor.drain_once().await.unwrap();
    assert!(matches!(drained, Some(SubmitOutcome::Completed(_))));
}

#[tokio::test]
async fn test_queue_overflow_evicts_oldest() {
    let temp = TempDir::new().unwrap();
    let mut config = test_config(temp.path());
    config.tournament.queue_capacity = 2;
    config.tournament.min_interval = std::time::Duration::from_secs(3600);
    let services = open(config);

    assert!(matches!(
        services.executor.submit(request("q0", "peak")).await.unwrap(),
        SubmitOutcome::Completed(_)
    ));
    for id in ["q1", "q2"] {
        services.executor.submit(request(id, "peak")).await.unwrap();
    }
    let outcome = services.executor.submit(request("q3", "peak")).await.unwrap();
    match outcome {
        SubmitOutcome::Queued { evicted, position, .. } => {
            assert_eq!(evicted.as_deref(), Some("q1"));
            assert_eq!(position, 1);
        }
        other => panic!("expected eviction, got {:?}", other),
    }
    assert_eq!(services.executor.status("q1"), QuestionStatus::Idle);
    assert_eq!(services.executor.queue_len(), 2);
}
