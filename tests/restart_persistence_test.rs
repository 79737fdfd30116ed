//! Scheduler state survives a restart

mod common;

use common::{open, swappiness_space, test_config};
use evolver_core::tournament::state::{QuestionStatus, SchedulerState};
use evolver_core::tournament::{InvestigationRequest, SubmitOutcome};
use std::time::Duration;
use tempfile::TempDir;

fn request(id: &str) -> InvestigationRequest {
    InvestigationRequest::new(id, "h", swappiness_space(), "peak").with_category("vm")
}

#[tokio::test]
async fn test_restart_resumes_queue_and_history() {
    let temp = TempDir::new().unwrap();
    let mut config = test_config(temp.path());
    config.tournament.min_interval = Duration::from_secs(3600);

    let first_champion = {
        let services = open(config.clone());
        let SubmitOutcome::Completed(t) = services.executor.submit(request("q1")).await.unwrap() else {
            panic!("first tournament should run");
        };
        let deferred = services.executor.submit(request("q2")).await.unwrap();
        assert!(matches!(deferred, SubmitOutcome::Queued { .. }));
        services.executor.shutdown().await.unwrap();
        t.champion
    };

    // still inside the rate-limit window after restart
    let services = open(config.clone());
    assert_eq!(services.executor.queue_len(), 1);
    assert_eq!(services.executor.status("q2"), QuestionStatus::Queued);
    assert_eq!(services.executor.status("q1"), QuestionStatus::Completed);
    assert!(services.executor.drain_once().await.unwrap().is_none());
    assert!(services.registry.lock().unwrap().get(&first_champion).is_some());

    let state = services.executor.snapshot_state();
    assert_eq!(state.bandit["vm"].trials, 1);
    assert_eq!(state.convergence["q1"].len(), 1);
    drop(services);

    // lifting the rate limit lets the restored request run
    config.tournament.min_interval = Duration::ZERO;
    let services = open(config);
    let drained = services.executor.drain_once().await.unwrap();
    assert!(matches!(drained, Some(SubmitOutcome::Completed(ref t)) if t.question_id == "q2"));
    assert_eq!(services.executor.queue_len(), 0);
}

#[tokio::test]
async fn test_interrupted_question_is_requeued_or_idled() {
    let temp = TempDir::new().unwrap();
    let config = test_config(temp.path());

    let mut state = SchedulerState::default();
    state.queue.push(request("q1"));
    state.statuses.insert("q1".to_string(), QuestionStatus::Running);
    state.statuses.insert("q2".to_string(), QuestionStatus::Running);
    state.save(&config.paths.state_file()).unwrap();

    let services = open(config);
    assert_eq!(services.executor.status("q1"), QuestionStatus::Queued);
    assert_eq!(services.executor.status("q2"), QuestionStatus::Idle);
}

#[tokio::test]
async fn test_corrupt_state_starts_fresh() {
    let temp = TempDir::new().unwrap();
    let config = test_config(temp.path());
    std::fs::create_dir_all(&config.paths.data_dir).unwrap();
    std::fs::write(config.paths.state_file(), "{\"queue\": [").unwrap();

    let services = open(config);
    assert_eq!(services.executor.queue_len(), 0);
    assert!(matches!(
        services.executor.submit(request("q1")).await.unwrap(),
        SubmitOutcome::Completed(_)
    ));
}
