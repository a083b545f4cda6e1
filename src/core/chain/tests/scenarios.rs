use std::time::Duration;

use super::{execution, finish, latest_run, shared};
use crate::core::chain::{ChainRegistry, HopOutcome, TerminalRunHandler};
use crate::core::error::CoreError;
use crate::core::events::EventType;
use crate::core::orchestrator::ExternalState;
use crate::core::run::{JobExecutionStatus, RunStatus};
use crate::core::store::RunStore;
use crate::core::testkit::Fixture;

#[test]
fn registry_lookup() {
    let config = crate::core::config::Config::with_data_dir("/tmp/dagsync-test");
    let registry = ChainRegistry::new(&config.chains);
    assert_eq!(registry.names(), vec!["default".to_string()]);
    assert_eq!(registry.get("default").unwrap().stages.len(), 3);
    assert!(matches!(
        registry.get("missing"),
        Err(CoreError::NotFound { entity: "Chain", .. })
    ));
}

#[tokio::test]
async fn start_triggers_the_first_stage_with_bookkeeping() {
    let fx = Fixture::new();
    let (chain, mut watches) = fx.chain(&["a", "b", "c"]);

    let (exec, run) = chain
        .start_chain("test", shared(), Some("alice".to_string()))
        .await
        .unwrap();
    assert_eq!(exec.status, JobExecutionStatus::Running);
    assert_eq!(run.stage_id, "a");

    let call = &fx.orchestrator.triggers_for("a")[0];
    assert_eq!(call.parameters["dataset"], "ds-1");
    assert_eq!(call.parameters["stage_index"], 0);
    assert_eq!(call.parameters["stage_total"], 3);
    assert_eq!(call.parameters["next_stage"], "b");

    let ctx = run.configuration.chain.clone().unwrap();
    assert_eq!(ctx.job_execution_id, exec.id);
    assert_eq!(ctx.stage_index, 0);
    assert_eq!(run.triggered_by.as_deref(), Some("alice"));

    let request = watches.try_recv().unwrap();
    assert_eq!(request.run_id, run.run_id);
    assert_eq!(request.delay, Duration::ZERO);
}

#[tokio::test]
async fn unknown_chain_is_not_found() {
    let fx = Fixture::new();
    let (chain, _watches) = fx.chain(&["a"]);
    let err = chain.start_chain("nope", shared(), None).await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound { entity: "Chain", .. }));
    assert!(fx.orchestrator.triggers().is_empty());
}

#[tokio::test]
async fn success_advances_once_and_failure_halts() {
    let fx = Fixture::new();
    let (chain, mut watches) = fx.chain(&["a", "b", "c"]);
    let (exec, run_a) = chain.start_chain("test", shared(), None).await.unwrap();
    watches.try_recv().unwrap();

    finish(&fx, &run_a, ExternalState::Success).await;
    // the next stage waits for the durable hop
    assert!(fx.orchestrator.triggers_for("b").is_empty());
    assert_eq!(fx.store.list_pending_hops().await.unwrap().len(), 1);

    assert_eq!(chain.process_due_hops().await.unwrap(), 1);
    let b_calls = fx.orchestrator.triggers_for("b");
    assert_eq!(b_calls.len(), 1);
    assert_eq!(b_calls[0].parameters["stage_index"], 1);
    assert_eq!(b_calls[0].parameters["next_stage"], "c");
    assert_eq!(execution(&fx, &exec.id).await.current_index, 1);

    let request = watches.try_recv().unwrap();
    assert_eq!(request.run_id, b_calls[0].run_id);
    assert_eq!(request.delay, Duration::from_secs(30));

    // nothing left to claim
    assert_eq!(chain.process_due_hops().await.unwrap(), 0);

    let run_b = latest_run(&fx, "b").await;
    assert_eq!(
        run_b.configuration.note.as_deref(),
        Some("Chain 2/3: b - auto-triggered from previous stage completion")
    );
    finish(&fx, &run_b, ExternalState::Failed).await;
    chain.process_due_hops().await.unwrap();

    assert!(fx.orchestrator.triggers_for("c").is_empty());
    let exec = execution(&fx, &exec.id).await;
    assert_eq!(exec.status, JobExecutionStatus::Failed);
    assert!(exec.error.unwrap().contains("stage b ended failed"));
    assert_eq!(fx.count(EventType::ChainFailed), 1);
    assert_eq!(fx.count(EventType::ChainCompleted), 0);
}

#[tokio::test]
async fn last_stage_success_completes_the_execution() {
    let fx = Fixture::new();
    let (chain, _watches) = fx.chain(&["a", "b"]);
    let (exec, run_a) = chain.start_chain("test", shared(), None).await.unwrap();

    finish(&fx, &run_a, ExternalState::Success).await;
    chain.process_due_hops().await.unwrap();
    let run_b = latest_run(&fx, "b").await;
    assert_eq!(fx.orchestrator.triggers_for("b")[0].parameters["next_stage"], serde_json::Value::Null);

    finish(&fx, &run_b, ExternalState::Success).await;
    let exec = execution(&fx, &exec.id).await;
    assert_eq!(exec.status, JobExecutionStatus::Completed);
    assert_eq!(exec.current_index, 1);
    assert_eq!(fx.count(EventType::ChainCompleted), 1);

    let completed = fx
        .global_events()
        .into_iter()
        .find(|e| e.event_type == EventType::ChainCompleted)
        .unwrap();
    assert_eq!(completed.job_id, exec.id);
    assert_eq!(completed.payload["last_run_id"], run_b.run_id.as_str());
}

#[tokio::test]
async fn duplicate_terminal_notifications_queue_one_hop() {
    let fx = Fixture::new();
    let (chain, _watches) = fx.chain(&["a", "b"]);
    let (_, run_a) = chain.start_chain("test", shared(), None).await.unwrap();
    let done = finish(&fx, &run_a, ExternalState::Success).await;

    chain.on_run_terminal(&done).await.unwrap();
    chain.on_run_terminal(&done).await.unwrap();
    assert_eq!(fx.store.list_pending_hops().await.unwrap().len(), 1);

    chain.process_due_hops().await.unwrap();
    assert_eq!(fx.orchestrator.triggers_for("b").len(), 1);
}

#[tokio::test]
async fn hop_trigger_failure_fails_the_execution() {
    let fx = Fixture::new();
    let (chain, _watches) = fx.chain(&["a", "b"]);
    let (exec, run_a) = chain.start_chain("test", shared(), None).await.unwrap();
    finish(&fx, &run_a, ExternalState::Success).await;

    fx.orchestrator.set_fail_trigger(true);
    assert_eq!(chain.process_due_hops().await.unwrap(), 1);

    let exec = execution(&fx, &exec.id).await;
    assert_eq!(exec.status, JobExecutionStatus::Failed);
    assert!(exec.error.unwrap().contains("failed to trigger b"));
    assert_eq!(fx.count(EventType::ChainFailed), 1);
    // the hop is finished, not retried forever
    assert!(fx.store.list_pending_hops().await.unwrap().is_empty());
}

#[tokio::test]
async fn stopping_a_chained_run_halts_the_chain() {
    let fx = Fixture::new();
    let (chain, _watches) = fx.chain(&["a", "b"]);
    let (exec, run_a) = chain.start_chain("test", shared(), None).await.unwrap();

    fx.commands.stop_run(&run_a.job_id, &run_a.run_id).await.unwrap();
    assert_eq!(execution(&fx, &exec.id).await.status, JobExecutionStatus::Failed);
    assert!(fx.store.list_pending_hops().await.unwrap().is_empty());
}

#[tokio::test]
async fn skipped_stage_halts_as_failed() {
    let fx = Fixture::new();
    let (chain, _watches) = fx.chain(&["a", "b"]);
    let (exec, run_a) = chain.start_chain("test", shared(), None).await.unwrap();
    let done = finish(&fx, &run_a, ExternalState::Skipped).await;
    assert_eq!(done.status, RunStatus::Skipped);
    assert_eq!(execution(&fx, &exec.id).await.status, JobExecutionStatus::Failed);
}

#[tokio::test]
async fn resume_continues_from_a_successful_run() {
    let fx = Fixture::new();
    let (chain, _watches) = fx.chain(&["a", "b", "c"]);
    let (exec, run_a) = chain.start_chain("test", shared(), None).await.unwrap();
    finish(&fx, &run_a, ExternalState::Success).await;

    assert!(matches!(
        chain.resume_hop("a", &run_a.run_id, "c", 1).await,
        Err(CoreError::Validation { .. })
    ));
    assert!(matches!(
        chain.resume_hop("b", &run_a.run_id, "b", 1).await,
        Err(CoreError::Validation { .. })
    ));

    let outcome = chain.resume_hop("a", &run_a.run_id, "b", 1).await.unwrap();
    let HopOutcome::Advanced(run_b) = outcome else {
        panic!("expected the chain to advance, got {:?}", outcome);
    };
    assert_eq!(run_b.stage_id, "b");
    assert_eq!(execution(&fx, &exec.id).await.current_index, 1);

    // the queued hop for the same step is already done
    chain.process_due_hops().await.unwrap();
    assert_eq!(fx.orchestrator.triggers_for("b").len(), 1);

    // resuming again is a no-op
    let again = chain.resume_hop("a", &run_a.run_id, "b", 1).await.unwrap();
    assert!(matches!(again, HopOutcome::Skipped(_)));
    assert_eq!(fx.orchestrator.triggers_for("b").len(), 1);
}

#[tokio::test]
async fn resume_rejects_unfinished_runs() {
    let fx = Fixture::new();
    let (chain, _watches) = fx.chain(&["a", "b"]);
    let (_, run_a) = chain.start_chain("test", shared(), None).await.unwrap();
    let err = chain.resume_hop("a", &run_a.run_id, "b", 1).await.unwrap_err();
    assert!(matches!(err, CoreError::Validation { .. }));
    assert!(fx.orchestrator.triggers_for("b").is_empty());
}

#[tokio::test]
async fn plain_runs_are_ignored() {
    let fx = Fixture::new();
    let (chain, _watches) = fx.chain(&["a", "b"]);
    let run = fx
        .commands
        .trigger_run(crate::core::commands::TriggerRunCommand::new("a"))
        .await
        .unwrap();
    finish(&fx, &run, ExternalState::Success).await;
    assert_eq!(chain.process_due_hops().await.unwrap(), 0);
    assert!(fx.orchestrator.triggers_for("b").is_empty());
}

#[tokio::test]
async fn recovery_replays_a_lost_hand_off() {
    let fx = Fixture::new();
    let (chain, _watches) = fx.chain(&["a", "b", "c"]);
    let (exec, run_a) = chain.start_chain("test", shared(), None).await.unwrap();

    // success stored, but the process died before the hop was queued
    let mut done = fx.run(&run_a.run_id).await;
    done.status = RunStatus::Success;
    done.end_date = Some(chrono::Utc::now());
    fx.store.save_run(&done).await.unwrap();
    assert_eq!(chain.process_due_hops().await.unwrap(), 0);

    assert_eq!(chain.recover_stalled_executions().await.unwrap(), 1);
    assert_eq!(chain.process_due_hops().await.unwrap(), 1);
    assert_eq!(fx.orchestrator.triggers_for("b").len(), 1);
    assert_eq!(execution(&fx, &exec.id).await.current_index, 1);

    // stage b is still running, so a second pass has nothing to replay
    assert_eq!(chain.recover_stalled_executions().await.unwrap(), 0);
    chain.process_due_hops().await.unwrap();
    assert_eq!(fx.orchestrator.triggers_for("b").len(), 1);
}

#[tokio::test]
async fn recovery_finishes_executions_whose_last_stage_ended() {
    let fx = Fixture::new();
    let (chain, _watches) = fx.chain(&["a"]);
    let (exec, run_a) = chain.start_chain("test", shared(), None).await.unwrap();

    let mut done = fx.run(&run_a.run_id).await;
    done.status = RunStatus::Failed;
    done.end_date = Some(chrono::Utc::now());
    fx.store.save_run(&done).await.unwrap();

    chain.recover_stalled_executions().await.unwrap();
    assert_eq!(execution(&fx, &exec.id).await.status, JobExecutionStatus::Failed);
    assert_eq!(chain.recover_stalled_executions().await.unwrap(), 0);
}
