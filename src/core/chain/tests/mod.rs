mod scenarios;

use serde_json::json;

use crate::core::orchestrator::ExternalState;
use crate::core::run::{JobExecution, WorkflowRun};
use crate::core::store::RunStore;
use crate::core::testkit::Fixture;

pub(super) async fn execution(fx: &Fixture, id: &str) -> JobExecution {
    fx.store.load_job_execution(id).await.unwrap().unwrap()
}

/// Drive `run` to `state` through the synchronous status read.
pub(super) async fn finish(fx: &Fixture, run: &WorkflowRun, state: ExternalState) -> WorkflowRun {
    fx.orchestrator.push_query_state(&run.run_id, state);
    fx.commands
        .get_run_status(&run.job_id, &run.run_id)
        .await
        .unwrap()
}

/// The most recent run triggered for `stage`.
pub(super) async fn latest_run(fx: &Fixture, stage: &str) -> WorkflowRun {
    let call = fx.orchestrator.triggers_for(stage).pop().unwrap();
    fx.run(&call.run_id).await
}

pub(super) fn shared() -> serde_json::Value {
    json!({"dataset": "ds-1"})
}
