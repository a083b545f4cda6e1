mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::core::error::{CoreError, CoreResult};
use crate::core::run::{
    ChainHop, Job, JobExecution, JobExecutionStatus, RunStatus, Transition, WorkflowRun,
};

pub use sqlite::SqliteStore;

/// Persistence collaborator. Each call is its own transaction; nothing here
/// spans runs and jobs.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn load_run(&self, run_id: &str) -> CoreResult<Option<WorkflowRun>>;

    async fn insert_run(&self, run: &WorkflowRun) -> CoreResult<()>;

    /// Compare-and-swap on `run.version`. Returns the stored row with its
    /// bumped version, or `Conflict` when someone else saved first.
    async fn save_run(&self, run: &WorkflowRun) -> CoreResult<WorkflowRun>;

    async fn list_runs_by_status(&self, statuses: &[RunStatus]) -> CoreResult<Vec<WorkflowRun>>;

    /// Runs triggered on behalf of a job execution, oldest first.
    async fn list_runs_for_execution(&self, execution_id: &str) -> CoreResult<Vec<WorkflowRun>>;

    /// Terminal runs whose `end_date` is older than `cutoff`.
    async fn list_terminal_runs_before(&self, cutoff: DateTime<Utc>) -> CoreResult<Vec<WorkflowRun>>;

    async fn load_job(&self, job_id: &str) -> CoreResult<Option<Job>>;

    async fn load_job_by_stage_id(&self, stage_id: &str) -> CoreResult<Option<Job>>;

    /// Insert unless a job for the same stage exists; returns the stored row.
    async fn create_job(&self, job: &Job) -> CoreResult<Job>;

    async fn context_exists(&self, kind: &str, id: &str) -> CoreResult<bool>;

    async fn register_context(&self, kind: &str, id: &str) -> CoreResult<()>;

    async fn create_job_execution(&self, execution: &JobExecution) -> CoreResult<()>;

    async fn load_job_execution(&self, id: &str) -> CoreResult<Option<JobExecution>>;

    async fn list_running_job_executions(&self) -> CoreResult<Vec<JobExecution>>;

    /// Only moves a `running` execution; returns false if it was already
    /// finished or does not exist.
    async fn set_job_execution_status(
        &self,
        id: &str,
        status: JobExecutionStatus,
        current_index: Option<usize>,
        error: Option<&str>,
    ) -> CoreResult<bool>;

    /// A hop whose id is already queued is ignored.
    async fn enqueue_hop(&self, hop: &ChainHop) -> CoreResult<()>;

    /// Lease up to `limit` due hops for `lease`. A crashed claimer's hops
    /// become due again once the lease lapses.
    async fn claim_due_hops(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> CoreResult<Vec<ChainHop>>;

    async fn complete_hop(&self, hop_id: &str) -> CoreResult<()>;

    async fn release_hop(&self, hop_id: &str, retry_at: DateTime<Utc>) -> CoreResult<()>;

    async fn list_pending_hops(&self) -> CoreResult<Vec<ChainHop>>;
}

const MAX_CAS_ATTEMPTS: usize = 5;

/// Load the current row, apply `f`, and compare-and-swap the result.
///
/// A conflicting writer causes a reload and a fresh `f`, so the returned
/// transition always describes what is actually stored. Unchanged results
/// are never written.
pub async fn commit_transition<F>(
    store: &dyn RunStore,
    run_id: &str,
    mut f: F,
) -> CoreResult<Transition>
where
    F: FnMut(&WorkflowRun) -> Transition + Send,
{
    for attempt in 1..=MAX_CAS_ATTEMPTS {
        let current = store
            .load_run(run_id)
            .await?
            .ok_or_else(|| CoreError::not_found("WorkflowRun", run_id))?;
        let transition = f(&current);
        if !transition.changed {
            return Ok(Transition {
                run: current,
                previous: transition.previous,
                changed: false,
            });
        }
        match store.save_run(&transition.run).await {
            Ok(saved) => {
                return Ok(Transition {
                    run: saved,
                    previous: transition.previous,
                    changed: true,
                });
            }
            Err(CoreError::Conflict { .. }) => {
                debug!("Run {} changed underneath us (attempt {})", run_id, attempt);
            }
            Err(e) => return Err(e),
        }
    }
    Err(CoreError::Conflict {
        run_id: run_id.to_string(),
    })
}
