//! Synchronous command handlers: the public API a presentation layer calls.

use std::sync::{Arc, OnceLock, Weak};

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::core::chain::TerminalRunHandler;
use crate::core::error::{CoreError, CoreResult};
use crate::core::events::{CachedStatus, Event, EventPublisher, EventType};
use crate::core::orchestrator::OrchestratorClient;
use crate::core::run::{
    self, ChainContext, Job, RunConfiguration, RunStatus, Transition, TriggerType, WorkflowRun,
};
use crate::core::store::{RunStore, commit_transition};

pub const TASK_CONTEXT: &str = "task";
pub const DATASET_CONTEXT: &str = "dataset";

const MAX_STAGE_ID_LEN: usize = 250;

#[derive(Debug, Clone)]
pub struct TriggerRunCommand {
    /// Existing job to trigger under; resolved from `stage_id` when absent.
    pub job_id: Option<String>,
    pub stage_id: String,
    pub parameters: serde_json::Value,
    pub principal: Option<String>,
    pub parent_task_id: Option<String>,
    pub dataset_id: Option<String>,
    pub trigger_type: TriggerType,
    pub note: Option<String>,
    pub chain: Option<ChainContext>,
}

impl TriggerRunCommand {
    pub fn new(stage_id: impl Into<String>) -> Self {
        Self {
            job_id: None,
            stage_id: stage_id.into(),
            parameters: json!({}),
            principal: None,
            parent_task_id: None,
            dataset_id: None,
            trigger_type: TriggerType::Manual,
            note: None,
            chain: None,
        }
    }
}

pub fn validate_stage_id(stage_id: &str) -> CoreResult<()> {
    if stage_id.is_empty() {
        return Err(CoreError::validation("stage_id", "must not be empty"));
    }
    if stage_id.len() > MAX_STAGE_ID_LEN {
        return Err(CoreError::validation(
            "stage_id",
            format!("longer than {} characters", MAX_STAGE_ID_LEN),
        ));
    }
    if let Some(bad) = stage_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
    {
        return Err(CoreError::validation(
            "stage_id",
            format!("invalid character {:?}", bad),
        ));
    }
    Ok(())
}

/// `null` becomes `{}`; anything but an object is rejected.
pub fn normalize_parameters(parameters: serde_json::Value) -> CoreResult<serde_json::Value> {
    match parameters {
        serde_json::Value::Null => Ok(json!({})),
        serde_json::Value::Object(_) => Ok(parameters),
        other => Err(CoreError::validation(
            "parameters",
            format!("expected a JSON object, got {}", other),
        )),
    }
}

/// `data_processing_pipeline` -> `Data Processing Pipeline`
pub fn display_name(stage_id: &str) -> String {
    stage_id
        .split(|c: char| c == '_' || c == '-' || c == '.')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn generate_run_id(stage_id: &str) -> String {
    let short = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "dagsync__{}__{}__{}",
        stage_id,
        Utc::now().format("%Y%m%dT%H%M%S"),
        &short[..8]
    )
}

pub struct RunCommands {
    client: Arc<dyn OrchestratorClient>,
    store: Arc<dyn RunStore>,
    publisher: Arc<EventPublisher>,
    terminal: OnceLock<Weak<dyn TerminalRunHandler>>,
}

impl RunCommands {
    pub fn new(
        client: Arc<dyn OrchestratorClient>,
        store: Arc<dyn RunStore>,
        publisher: Arc<EventPublisher>,
    ) -> Self {
        Self {
            client,
            store,
            publisher,
            terminal: OnceLock::new(),
        }
    }

    /// Wire the handler told about runs these commands make terminal.
    pub fn attach_terminal_handler(&self, handler: Weak<dyn TerminalRunHandler>) {
        if self.terminal.set(handler).is_err() {
            warn!("Terminal run handler already attached; ignoring");
        }
    }

    async fn notify_terminal(&self, run: &WorkflowRun) {
        let Some(handler) = self.terminal.get().and_then(Weak::upgrade) else {
            return;
        };
        if let Err(e) = handler.on_run_terminal(run).await {
            warn!("Terminal hand-off for run {} failed: {}", run.run_id, e);
        }
    }

    pub async fn resolve_job(&self, stage_id: &str, principal: Option<&str>) -> CoreResult<Job> {
        validate_stage_id(stage_id)?;
        if let Some(job) = self.store.load_job_by_stage_id(stage_id).await? {
            return Ok(job);
        }
        let job = Job {
            job_id: uuid::Uuid::new_v4().to_string(),
            stage_id: stage_id.to_string(),
            name: display_name(stage_id),
            description: format!("Auto-created workflow for {}", stage_id),
            created_by: principal.map(str::to_string),
            created_at: Utc::now(),
        };
        let stored = self.store.create_job(&job).await?;
        if stored.job_id == job.job_id {
            info!("Created job {} for stage {}", stored.job_id, stage_id);
        }
        Ok(stored)
    }

    async fn load_owned_run(&self, job_id: &str, run_id: &str) -> CoreResult<WorkflowRun> {
        match self.store.load_run(run_id).await? {
            Some(run) if run.job_id == job_id => Ok(run),
            _ => Err(CoreError::not_found("WorkflowRun", run_id)),
        }
    }

    async fn publish_run(&self, event_type: EventType, run: &WorkflowRun) -> CoreResult<()> {
        self.publisher.publish(&Event::for_run(event_type, run)).await
    }

    pub async fn trigger_run(&self, cmd: TriggerRunCommand) -> CoreResult<WorkflowRun> {
        let (run, published) = self.launch_run(cmd).await?;
        published?;
        Ok(run)
    }

    /// Trigger and record a run, handing back the publish outcome separately
    /// so callers that must not lose the stored run can decide what to do.
    pub(crate) async fn launch_run(
        &self,
        cmd: TriggerRunCommand,
    ) -> CoreResult<(WorkflowRun, CoreResult<()>)> {
        validate_stage_id(&cmd.stage_id)?;
        let parameters = normalize_parameters(cmd.parameters)?;

        let job = match &cmd.job_id {
            Some(job_id) => {
                let job = self
                    .store
                    .load_job(job_id)
                    .await?
                    .ok_or_else(|| CoreError::not_found("Job", job_id))?;
                if job.stage_id != cmd.stage_id {
                    return Err(CoreError::validation(
                        "stage_id",
                        format!("job {} runs stage {}, not {}", job_id, job.stage_id, cmd.stage_id),
                    ));
                }
                job
            }
            None => self.resolve_job(&cmd.stage_id, cmd.principal.as_deref()).await?,
        };

        if let Some(task_id) = &cmd.parent_task_id {
            if !self.store.context_exists(TASK_CONTEXT, task_id).await? {
                return Err(CoreError::not_found("Task", task_id));
            }
        }
        if let Some(dataset_id) = &cmd.dataset_id {
            if !self.store.context_exists(DATASET_CONTEXT, dataset_id).await? {
                return Err(CoreError::not_found("Dataset", dataset_id));
            }
        }

        let run_id = generate_run_id(&cmd.stage_id);
        let handle = self
            .client
            .trigger(&cmd.stage_id, &run_id, &parameters)
            .await?;

        let now = Utc::now();
        let run = WorkflowRun {
            run_id: run_id.clone(),
            job_id: job.job_id.clone(),
            stage_id: cmd.stage_id.clone(),
            status: RunStatus::Queued,
            configuration: RunConfiguration {
                parameters,
                parent_task_id: cmd.parent_task_id,
                dataset_id: cmd.dataset_id,
                note: cmd.note,
                chain: cmd.chain,
            },
            trigger_type: cmd.trigger_type,
            triggered_by: cmd.principal,
            external_trigger_id: handle.run_id,
            execution_date: handle.execution_date.unwrap_or(now),
            start_date: None,
            end_date: None,
            created_at: now,
            updated_at: now,
            version: 1,
        };
        self.store.insert_run(&run).await?;
        info!("Triggered run {} for stage {}", run.run_id, run.stage_id);

        let published = self.publish_run(EventType::WorkflowTriggered, &run).await;
        Ok((run, published))
    }

    /// Best-effort external cancel, then an authoritative local `Failed`.
    pub async fn stop_run(&self, job_id: &str, run_id: &str) -> CoreResult<WorkflowRun> {
        let run = self.load_owned_run(job_id, run_id).await?;
        if let Err(e) = self
            .client
            .cancel(&run.stage_id, &run.external_trigger_id)
            .await
        {
            warn!(
                "Cancel of run {} was not acknowledged, forcing local failure anyway: {}",
                run_id, e
            );
        }

        let now = Utc::now();
        let committed = commit_transition(self.store.as_ref(), run_id, |current| {
            run::stop(current, now)
        })
        .await?;
        // every accepted stop is announced; only the first one hands off
        let published = self
            .publish_run(EventType::WorkflowStopped, &committed.run)
            .await;
        if committed.changed {
            info!("Stopped run {} (was {})", run_id, committed.previous);
            self.notify_terminal(&committed.run).await;
        }
        published?;
        Ok(committed.run)
    }

    /// External reset first; local state is only touched once it succeeds.
    pub async fn retry_run(&self, job_id: &str, run_id: &str) -> CoreResult<WorkflowRun> {
        let run = self.load_owned_run(job_id, run_id).await?;
        self.client
            .reset(&run.stage_id, &run.external_trigger_id)
            .await?;

        let now = Utc::now();
        let committed = commit_transition(self.store.as_ref(), run_id, |current| {
            run::retry(current, now)
        })
        .await?;
        if committed.changed {
            info!("Retrying run {} (was {})", run_id, committed.previous);
            self.publish_run(EventType::WorkflowRetried, &committed.run)
                .await?;
        }
        Ok(committed.run)
    }

    /// Stored status, refreshed from the orchestrator when it may be stale.
    /// Publishes only when the stored status actually changes.
    pub async fn get_run_status(&self, job_id: &str, run_id: &str) -> CoreResult<WorkflowRun> {
        let run = self.load_owned_run(job_id, run_id).await?;
        if run.status.is_terminal() {
            return Ok(run);
        }

        let observed = match self
            .client
            .query(&run.stage_id, &run.external_trigger_id)
            .await
        {
            Ok(observed) => observed,
            Err(e) if e.is_external() => {
                warn!("Serving stored status for run {}: {}", run_id, e);
                return Ok(run);
            }
            Err(e) => return Err(e),
        };

        let now = Utc::now();
        let committed: Transition = commit_transition(self.store.as_ref(), run_id, |current| {
            run::apply_observed_state(current, &observed, now)
        })
        .await?;

        if let Some(event_type) = committed.event_type() {
            let published = self.publish_run(event_type, &committed.run).await;
            if committed.run.status.is_terminal() {
                self.notify_terminal(&committed.run).await;
            }
            published?;
        }
        Ok(committed.run)
    }

    pub fn cached_status(&self, job_id: &str, run_id: &str) -> Option<CachedStatus> {
        self.publisher.cache().get(job_id, run_id)
    }
}
