use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{ChainRegistry, TerminalRunHandler};
use crate::core::commands::{RunCommands, TriggerRunCommand, normalize_parameters};
use crate::core::error::{CoreError, CoreResult};
use crate::core::events::{Event, EventPublisher, EventType};
use crate::core::reconcile::WatchRequest;
use crate::core::run::{
    ChainContext, ChainHop, JobExecution, JobExecutionStatus, RunStatus, TriggerType, WorkflowRun,
};
use crate::core::store::RunStore;

const HOP_CLAIM_LIMIT: usize = 32;
const HOP_LEASE: Duration = Duration::from_secs(120);
const HOP_RETRY_DELAY_SECS: i64 = 30;

#[derive(Debug, Clone, PartialEq)]
pub enum HopOutcome {
    /// The next stage was triggered.
    Advanced(Box<WorkflowRun>),
    /// Nothing left to do: the execution moved on or already finished.
    Skipped(String),
    /// The trigger failed and the execution was marked failed.
    Halted(String),
}

/// Walks job executions through their stage lists. Each hop between stages
/// is a durable row, so a crash between stages loses at most a watch.
pub struct ChainController {
    store: Arc<dyn RunStore>,
    publisher: Arc<EventPublisher>,
    commands: Arc<RunCommands>,
    registry: ChainRegistry,
    watch_tx: mpsc::UnboundedSender<WatchRequest>,
    hop_start_delay: Duration,
}

impl ChainController {
    pub fn new(
        store: Arc<dyn RunStore>,
        publisher: Arc<EventPublisher>,
        commands: Arc<RunCommands>,
        registry: ChainRegistry,
        watch_tx: mpsc::UnboundedSender<WatchRequest>,
        hop_start_delay: Duration,
    ) -> Self {
        Self {
            store,
            publisher,
            commands,
            registry,
            watch_tx,
            hop_start_delay,
        }
    }

    pub fn registry(&self) -> &ChainRegistry {
        &self.registry
    }

    pub async fn start_chain(
        &self,
        chain_name: &str,
        parameters: serde_json::Value,
        principal: Option<String>,
    ) -> CoreResult<(JobExecution, WorkflowRun)> {
        let definition = self.registry.get(chain_name)?.clone();
        if definition.stages.is_empty() {
            return Err(CoreError::validation("chain", format!("{} has no stages", chain_name)));
        }
        let parameters = normalize_parameters(parameters)?;

        let now = Utc::now();
        let execution = JobExecution {
            id: uuid::Uuid::new_v4().to_string(),
            chain_name: definition.name.clone(),
            stages: definition.stages.clone(),
            status: JobExecutionStatus::Running,
            current_index: 0,
            initiating_principal: principal.clone(),
            parameters: parameters.clone(),
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.store.create_job_execution(&execution).await?;
        info!(
            "Starting chain {} ({} stages) as execution {}",
            definition.name,
            definition.stages.len(),
            execution.id
        );

        let ctx = ChainContext {
            job_execution_id: execution.id.clone(),
            chain_name: definition.name,
            stages: definition.stages,
            stage_index: 0,
            shared_parameters: parameters,
            initiating_principal: principal,
        };
        match self.trigger_stage(&ctx, TriggerType::Manual).await {
            Ok(run) => {
                self.request_watch(&run.run_id, Duration::ZERO);
                Ok((execution, run))
            }
            Err(e) => {
                self.fail_execution(&ctx, None, &format!("failed to trigger first stage: {}", e))
                    .await;
                Err(e)
            }
        }
    }

    /// Parameters every chained run receives on top of the shared ones.
    pub fn stage_parameters(ctx: &ChainContext) -> serde_json::Value {
        let mut params = match &ctx.shared_parameters {
            serde_json::Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        params.insert("stage_index".to_string(), json!(ctx.stage_index));
        params.insert("stage_total".to_string(), json!(ctx.stage_total()));
        params.insert("next_stage".to_string(), json!(ctx.next_stage()));
        serde_json::Value::Object(params)
    }

    async fn trigger_stage(
        &self,
        ctx: &ChainContext,
        trigger_type: TriggerType,
    ) -> CoreResult<WorkflowRun> {
        let stage_id = ctx.stages.get(ctx.stage_index).cloned().ok_or_else(|| {
            CoreError::validation(
                "stage_index",
                format!("{} is out of range for chain {}", ctx.stage_index, ctx.chain_name),
            )
        })?;
        let note = if ctx.stage_index == 0 {
            format!("Chain 1/{}: {} - chain started", ctx.stage_total(), stage_id)
        } else {
            format!(
                "Chain {}/{}: {} - auto-triggered from previous stage completion",
                ctx.stage_index + 1,
                ctx.stage_total(),
                stage_id
            )
        };

        let cmd = TriggerRunCommand {
            parameters: Self::stage_parameters(ctx),
            principal: ctx.initiating_principal.clone(),
            trigger_type,
            note: Some(note),
            chain: Some(ctx.clone()),
            ..TriggerRunCommand::new(stage_id)
        };
        let (run, published) = self.commands.launch_run(cmd).await?;
        if let Err(e) = published {
            warn!("Chained run {} stored but not announced: {}", run.run_id, e);
        }
        Ok(run)
    }

    fn request_watch(&self, run_id: &str, delay: Duration) {
        let request = WatchRequest {
            run_id: run_id.to_string(),
            delay,
        };
        if self.watch_tx.send(request).is_err() {
            // the next sweep still picks the run up
            debug!("Watch intake closed; run {} left to the sweep", run_id);
        }
    }

    fn chain_event(&self, event_type: EventType, ctx: &ChainContext, run: Option<&WorkflowRun>) -> Event {
        let mut event = Event::new(event_type, &ctx.job_execution_id)
            .with_principal(ctx.initiating_principal.clone())
            .with_field("chain_name", json!(ctx.chain_name))
            .with_field("stages", json!(ctx.stages))
            .with_field("stage_index", json!(ctx.stage_index));
        if let Some(run) = run {
            event = event
                .with_field("last_run_id", json!(run.run_id))
                .with_field("last_stage_id", json!(run.stage_id))
                .with_field("last_status", json!(run.status.as_str()));
        }
        event
    }

    async fn complete_execution(&self, ctx: &ChainContext, run: &WorkflowRun) -> CoreResult<()> {
        let moved = self
            .store
            .set_job_execution_status(
                &ctx.job_execution_id,
                JobExecutionStatus::Completed,
                Some(ctx.stage_index),
                None,
            )
            .await?;
        if !moved {
            return Ok(());
        }
        info!("Chain execution {} completed", ctx.job_execution_id);
        self.publisher
            .publish(&self.chain_event(EventType::ChainCompleted, ctx, Some(run)))
            .await
    }

    /// Marks the execution failed once. Never returns an error: a halted
    /// chain must not look like a failed hand-off.
    async fn fail_execution(&self, ctx: &ChainContext, run: Option<&WorkflowRun>, reason: &str) {
        let moved = match self
            .store
            .set_job_execution_status(
                &ctx.job_execution_id,
                JobExecutionStatus::Failed,
                None,
                Some(reason),
            )
            .await
        {
            Ok(moved) => moved,
            Err(e) => {
                error!(
                    "Could not mark chain execution {} failed: {}",
                    ctx.job_execution_id, e
                );
                return;
            }
        };
        if !moved {
            return;
        }
        warn!("Chain execution {} failed: {}", ctx.job_execution_id, reason);
        let event = self
            .chain_event(EventType::ChainFailed, ctx, run)
            .with_field("error", json!(reason));
        if let Err(e) = self.publisher.publish(&event).await {
            warn!("chain.failed for {} not delivered: {}", ctx.job_execution_id, e);
        }
    }

    fn hop_for(ctx: &ChainContext, run: &WorkflowRun) -> Option<ChainHop> {
        let next = ctx.advance()?;
        let next_stage_id = next.stages.get(next.stage_index)?.clone();
        Some(ChainHop {
            hop_id: format!("{}:{}", ctx.job_execution_id, next.stage_index),
            job_execution_id: ctx.job_execution_id.clone(),
            current_stage_id: run.stage_id.clone(),
            current_run_id: run.run_id.clone(),
            next_stage_id,
            next_stage_index: next.stage_index,
            due_at: Utc::now(),
            attempts: 0,
        })
    }

    /// Drain due hops. Returns how many were claimed.
    pub async fn process_due_hops(&self) -> CoreResult<usize> {
        let hops = self
            .store
            .claim_due_hops(Utc::now(), HOP_CLAIM_LIMIT, HOP_LEASE)
            .await?;
        let claimed = hops.len();
        for hop in hops {
            match self.advance(&hop).await {
                Ok(outcome) => {
                    if let HopOutcome::Skipped(reason) = &outcome {
                        debug!("Hop {} skipped: {}", hop.hop_id, reason);
                    }
                    self.store.complete_hop(&hop.hop_id).await?;
                }
                Err(e) => {
                    warn!(
                        "Hop {} (attempt {}) will be retried: {}",
                        hop.hop_id, hop.attempts, e
                    );
                    let retry_at = Utc::now() + chrono::Duration::seconds(HOP_RETRY_DELAY_SECS);
                    self.store.release_hop(&hop.hop_id, retry_at).await?;
                }
            }
        }
        Ok(claimed)
    }

    /// Re-run the terminal hand-off for running executions whose latest
    /// stage already finished. Covers a crash (or a failed hop write)
    /// between saving the terminal status and queueing the hop. Hop ids are
    /// deterministic, so repeating this never queues a stage twice.
    pub async fn recover_stalled_executions(&self) -> CoreResult<usize> {
        let mut recovered = 0;
        for execution in self.store.list_running_job_executions().await? {
            let runs = self.store.list_runs_for_execution(&execution.id).await?;
            let latest = runs.into_iter().max_by_key(|run| {
                let index = run.configuration.chain.as_ref().map(|c| c.stage_index);
                (index, run.created_at)
            });
            let Some(run) = latest else {
                continue;
            };
            if !run.status.is_terminal() {
                continue;
            }
            debug!(
                "Execution {} waits on finished run {}; replaying hand-off",
                execution.id, run.run_id
            );
            self.on_run_terminal(&run).await?;
            recovered += 1;
        }
        if recovered > 0 {
            info!("Replayed hand-off for {} stalled chain executions", recovered);
        }
        Ok(recovered)
    }

    /// Trigger the hop's next stage if the chain is still waiting for it.
    /// Errors are local (persistence) and leave the hop to be retried.
    async fn advance(&self, hop: &ChainHop) -> CoreResult<HopOutcome> {
        let Some(execution) = self.store.load_job_execution(&hop.job_execution_id).await? else {
            return Ok(HopOutcome::Skipped(format!(
                "execution {} does not exist",
                hop.job_execution_id
            )));
        };
        if execution.status.is_terminal() {
            return Ok(HopOutcome::Skipped(format!(
                "execution already {}",
                execution.status.as_str()
            )));
        }
        if execution.current_index >= hop.next_stage_index {
            return Ok(HopOutcome::Skipped(format!(
                "stage {} already triggered",
                hop.next_stage_index
            )));
        }

        let Some(previous) = self.store.load_run(&hop.current_run_id).await? else {
            return Ok(HopOutcome::Skipped(format!(
                "run {} does not exist",
                hop.current_run_id
            )));
        };
        if previous.status != RunStatus::Success {
            return Ok(HopOutcome::Skipped(format!(
                "run {} is {}, not success",
                previous.run_id, previous.status
            )));
        }
        let ctx = match &previous.configuration.chain {
            Some(ctx) => ChainContext {
                stage_index: hop.next_stage_index,
                ..ctx.clone()
            },
            None => ChainContext {
                job_execution_id: execution.id.clone(),
                chain_name: execution.chain_name.clone(),
                stages: execution.stages.clone(),
                stage_index: hop.next_stage_index,
                shared_parameters: execution.parameters.clone(),
                initiating_principal: execution.initiating_principal.clone(),
            },
        };
        if ctx.stages.get(ctx.stage_index) != Some(&hop.next_stage_id) {
            return Ok(HopOutcome::Skipped(format!(
                "stage {} is not at index {} of chain {}",
                hop.next_stage_id, hop.next_stage_index, ctx.chain_name
            )));
        }

        match self.trigger_stage(&ctx, TriggerType::Api).await {
            Ok(run) => {
                self.store
                    .set_job_execution_status(
                        &ctx.job_execution_id,
                        JobExecutionStatus::Running,
                        Some(ctx.stage_index),
                        None,
                    )
                    .await?;
                info!(
                    "Chain {} advanced to stage {}/{} ({}) with run {}",
                    ctx.job_execution_id,
                    ctx.stage_index + 1,
                    ctx.stage_total(),
                    hop.next_stage_id,
                    run.run_id
                );
                self.request_watch(&run.run_id, self.hop_start_delay);
                Ok(HopOutcome::Advanced(Box::new(run)))
            }
            Err(e @ CoreError::Persistence(_)) => Err(e),
            Err(e) => {
                let reason = format!("failed to trigger {}: {}", hop.next_stage_id, e);
                self.fail_execution(&ctx, Some(&previous), &reason).await;
                Ok(HopOutcome::Halted(reason))
            }
        }
    }

    /// Restart a chain from a known successful run, without any in-memory
    /// state from the process that ran it.
    pub async fn resume_hop(
        &self,
        current_stage_id: &str,
        current_run_id: &str,
        next_stage_id: &str,
        stage_index: usize,
    ) -> CoreResult<HopOutcome> {
        let run = self
            .store
            .load_run(current_run_id)
            .await?
            .ok_or_else(|| CoreError::not_found("WorkflowRun", current_run_id))?;
        if run.stage_id != current_stage_id {
            return Err(CoreError::validation(
                "stage_id",
                format!("run {} belongs to stage {}", current_run_id, run.stage_id),
            ));
        }
        if run.status != RunStatus::Success {
            return Err(CoreError::validation(
                "run_id",
                format!("run {} is {}, not success", current_run_id, run.status),
            ));
        }
        let ctx = run.configuration.chain.clone().ok_or_else(|| {
            CoreError::validation("run_id", format!("run {} is not part of a chain", current_run_id))
        })?;
        if ctx.stages.get(stage_index).map(String::as_str) != Some(next_stage_id) {
            return Err(CoreError::validation(
                "stage_index",
                format!("{} is not stage {} of chain {}", next_stage_id, stage_index, ctx.chain_name),
            ));
        }

        let hop = ChainHop {
            hop_id: format!("{}:{}", ctx.job_execution_id, stage_index),
            job_execution_id: ctx.job_execution_id.clone(),
            current_stage_id: current_stage_id.to_string(),
            current_run_id: current_run_id.to_string(),
            next_stage_id: next_stage_id.to_string(),
            next_stage_index: stage_index,
            due_at: Utc::now(),
            attempts: 0,
        };
        self.store.enqueue_hop(&hop).await?;
        let outcome = self.advance(&hop).await?;
        self.store.complete_hop(&hop.hop_id).await?;
        Ok(outcome)
    }
}

#[async_trait]
impl TerminalRunHandler for ChainController {
    async fn on_run_terminal(&self, run: &WorkflowRun) -> CoreResult<()> {
        let Some(ctx) = &run.configuration.chain else {
            return Ok(());
        };
        match self.store.load_job_execution(&ctx.job_execution_id).await? {
            Some(execution) if !execution.status.is_terminal() => {}
            Some(_) => {
                debug!(
                    "Execution {} already finished; ignoring run {}",
                    ctx.job_execution_id, run.run_id
                );
                return Ok(());
            }
            None => {
                warn!(
                    "Run {} references unknown chain execution {}",
                    run.run_id, ctx.job_execution_id
                );
                return Ok(());
            }
        }

        if run.status != RunStatus::Success {
            let reason = format!("stage {} ended {}", run.stage_id, run.status);
            self.fail_execution(ctx, Some(run), &reason).await;
            return Ok(());
        }
        if ctx.is_last_stage() {
            return self.complete_execution(ctx, run).await;
        }
        if let Some(hop) = Self::hop_for(ctx, run) {
            self.store.enqueue_hop(&hop).await?;
            info!(
                "Queued hop {} -> {} for execution {}",
                run.stage_id, hop.next_stage_id, ctx.job_execution_id
            );
        }
        Ok(())
    }
}
