//! Background reconciliation: a periodic sweep seeds one watch task per
//! non-terminal run, and each watch polls the orchestrator until the run is
//! terminal or its wall-clock cap is reached.

mod cleanup;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::chain::TerminalRunHandler;
use crate::core::config::{CleanupConfig, ReconcileConfig};
use crate::core::error::CoreResult;
use crate::core::events::{Event, EventPublisher, EventType};
use crate::core::orchestrator::OrchestratorClient;
use crate::core::run::{RunStatus, WorkflowRun, apply_observed_state, map_external_state};
use crate::core::store::{RunStore, commit_transition};

pub use cleanup::CleanupReport;

/// Ask the reconciler to watch a run, starting after `delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchRequest {
    pub run_id: String,
    pub delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    Terminal(RunStatus),
    /// Cap reached while the run was still non-terminal. Its true state is
    /// undetermined, not failed.
    TimedOut,
    /// The run row disappeared.
    Vanished,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    pub candidates: usize,
    pub spawned: usize,
}

pub struct Reconciler {
    client: Arc<dyn OrchestratorClient>,
    store: Arc<dyn RunStore>,
    publisher: Arc<EventPublisher>,
    terminal: Option<Arc<dyn TerminalRunHandler>>,
    settings: ReconcileConfig,
    cleanup: CleanupConfig,
    watches: Mutex<HashMap<String, JoinHandle<WatchOutcome>>>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl Reconciler {
    pub fn new(
        client: Arc<dyn OrchestratorClient>,
        store: Arc<dyn RunStore>,
        publisher: Arc<EventPublisher>,
        terminal: Option<Arc<dyn TerminalRunHandler>>,
        settings: ReconcileConfig,
        cleanup: CleanupConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_watches.max(1)));
        Self {
            client,
            store,
            publisher,
            terminal,
            settings,
            cleanup,
            watches: Mutex::new(HashMap::new()),
            permits,
            shutdown: CancellationToken::new(),
        }
    }

    fn lock_watches(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<WatchOutcome>>> {
        self.watches.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn active_watches(&self) -> usize {
        self.lock_watches().values().filter(|h| !h.is_finished()).count()
    }

    #[cfg(test)]
    pub fn is_watching(&self, run_id: &str) -> bool {
        self.lock_watches()
            .get(run_id)
            .is_some_and(|h| !h.is_finished())
    }

    pub(crate) fn prune_finished(&self) -> usize {
        let mut watches = self.lock_watches();
        let before = watches.len();
        watches.retain(|_, h| !h.is_finished());
        before - watches.len()
    }

    /// Seed watches for every non-terminal run. Runs with a live watch keep it.
    pub async fn sweep(self: &Arc<Self>) -> CoreResult<SweepReport> {
        let runs = self.store.list_runs_by_status(&RunStatus::NON_TERMINAL).await?;
        let mut report = SweepReport {
            candidates: runs.len(),
            spawned: 0,
        };
        for run in runs {
            if self.spawn_watch(&run.run_id, Duration::ZERO) {
                report.spawned += 1;
            }
        }
        if report.spawned > 0 {
            info!(
                "Sweep started {} new watches ({} non-terminal runs)",
                report.spawned, report.candidates
            );
        }
        Ok(report)
    }

    /// Start watching `run_id` unless a live watch already exists.
    /// Returns true if a new task was spawned.
    pub fn spawn_watch(self: &Arc<Self>, run_id: &str, delay: Duration) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        let mut watches = self.lock_watches();
        if watches.get(run_id).is_some_and(|h| !h.is_finished()) {
            debug!("Run {} already has a live watch", run_id);
            return false;
        }

        let this = Arc::clone(self);
        let id = run_id.to_string();
        let handle = tokio::spawn(async move {
            let outcome = this.supervised_watch(&id, delay).await;
            debug!("Watch for run {} ended: {:?}", id, outcome);
            outcome
        });
        watches.insert(run_id.to_string(), handle);
        true
    }

    /// Feed watch requests from other components into `spawn_watch`.
    pub fn serve_watch_requests(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<WatchRequest>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    request = rx.recv() => match request {
                        Some(request) => {
                            self.spawn_watch(&request.run_id, request.delay);
                        }
                        None => break,
                    },
                }
            }
        })
    }

    async fn supervised_watch(&self, run_id: &str, delay: Duration) -> WatchOutcome {
        let _permit = tokio::select! {
            _ = self.shutdown.cancelled() => return WatchOutcome::Cancelled,
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return WatchOutcome::Cancelled,
            },
        };
        if !delay.is_zero() {
            tokio::select! {
                _ = self.shutdown.cancelled() => return WatchOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.watch_run(run_id).await
    }

    /// Poll one run until it is terminal, vanishes, the cap is hit or the
    /// reconciler shuts down. Stored status is reloaded every tick, so a
    /// forced stop ends the watch without being overwritten.
    pub async fn watch_run(&self, run_id: &str) -> WatchOutcome {
        let started = Instant::now();
        let deadline = started.checked_add(self.settings.max_watch());
        let mut sub_tasks: HashMap<String, RunStatus> = HashMap::new();

        loop {
            let pause = match self.tick(run_id, &mut sub_tasks).await {
                Ok(Some(outcome)) => return outcome,
                Ok(None) => self.settings.poll_interval(),
                Err(e) if e.is_circuit_open() => {
                    debug!("Breaker open; run {} waits before the next poll", run_id);
                    self.settings.error_backoff()
                }
                Err(e) if e.is_external() => {
                    warn!("Polling run {} failed, backing off: {}", run_id, e);
                    self.settings.error_backoff()
                }
                Err(e) => {
                    error!("Watch tick for run {} failed: {}", run_id, e);
                    self.settings.error_backoff()
                }
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => return WatchOutcome::Cancelled,
                _ = tokio::time::sleep(pause) => {}
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                self.report_timeout(run_id, started.elapsed()).await;
                return WatchOutcome::TimedOut;
            }
        }
    }

    async fn tick(
        &self,
        run_id: &str,
        sub_tasks: &mut HashMap<String, RunStatus>,
    ) -> CoreResult<Option<WatchOutcome>> {
        let Some(run) = self.store.load_run(run_id).await? else {
            return Ok(Some(WatchOutcome::Vanished));
        };
        if run.status.is_terminal() {
            return Ok(Some(WatchOutcome::Terminal(run.status)));
        }

        let observed = self
            .client
            .query(&run.stage_id, &run.external_trigger_id)
            .await?;
        let now = Utc::now();
        let committed = commit_transition(self.store.as_ref(), run_id, |current| {
            apply_observed_state(current, &observed, now)
        })
        .await?;

        if let Some(event_type) = committed.event_type() {
            debug!(
                "Run {}: {} -> {}",
                run_id, committed.previous, committed.run.status
            );
            if let Err(e) = self
                .publisher
                .publish(&Event::for_run(event_type, &committed.run))
                .await
            {
                warn!(
                    "Run {} is {} but {} was not delivered: {}",
                    run_id, committed.run.status, event_type, e
                );
            }
        }

        if self.settings.sync_sub_tasks {
            if let Err(e) = self.sync_sub_tasks(&committed.run, sub_tasks).await {
                debug!("Sub-task sync for run {} skipped: {}", run_id, e);
            }
        }

        if committed.run.status.is_terminal() {
            if committed.changed {
                self.hand_off(&committed.run).await;
            }
            return Ok(Some(WatchOutcome::Terminal(committed.run.status)));
        }
        Ok(None)
    }

    async fn hand_off(&self, run: &WorkflowRun) {
        if let Some(handler) = &self.terminal {
            if let Err(e) = handler.on_run_terminal(run).await {
                error!(
                    "Terminal hand-off for run {} failed, chain recovery will replay it: {}",
                    run.run_id, e
                );
            }
        }
    }

    /// Publish `stage.*` events for sub-tasks whose status changed since the
    /// previous tick of this watch.
    async fn sync_sub_tasks(
        &self,
        run: &WorkflowRun,
        seen: &mut HashMap<String, RunStatus>,
    ) -> CoreResult<()> {
        let tasks = self
            .client
            .list_sub_tasks(&run.stage_id, &run.external_trigger_id)
            .await?;
        for task in tasks {
            let status = map_external_state(&task.state);
            if seen.insert(task.task_id.clone(), status) == Some(status) {
                continue;
            }
            let event_type = match status {
                RunStatus::Running => EventType::StageStarted,
                RunStatus::Success => EventType::StageCompleted,
                s if s.is_terminal() => EventType::StageFailed,
                _ => continue,
            };
            let mut event = Event::new(event_type, &run.job_id)
                .with_principal(run.triggered_by.clone())
                .with_field("task_id", json!(task.task_id))
                .with_field("state", json!(task.state.as_str()))
                .with_field("start_date", json!(task.start_date))
                .with_field("end_date", json!(task.end_date))
                .with_field("duration_secs", json!(task.duration_secs))
                .with_field("hostname", json!(task.hostname));
            event.run_id = Some(run.run_id.clone());
            event.stage_id = Some(run.stage_id.clone());
            if let Err(e) = self.publisher.publish(&event).await {
                warn!("{} for task {} not delivered: {}", event_type, task.task_id, e);
            }
        }
        Ok(())
    }

    async fn report_timeout(&self, run_id: &str, watched: Duration) {
        warn!(
            "Gave up watching run {} after {}s; outcome undetermined",
            run_id,
            watched.as_secs()
        );
        let run = match self.store.load_run(run_id).await {
            Ok(Some(run)) => run,
            Ok(None) => return,
            Err(e) => {
                error!("Could not load run {} for timeout report: {}", run_id, e);
                return;
            }
        };
        let event = Event::for_run(EventType::WatchTimedOut, &run)
            .with_field("outcome", json!("undetermined"))
            .with_field("watched_secs", json!(watched.as_secs()));
        if let Err(e) = self.publisher.publish(&event).await {
            warn!("watch.timed_out for {} not delivered: {}", run_id, e);
        }
    }

    /// Cancel every watch and wait for them to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = self.lock_watches().drain().map(|(_, h)| h).collect();
        let count = handles.len();
        for handle in handles {
            let _ = handle.await;
        }
        info!("Reconciler stopped ({} watches cancelled)", count);
    }
}

#[cfg(test)]
mod tests;
