//! In-process orchestrator double with scripted answers, shared by the
//! component tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::client::{
    ExternalRunHandle, ExternalRunState, ExternalState, OrchestratorClient, SubTaskState,
};
use crate::core::error::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct TriggerCall {
    pub stage_id: String,
    pub run_id: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone)]
enum Scripted {
    State(ExternalState),
    Error,
}

#[derive(Default)]
struct ScriptState {
    triggers: Vec<TriggerCall>,
    run_script: HashMap<String, VecDeque<Scripted>>,
    stage_state: HashMap<String, ExternalState>,
    sub_tasks: HashMap<String, Vec<SubTaskState>>,
    query_count: u32,
    cancel_attempts: u32,
    reset_attempts: u32,
    fail_trigger: bool,
    fail_cancel: bool,
    fail_reset: bool,
}

/// Answers queries from a per-run script. The last scripted answer repeats;
/// runs without a script fall back to a per-stage state, then to `queued`.
#[derive(Default)]
pub struct ScriptedOrchestrator {
    inner: Mutex<ScriptState>,
}

impl ScriptedOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.inner.lock().unwrap()
    }

    pub fn push_query_state(&self, run_id: &str, state: ExternalState) {
        self.lock()
            .run_script
            .entry(run_id.to_string())
            .or_default()
            .push_back(Scripted::State(state));
    }

    pub fn push_query_error(&self, run_id: &str) {
        self.lock()
            .run_script
            .entry(run_id.to_string())
            .or_default()
            .push_back(Scripted::Error);
    }

    pub fn set_stage_state(&self, stage_id: &str, state: ExternalState) {
        self.lock().stage_state.insert(stage_id.to_string(), state);
    }

    pub fn set_sub_tasks(&self, run_id: &str, tasks: Vec<SubTaskState>) {
        self.lock().sub_tasks.insert(run_id.to_string(), tasks);
    }

    pub fn set_fail_trigger(&self, fail: bool) {
        self.lock().fail_trigger = fail;
    }

    pub fn set_fail_cancel(&self, fail: bool) {
        self.lock().fail_cancel = fail;
    }

    pub fn set_fail_reset(&self, fail: bool) {
        self.lock().fail_reset = fail;
    }

    pub fn triggers(&self) -> Vec<TriggerCall> {
        self.lock().triggers.clone()
    }

    pub fn triggers_for(&self, stage_id: &str) -> Vec<TriggerCall> {
        self.lock()
            .triggers
            .iter()
            .filter(|t| t.stage_id == stage_id)
            .cloned()
            .collect()
    }

    pub fn query_count(&self) -> u32 {
        self.lock().query_count
    }

    pub fn cancel_attempts(&self) -> u32 {
        self.lock().cancel_attempts
    }

    pub fn reset_attempts(&self) -> u32 {
        self.lock().reset_attempts
    }
}

fn unavailable(verb: &str) -> CoreError {
    CoreError::external("airflow", format!("{} failed: connection refused", verb))
}

#[async_trait]
impl OrchestratorClient for ScriptedOrchestrator {
    async fn trigger(
        &self,
        stage_id: &str,
        run_id: &str,
        parameters: &serde_json::Value,
    ) -> CoreResult<ExternalRunHandle> {
        let mut s = self.lock();
        s.triggers.push(TriggerCall {
            stage_id: stage_id.to_string(),
            run_id: run_id.to_string(),
            parameters: parameters.clone(),
        });
        if s.fail_trigger {
            return Err(unavailable("trigger"));
        }
        Ok(ExternalRunHandle {
            run_id: run_id.to_string(),
            stage_id: stage_id.to_string(),
            execution_date: Some(Utc::now()),
            state: ExternalState::Queued,
        })
    }

    async fn query(&self, stage_id: &str, run_id: &str) -> CoreResult<ExternalRunState> {
        let mut s = self.lock();
        s.query_count += 1;
        let next = match s.run_script.get_mut(run_id) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        let state = match next {
            Some(Scripted::Error) => return Err(unavailable("query")),
            Some(Scripted::State(state)) => state,
            None => s
                .stage_state
                .get(stage_id)
                .cloned()
                .unwrap_or(ExternalState::Queued),
        };
        Ok(ExternalRunState::bare(state))
    }

    async fn list_sub_tasks(&self, _stage_id: &str, run_id: &str) -> CoreResult<Vec<SubTaskState>> {
        Ok(self.lock().sub_tasks.get(run_id).cloned().unwrap_or_default())
    }

    async fn cancel(&self, _stage_id: &str, _run_id: &str) -> CoreResult<()> {
        let mut s = self.lock();
        s.cancel_attempts += 1;
        if s.fail_cancel {
            return Err(unavailable("cancel"));
        }
        Ok(())
    }

    async fn reset(&self, _stage_id: &str, _run_id: &str) -> CoreResult<()> {
        let mut s = self.lock();
        s.reset_attempts += 1;
        if s.fail_reset {
            return Err(unavailable("reset"));
        }
        Ok(())
    }
}
