use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::run::{RunStatus, WorkflowRun};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "workflow.triggered")]
    WorkflowTriggered,
    #[serde(rename = "workflow.started")]
    WorkflowStarted,
    #[serde(rename = "workflow.updated")]
    WorkflowUpdated,
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted,
    #[serde(rename = "workflow.failed")]
    WorkflowFailed,
    #[serde(rename = "workflow.stopped")]
    WorkflowStopped,
    #[serde(rename = "workflow.retried")]
    WorkflowRetried,
    #[serde(rename = "stage.started")]
    StageStarted,
    #[serde(rename = "stage.completed")]
    StageCompleted,
    #[serde(rename = "stage.failed")]
    StageFailed,
    #[serde(rename = "watch.timed_out")]
    WatchTimedOut,
    #[serde(rename = "chain.completed")]
    ChainCompleted,
    #[serde(rename = "chain.failed")]
    ChainFailed,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::WorkflowTriggered => "workflow.triggered",
            EventType::WorkflowStarted => "workflow.started",
            EventType::WorkflowUpdated => "workflow.updated",
            EventType::WorkflowCompleted => "workflow.completed",
            EventType::WorkflowFailed => "workflow.failed",
            EventType::WorkflowStopped => "workflow.stopped",
            EventType::WorkflowRetried => "workflow.retried",
            EventType::StageStarted => "stage.started",
            EventType::StageCompleted => "stage.completed",
            EventType::StageFailed => "stage.failed",
            EventType::WatchTimedOut => "watch.timed_out",
            EventType::ChainCompleted => "chain.completed",
            EventType::ChainFailed => "chain.failed",
        }
    }

    /// Events whose payload carries the stored run status.
    pub fn carries_run_status(self) -> bool {
        matches!(
            self,
            EventType::WorkflowTriggered
                | EventType::WorkflowStarted
                | EventType::WorkflowUpdated
                | EventType::WorkflowCompleted
                | EventType::WorkflowFailed
                | EventType::WorkflowStopped
                | EventType::WorkflowRetried
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only notification record. Never read back by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub event_type: EventType,
    pub job_id: String,
    pub run_id: Option<String>,
    pub stage_id: Option<String>,
    pub principal: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(event_type: EventType, job_id: impl Into<String>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type,
            job_id: job_id.into(),
            run_id: None,
            stage_id: None,
            principal: None,
            timestamp: Utc::now(),
            payload: json!({}),
        }
    }

    /// Event describing `run` exactly as it was stored.
    pub fn for_run(event_type: EventType, run: &WorkflowRun) -> Self {
        let mut event = Self::new(event_type, &run.job_id);
        event.run_id = Some(run.run_id.clone());
        event.stage_id = Some(run.stage_id.clone());
        event.principal = run.triggered_by.clone();
        event.payload = json!({
            "status": run.status.as_str(),
            "execution_date": run.execution_date,
            "start_date": run.start_date,
            "end_date": run.end_date,
            "external_trigger_id": run.external_trigger_id,
            "trigger_type": run.trigger_type.as_str(),
        });
        event
    }

    pub fn with_principal(mut self, principal: Option<String>) -> Self {
        self.principal = principal;
        self
    }

    pub fn with_field(mut self, key: &str, value: serde_json::Value) -> Self {
        if let Some(map) = self.payload.as_object_mut() {
            map.insert(key.to_string(), value);
        }
        self
    }

    pub fn status(&self) -> Option<RunStatus> {
        self.payload
            .get("status")
            .and_then(|v| v.as_str())
            .and_then(RunStatus::from_status)
    }
}
