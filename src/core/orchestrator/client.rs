use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::CoreResult;

/// State vocabulary reported by the external orchestrator.
///
/// Parsing is total: anything unrecognized lands in `Unknown` and is never
/// treated as final.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ExternalState {
    Queued,
    Scheduled,
    Running,
    UpForRetry,
    UpForReschedule,
    Success,
    Failed,
    UpstreamFailed,
    Skipped,
    Removed,
    Unknown(String),
}

impl ExternalState {
    pub fn as_str(&self) -> &str {
        match self {
            ExternalState::Queued => "queued",
            ExternalState::Scheduled => "scheduled",
            ExternalState::Running => "running",
            ExternalState::UpForRetry => "up_for_retry",
            ExternalState::UpForReschedule => "up_for_reschedule",
            ExternalState::Success => "success",
            ExternalState::Failed => "failed",
            ExternalState::UpstreamFailed => "upstream_failed",
            ExternalState::Skipped => "skipped",
            ExternalState::Removed => "removed",
            ExternalState::Unknown(raw) => raw,
        }
    }
}

impl From<&str> for ExternalState {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "queued" => ExternalState::Queued,
            "scheduled" => ExternalState::Scheduled,
            "running" => ExternalState::Running,
            "up_for_retry" => ExternalState::UpForRetry,
            "up_for_reschedule" => ExternalState::UpForReschedule,
            "success" => ExternalState::Success,
            "failed" => ExternalState::Failed,
            "upstream_failed" => ExternalState::UpstreamFailed,
            "skipped" => ExternalState::Skipped,
            "removed" => ExternalState::Removed,
            _ => ExternalState::Unknown(value.to_string()),
        }
    }
}

impl From<String> for ExternalState {
    fn from(value: String) -> Self {
        ExternalState::from(value.as_str())
    }
}

impl From<ExternalState> for String {
    fn from(value: ExternalState) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalRunHandle {
    pub run_id: String,
    pub stage_id: String,
    pub execution_date: Option<DateTime<Utc>>,
    pub state: ExternalState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalRunState {
    pub state: ExternalState,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub execution_date: Option<DateTime<Utc>>,
}

impl ExternalRunState {
    pub fn bare(state: ExternalState) -> Self {
        Self {
            state,
            start_date: None,
            end_date: None,
            execution_date: None,
        }
    }
}

/// One task instance inside an external run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTaskState {
    pub task_id: String,
    pub state: ExternalState,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub hostname: Option<String>,
}

/// The verbs the coordinator needs from the external orchestrator.
///
/// `trigger` must be idempotent by `run_id`: the id is passed through
/// unchanged and the external system deduplicates on it.
#[async_trait]
pub trait OrchestratorClient: Send + Sync {
    async fn trigger(
        &self,
        stage_id: &str,
        run_id: &str,
        parameters: &serde_json::Value,
    ) -> CoreResult<ExternalRunHandle>;

    async fn query(&self, stage_id: &str, run_id: &str) -> CoreResult<ExternalRunState>;

    async fn list_sub_tasks(&self, stage_id: &str, run_id: &str) -> CoreResult<Vec<SubTaskState>>;

    async fn cancel(&self, stage_id: &str, run_id: &str) -> CoreResult<()>;

    async fn reset(&self, stage_id: &str, run_id: &str) -> CoreResult<()>;
}

#[async_trait]
impl<T: OrchestratorClient + ?Sized> OrchestratorClient for Arc<T> {
    async fn trigger(
        &self,
        stage_id: &str,
        run_id: &str,
        parameters: &serde_json::Value,
    ) -> CoreResult<ExternalRunHandle> {
        (**self).trigger(stage_id, run_id, parameters).await
    }

    async fn query(&self, stage_id: &str, run_id: &str) -> CoreResult<ExternalRunState> {
        (**self).query(stage_id, run_id).await
    }

    async fn list_sub_tasks(&self, stage_id: &str, run_id: &str) -> CoreResult<Vec<SubTaskState>> {
        (**self).list_sub_tasks(stage_id, run_id).await
    }

    async fn cancel(&self, stage_id: &str, run_id: &str) -> CoreResult<()> {
        (**self).cancel(stage_id, run_id).await
    }

    async fn reset(&self, stage_id: &str, run_id: &str) -> CoreResult<()> {
        (**self).reset(stage_id, run_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsing_is_total_and_case_insensitive() {
        assert_eq!(ExternalState::from("SUCCESS"), ExternalState::Success);
        assert_eq!(ExternalState::from(" up_for_retry "), ExternalState::UpForRetry);
        assert_eq!(
            ExternalState::from("deferred"),
            ExternalState::Unknown("deferred".to_string())
        );
    }

    #[test]
    fn serde_uses_plain_strings() {
        let json = serde_json::to_string(&ExternalState::UpstreamFailed).unwrap();
        assert_eq!(json, "\"upstream_failed\"");
        let back: ExternalState = serde_json::from_str("\"restarting\"").unwrap();
        assert_eq!(back.as_str(), "restarting");
    }
}
