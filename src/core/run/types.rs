use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
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
}

impl RunStatus {
    pub const ALL: [RunStatus; 10] = [
        RunStatus::Queued,
        RunStatus::Scheduled,
        RunStatus::Running,
        RunStatus::UpForRetry,
        RunStatus::UpForReschedule,
        RunStatus::Success,
        RunStatus::Failed,
        RunStatus::UpstreamFailed,
        RunStatus::Skipped,
        RunStatus::Removed,
    ];

    pub const NON_TERMINAL: [RunStatus; 5] = [
        RunStatus::Queued,
        RunStatus::Scheduled,
        RunStatus::Running,
        RunStatus::UpForRetry,
        RunStatus::UpForReschedule,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Scheduled => "scheduled",
            RunStatus::Running => "running",
            RunStatus::UpForRetry => "up_for_retry",
            RunStatus::UpForReschedule => "up_for_reschedule",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::UpstreamFailed => "upstream_failed",
            RunStatus::Skipped => "skipped",
            RunStatus::Removed => "removed",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(RunStatus::Queued),
            "scheduled" => Some(RunStatus::Scheduled),
            "running" => Some(RunStatus::Running),
            "up_for_retry" => Some(RunStatus::UpForRetry),
            "up_for_reschedule" => Some(RunStatus::UpForReschedule),
            "success" => Some(RunStatus::Success),
            "failed" => Some(RunStatus::Failed),
            "upstream_failed" => Some(RunStatus::UpstreamFailed),
            "skipped" => Some(RunStatus::Skipped),
            "removed" => Some(RunStatus::Removed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Success
                | RunStatus::Failed
                | RunStatus::UpstreamFailed
                | RunStatus::Skipped
                | RunStatus::Removed
        )
    }

    /// Accepted but not yet picked up by a worker.
    pub fn is_initial(self) -> bool {
        matches!(self, RunStatus::Queued | RunStatus::Scheduled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance of a run. Recorded, never acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Scheduled,
    Api,
    External,
}

impl TriggerType {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Scheduled => "scheduled",
            TriggerType::Api => "api",
            TriggerType::External => "external",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(TriggerType::Manual),
            "scheduled" => Some(TriggerType::Scheduled),
            "api" => Some(TriggerType::Api),
            "external" => Some(TriggerType::External),
            _ => None,
        }
    }
}

/// Chain bookkeeping carried inside each chained run's configuration, so the
/// next hop can be rebuilt from the previous run alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainContext {
    pub job_execution_id: String,
    pub chain_name: String,
    pub stages: Vec<String>,
    pub stage_index: usize,
    #[serde(default)]
    pub shared_parameters: serde_json::Value,
    #[serde(default)]
    pub initiating_principal: Option<String>,
}

impl ChainContext {
    pub fn stage_total(&self) -> usize {
        self.stages.len()
    }

    pub fn is_last_stage(&self) -> bool {
        self.stage_index + 1 >= self.stages.len()
    }

    pub fn next_stage(&self) -> Option<&str> {
        self.stages.get(self.stage_index + 1).map(String::as_str)
    }

    /// Context for the following stage, or `None` after the last one.
    pub fn advance(&self) -> Option<ChainContext> {
        self.next_stage()?;
        Some(ChainContext {
            stage_index: self.stage_index + 1,
            ..self.clone()
        })
    }
}

/// Opaque parameters plus context references the core never interprets.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunConfiguration {
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub parent_task_id: Option<String>,
    #[serde(default)]
    pub dataset_id: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub chain: Option<ChainContext>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: String,
    pub job_id: String,
    pub stage_id: String,
    pub status: RunStatus,
    pub configuration: RunConfiguration,
    pub trigger_type: TriggerType,
    pub triggered_by: Option<String>,
    pub external_trigger_id: String,
    pub execution_date: DateTime<Utc>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every save; stale writers get a conflict.
    pub version: i64,
}

/// Logical job row, one per external stage identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub stage_id: String,
    pub name: String,
    pub description: String,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl JobExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobExecutionStatus::Running => "running",
            JobExecutionStatus::Completed => "completed",
            JobExecutionStatus::Failed => "failed",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "running" => Some(JobExecutionStatus::Running),
            "completed" => Some(JobExecutionStatus::Completed),
            "failed" => Some(JobExecutionStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != JobExecutionStatus::Running
    }
}

/// The overarching record of one chain walk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: String,
    pub chain_name: String,
    pub stages: Vec<String>,
    pub status: JobExecutionStatus,
    pub current_index: usize,
    pub initiating_principal: Option<String>,
    pub parameters: serde_json::Value,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable unit of work: trigger `next_stage_id` once `current_run_id` is
/// recorded as successful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainHop {
    pub hop_id: String,
    pub job_execution_id: String,
    pub current_stage_id: String,
    pub current_run_id: String,
    pub next_stage_id: String,
    pub next_stage_index: usize,
    pub due_at: DateTime<Utc>,
    pub attempts: u32,
}
