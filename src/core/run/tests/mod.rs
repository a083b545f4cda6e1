mod properties;

use chrono::{DateTime, TimeZone, Utc};

use crate::core::run::{RunConfiguration, RunStatus, TriggerType, WorkflowRun};

pub(super) fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub(super) fn sample_run(status: RunStatus) -> WorkflowRun {
    WorkflowRun {
        run_id: "dagsync__etl__20240501T100000__abcd1234".to_string(),
        job_id: "job-etl".to_string(),
        stage_id: "etl".to_string(),
        status,
        configuration: RunConfiguration::default(),
        trigger_type: TriggerType::Manual,
        triggered_by: Some("alice".to_string()),
        external_trigger_id: "dagsync__etl__20240501T100000__abcd1234".to_string(),
        execution_date: at(0),
        start_date: None,
        end_date: None,
        created_at: at(0),
        updated_at: at(0),
        version: 1,
    }
}
