use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use tokio::sync::Mutex;
use tracing::info;

use super::RunStore;
use crate::core::error::{CoreError, CoreResult};
use crate::core::resilience::{RetryPolicy, retry_blocking};
use crate::core::run::{
    ChainHop, Job, JobExecution, JobExecutionStatus, RunConfiguration, RunStatus, TriggerType,
    WorkflowRun,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS workflow_runs (
    run_id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL,
    stage_id TEXT NOT NULL,
    status TEXT NOT NULL,
    configuration_json TEXT NOT NULL,
    trigger_type TEXT NOT NULL,
    triggered_by TEXT,
    external_trigger_id TEXT NOT NULL,
    execution_date TEXT NOT NULL,
    start_date TEXT,
    end_date TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_workflow_runs_status ON workflow_runs(status);

CREATE TABLE IF NOT EXISTS jobs (
    job_id TEXT PRIMARY KEY,
    stage_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    created_by TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS run_contexts (
    kind TEXT NOT NULL,
    id TEXT NOT NULL,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (kind, id)
);

CREATE TABLE IF NOT EXISTS job_executions (
    id TEXT PRIMARY KEY,
    chain_name TEXT NOT NULL,
    stages_json TEXT NOT NULL,
    status TEXT NOT NULL,
    current_index INTEGER NOT NULL,
    initiating_principal TEXT,
    parameters_json TEXT NOT NULL,
    error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chain_hops (
    hop_id TEXT PRIMARY KEY,
    job_execution_id TEXT NOT NULL,
    current_stage_id TEXT NOT NULL,
    current_run_id TEXT NOT NULL,
    next_stage_id TEXT NOT NULL,
    next_stage_index INTEGER NOT NULL,
    due_at TEXT NOT NULL,
    claimed_until TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    completed INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_chain_hops_due ON chain_hops(completed, due_at);
";

const RUN_COLUMNS: &str = "run_id, job_id, stage_id, status, configuration_json, trigger_type, \
     triggered_by, external_trigger_id, execution_date, start_date, end_date, created_at, \
     updated_at, version";

const HOP_COLUMNS: &str = "hop_id, job_execution_id, current_stage_id, current_run_id, \
     next_stage_id, next_stage_index, due_at, attempts";

/// Fixed-width UTC text so string order matches time order.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp {}: {}", raw, e)))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| parse_ts(idx, &r)).transpose()
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e.to_string()))
}

fn index_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<usize> {
    let raw: i64 = row.get(idx)?;
    usize::try_from(raw).map_err(|e| conversion_error(idx, e.to_string()))
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<WorkflowRun> {
    let status: String = row.get(3)?;
    let trigger: String = row.get(5)?;
    Ok(WorkflowRun {
        run_id: row.get(0)?,
        job_id: row.get(1)?,
        stage_id: row.get(2)?,
        status: RunStatus::from_status(&status)
            .ok_or_else(|| conversion_error(3, format!("unknown run status {}", status)))?,
        configuration: json_col::<RunConfiguration>(row, 4)?,
        trigger_type: TriggerType::parse(&trigger)
            .ok_or_else(|| conversion_error(5, format!("unknown trigger type {}", trigger)))?,
        triggered_by: row.get(6)?,
        external_trigger_id: row.get(7)?,
        execution_date: ts_col(row, 8)?,
        start_date: opt_ts_col(row, 9)?,
        end_date: opt_ts_col(row, 10)?,
        created_at: ts_col(row, 11)?,
        updated_at: ts_col(row, 12)?,
        version: row.get(13)?,
    })
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        job_id: row.get(0)?,
        stage_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        created_by: row.get(4)?,
        created_at: ts_col(row, 5)?,
    })
}

fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<JobExecution> {
    let status: String = row.get(3)?;
    Ok(JobExecution {
        id: row.get(0)?,
        chain_name: row.get(1)?,
        stages: json_col(row, 2)?,
        status: JobExecutionStatus::from_status(&status)
            .ok_or_else(|| conversion_error(3, format!("unknown execution status {}", status)))?,
        current_index: index_col(row, 4)?,
        initiating_principal: row.get(5)?,
        parameters: json_col(row, 6)?,
        error: row.get(7)?,
        created_at: ts_col(row, 8)?,
        updated_at: ts_col(row, 9)?,
    })
}

fn row_to_hop(row: &Row<'_>) -> rusqlite::Result<ChainHop> {
    let attempts: i64 = row.get(7)?;
    Ok(ChainHop {
        hop_id: row.get(0)?,
        job_execution_id: row.get(1)?,
        current_stage_id: row.get(2)?,
        current_run_id: row.get(3)?,
        next_stage_id: row.get(4)?,
        next_stage_index: index_col(row, 5)?,
        due_at: ts_col(row, 6)?,
        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
    })
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}

pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| CoreError::Persistence(format!("{}: {}", parent.display(), e)))?;
            }
        }
        // another dagsync process may hold the schema lock for a moment
        let policy = RetryPolicy::new(3, Duration::from_millis(200), 2.0, Duration::from_secs(1), 0.0);
        let owned = path.to_path_buf();
        let db = tokio::task::spawn_blocking(move || {
            retry_blocking(&policy, "open run store", is_busy, || {
                let db = Connection::open(&owned)?;
                db.busy_timeout(Duration::from_secs(5))?;
                db.execute_batch(SCHEMA)?;
                Ok::<_, rusqlite::Error>(db)
            })
        })
        .await
        .map_err(|e| CoreError::Persistence(format!("open run store: {}", e)))??;
        info!("Opened run store at {}", path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    pub fn open_in_memory() -> CoreResult<Self> {
        let db = Connection::open_in_memory()?;
        db.execute_batch(SCHEMA)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }
}

#[async_trait]
impl RunStore for SqliteStore {
    async fn load_run(&self, run_id: &str) -> CoreResult<Option<WorkflowRun>> {
        let db = self.db.lock().await;
        let sql = format!("SELECT {} FROM workflow_runs WHERE run_id = ?1", RUN_COLUMNS);
        let run = db
            .query_row(&sql, params![run_id], row_to_run)
            .optional()?;
        Ok(run)
    }

    async fn insert_run(&self, run: &WorkflowRun) -> CoreResult<()> {
        let configuration = serde_json::to_string(&run.configuration)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO workflow_runs (run_id, job_id, stage_id, status, configuration_json,
                trigger_type, triggered_by, external_trigger_id, execution_date, start_date,
                end_date, created_at, updated_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                run.run_id,
                run.job_id,
                run.stage_id,
                run.status.as_str(),
                configuration,
                run.trigger_type.as_str(),
                run.triggered_by,
                run.external_trigger_id,
                fmt_ts(run.execution_date),
                run.start_date.map(fmt_ts),
                run.end_date.map(fmt_ts),
                fmt_ts(run.created_at),
                fmt_ts(run.updated_at),
                run.version,
            ],
        )?;
        Ok(())
    }

    async fn save_run(&self, run: &WorkflowRun) -> CoreResult<WorkflowRun> {
        let configuration = serde_json::to_string(&run.configuration)?;
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE workflow_runs
             SET status = ?1, configuration_json = ?2, start_date = ?3, end_date = ?4,
                 updated_at = ?5, version = version + 1
             WHERE run_id = ?6 AND version = ?7",
            params![
                run.status.as_str(),
                configuration,
                run.start_date.map(fmt_ts),
                run.end_date.map(fmt_ts),
                fmt_ts(run.updated_at),
                run.run_id,
                run.version,
            ],
        )?;
        if rows == 0 {
            let exists: Option<i64> = db
                .query_row(
                    "SELECT version FROM workflow_runs WHERE run_id = ?1",
                    params![run.run_id],
                    |row| row.get(0),
                )
                .optional()?;
            return Err(match exists {
                Some(_) => CoreError::Conflict {
                    run_id: run.run_id.clone(),
                },
                None => CoreError::not_found("WorkflowRun", &run.run_id),
            });
        }
        let mut saved = run.clone();
        saved.version += 1;
        Ok(saved)
    }

    async fn list_runs_by_status(&self, statuses: &[RunStatus]) -> CoreResult<Vec<WorkflowRun>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM workflow_runs WHERE status IN ({}) ORDER BY created_at ASC",
            RUN_COLUMNS, placeholders
        );
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(statuses.iter().map(|s| s.as_str())), row_to_run)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn list_runs_for_execution(&self, execution_id: &str) -> CoreResult<Vec<WorkflowRun>> {
        let sql = format!(
            "SELECT {} FROM workflow_runs
             WHERE json_extract(configuration_json, '$.chain.job_execution_id') = ?1
             ORDER BY created_at ASC",
            RUN_COLUMNS
        );
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params![execution_id], row_to_run)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn list_terminal_runs_before(&self, cutoff: DateTime<Utc>) -> CoreResult<Vec<WorkflowRun>> {
        let sql = format!(
            "SELECT {} FROM workflow_runs
             WHERE status IN ('success', 'failed', 'upstream_failed', 'skipped', 'removed')
               AND end_date IS NOT NULL AND end_date < ?1
             ORDER BY end_date ASC",
            RUN_COLUMNS
        );
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params![fmt_ts(cutoff)], row_to_run)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn load_job(&self, job_id: &str) -> CoreResult<Option<Job>> {
        let db = self.db.lock().await;
        let job = db
            .query_row(
                "SELECT job_id, stage_id, name, description, created_by, created_at
                 FROM jobs WHERE job_id = ?1",
                params![job_id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    async fn load_job_by_stage_id(&self, stage_id: &str) -> CoreResult<Option<Job>> {
        let db = self.db.lock().await;
        let job = db
            .query_row(
                "SELECT job_id, stage_id, name, description, created_by, created_at
                 FROM jobs WHERE stage_id = ?1",
                params![stage_id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    async fn create_job(&self, job: &Job) -> CoreResult<Job> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT OR IGNORE INTO jobs (job_id, stage_id, name, description, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                job.job_id,
                job.stage_id,
                job.name,
                job.description,
                job.created_by,
                fmt_ts(job.created_at),
            ],
        )?;
        let stored = db.query_row(
            "SELECT job_id, stage_id, name, description, created_by, created_at
             FROM jobs WHERE stage_id = ?1",
            params![job.stage_id],
            row_to_job,
        )?;
        Ok(stored)
    }

    async fn context_exists(&self, kind: &str, id: &str) -> CoreResult<bool> {
        let db = self.db.lock().await;
        let found: Option<i64> = db
            .query_row(
                "SELECT 1 FROM run_contexts WHERE kind = ?1 AND id = ?2",
                params![kind, id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    async fn register_context(&self, kind: &str, id: &str) -> CoreResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT OR IGNORE INTO run_contexts (kind, id) VALUES (?1, ?2)",
            params![kind, id],
        )?;
        Ok(())
    }

    async fn create_job_execution(&self, execution: &JobExecution) -> CoreResult<()> {
        let stages = serde_json::to_string(&execution.stages)?;
        let parameters = serde_json::to_string(&execution.parameters)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO job_executions (id, chain_name, stages_json, status, current_index,
                initiating_principal, parameters_json, error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                execution.id,
                execution.chain_name,
                stages,
                execution.status.as_str(),
                execution.current_index as i64,
                execution.initiating_principal,
                parameters,
                execution.error,
                fmt_ts(execution.created_at),
                fmt_ts(execution.updated_at),
            ],
        )?;
        Ok(())
    }

    async fn load_job_execution(&self, id: &str) -> CoreResult<Option<JobExecution>> {
        let db = self.db.lock().await;
        let execution = db
            .query_row(
                "SELECT id, chain_name, stages_json, status, current_index, initiating_principal,
                        parameters_json, error, created_at, updated_at
                 FROM job_executions WHERE id = ?1",
                params![id],
                row_to_execution,
            )
            .optional()?;
        Ok(execution)
    }

    async fn list_running_job_executions(&self) -> CoreResult<Vec<JobExecution>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, chain_name, stages_json, status, current_index, initiating_principal,
                    parameters_json, error, created_at, updated_at
             FROM job_executions WHERE status = 'running' ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], row_to_execution)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn set_job_execution_status(
        &self,
        id: &str,
        status: JobExecutionStatus,
        current_index: Option<usize>,
        error: Option<&str>,
    ) -> CoreResult<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE job_executions
             SET status = ?1, current_index = COALESCE(?2, current_index),
                 error = COALESCE(?3, error), updated_at = ?4
             WHERE id = ?5 AND status = 'running'",
            params![
                status.as_str(),
                current_index.map(|i| i as i64),
                error,
                fmt_ts(Utc::now()),
                id,
            ],
        )?;
        Ok(rows > 0)
    }

    async fn enqueue_hop(&self, hop: &ChainHop) -> CoreResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT OR IGNORE INTO chain_hops (hop_id, job_execution_id, current_stage_id, current_run_id,
                next_stage_id, next_stage_index, due_at, attempts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                hop.hop_id,
                hop.job_execution_id,
                hop.current_stage_id,
                hop.current_run_id,
                hop.next_stage_id,
                hop.next_stage_index as i64,
                fmt_ts(hop.due_at),
                hop.attempts,
            ],
        )?;
        Ok(())
    }

    async fn claim_due_hops(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> CoreResult<Vec<ChainHop>> {
        let now_s = fmt_ts(now);
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| CoreError::validation("lease", e.to_string()))?;
        let until = fmt_ts(now + lease);

        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let claimed = {
            let sql = format!(
                "SELECT {} FROM chain_hops
                 WHERE completed = 0 AND due_at <= ?1
                   AND (claimed_until IS NULL OR claimed_until <= ?1)
                 ORDER BY due_at ASC LIMIT ?2",
                HOP_COLUMNS
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(params![now_s, limit as i64], row_to_hop)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };
        for hop in &claimed {
            tx.execute(
                "UPDATE chain_hops SET claimed_until = ?1, attempts = attempts + 1 WHERE hop_id = ?2",
                params![until, hop.hop_id],
            )?;
        }
        tx.commit()?;

        Ok(claimed
            .into_iter()
            .map(|mut hop| {
                hop.attempts = hop.attempts.saturating_add(1);
                hop
            })
            .collect())
    }

    async fn complete_hop(&self, hop_id: &str) -> CoreResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE chain_hops SET completed = 1, claimed_until = NULL WHERE hop_id = ?1",
            params![hop_id],
        )?;
        Ok(())
    }

    async fn release_hop(&self, hop_id: &str, retry_at: DateTime<Utc>) -> CoreResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE chain_hops SET claimed_until = NULL, due_at = ?1 WHERE hop_id = ?2",
            params![fmt_ts(retry_at), hop_id],
        )?;
        Ok(())
    }

    async fn list_pending_hops(&self) -> CoreResult<Vec<ChainHop>> {
        let sql = format!(
            "SELECT {} FROM chain_hops WHERE completed = 0 ORDER BY due_at ASC",
            HOP_COLUMNS
        );
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_hop)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
