use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::client::{
    ExternalRunHandle, ExternalRunState, ExternalState, OrchestratorClient, SubTaskState,
};
use crate::core::config::OrchestratorConfig;
use crate::core::error::{CoreError, CoreResult};

#[derive(Deserialize)]
struct DagRunBody {
    #[serde(default)]
    dag_run_id: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    execution_date: Option<String>,
    #[serde(default)]
    logical_date: Option<String>,
    #[serde(default)]
    start_date: Option<String>,
    #[serde(default)]
    end_date: Option<String>,
}

#[derive(Deserialize)]
struct TaskInstancesBody {
    #[serde(default)]
    task_instances: Vec<TaskInstanceBody>,
}

#[derive(Deserialize)]
struct TaskInstanceBody {
    task_id: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    start_date: Option<String>,
    #[serde(default)]
    end_date: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    hostname: Option<String>,
}

fn parse_ts(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn state_of(raw: Option<&str>) -> ExternalState {
    // Airflow reports a null state for runs it has accepted but not queued
    raw.map(ExternalState::from).unwrap_or(ExternalState::Queued)
}

impl DagRunBody {
    fn execution_date(&self) -> Option<DateTime<Utc>> {
        parse_ts(self.execution_date.as_deref().or(self.logical_date.as_deref()))
    }

    fn into_state(self) -> ExternalRunState {
        ExternalRunState {
            execution_date: self.execution_date(),
            state: state_of(self.state.as_deref()),
            start_date: parse_ts(self.start_date.as_deref()),
            end_date: parse_ts(self.end_date.as_deref()),
        }
    }
}

/// Airflow-style REST client with basic auth.
pub struct HttpOrchestrator {
    client: Client,
    base: Url,
    username: String,
    password: String,
    service: String,
}

impl HttpOrchestrator {
    pub fn new(cfg: &OrchestratorConfig) -> CoreResult<Self> {
        let raw = format!("{}{}", cfg.base_url.trim_end_matches('/'), cfg.api_prefix);
        let base = Url::parse(&raw)
            .map_err(|e| CoreError::validation("orchestrator.base_url", e.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(CoreError::validation(
                "orchestrator.base_url",
                format!("{} cannot carry a path", raw),
            ));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| CoreError::external(&cfg.service_name, e.to_string()))?;
        Ok(Self {
            client,
            base,
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            service: cfg.service_name.clone(),
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn transport(&self, e: reqwest::Error) -> CoreError {
        CoreError::external(&self.service, e.to_string())
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
    ) -> CoreResult<reqwest::Response> {
        debug!("{} {}", method, url);
        let mut req = self
            .client
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password));
        if let Some(body) = body {
            req = req.json(&body);
        }
        req.send().await.map_err(|e| self.transport(e))
    }

    async fn expect_success(&self, what: &str, res: reqwest::Response) -> CoreResult<reqwest::Response> {
        if res.status().is_success() {
            return Ok(res);
        }
        let status = res.status();
        let text = res.text().await.unwrap_or_default();
        Err(CoreError::external(
            &self.service,
            format!("{} returned {}: {}", what, status, text),
        ))
    }
}

#[async_trait]
impl OrchestratorClient for HttpOrchestrator {
    async fn trigger(
        &self,
        stage_id: &str,
        run_id: &str,
        parameters: &serde_json::Value,
    ) -> CoreResult<ExternalRunHandle> {
        let url = self.url(&["dags", stage_id, "dagRuns"]);
        let body = json!({ "dag_run_id": run_id, "conf": parameters });
        let res = self.send(Method::POST, url, Some(body)).await?;

        // Already triggered under this id: report the existing run
        if res.status() == StatusCode::CONFLICT {
            let existing = self.query(stage_id, run_id).await?;
            return Ok(ExternalRunHandle {
                run_id: run_id.to_string(),
                stage_id: stage_id.to_string(),
                execution_date: existing.execution_date,
                state: existing.state,
            });
        }

        let res = self.expect_success("trigger", res).await?;
        let body: DagRunBody = res.json().await.map_err(|e| self.transport(e))?;
        Ok(ExternalRunHandle {
            run_id: body.dag_run_id.clone().unwrap_or_else(|| run_id.to_string()),
            stage_id: stage_id.to_string(),
            execution_date: body.execution_date(),
            state: state_of(body.state.as_deref()),
        })
    }

    async fn query(&self, stage_id: &str, run_id: &str) -> CoreResult<ExternalRunState> {
        let url = self.url(&["dags", stage_id, "dagRuns", run_id]);
        let res = self.send(Method::GET, url, None).await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(ExternalRunState::bare(ExternalState::Removed));
        }
        let res = self.expect_success("query", res).await?;
        let body: DagRunBody = res.json().await.map_err(|e| self.transport(e))?;
        Ok(body.into_state())
    }

    async fn list_sub_tasks(&self, stage_id: &str, run_id: &str) -> CoreResult<Vec<SubTaskState>> {
        let url = self.url(&["dags", stage_id, "dagRuns", run_id, "taskInstances"]);
        let res = self.send(Method::GET, url, None).await?;
        let res = self.expect_success("list_sub_tasks", res).await?;
        let body: TaskInstancesBody = res.json().await.map_err(|e| self.transport(e))?;
        Ok(body
            .task_instances
            .into_iter()
            .map(|t| SubTaskState {
                state: state_of(t.state.as_deref()),
                start_date: parse_ts(t.start_date.as_deref()),
                end_date: parse_ts(t.end_date.as_deref()),
                duration_secs: t.duration,
                hostname: t.hostname.filter(|h| !h.is_empty()),
                task_id: t.task_id,
            })
            .collect())
    }

    async fn cancel(&self, stage_id: &str, run_id: &str) -> CoreResult<()> {
        let url = self.url(&["dags", stage_id, "dagRuns", run_id]);
        let res = self
            .send(Method::PATCH, url, Some(json!({ "state": "failed" })))
            .await?;
        self.expect_success("cancel", res).await?;
        Ok(())
    }

    async fn reset(&self, stage_id: &str, run_id: &str) -> CoreResult<()> {
        let url = self.url(&["dags", stage_id, "clearTaskInstances"]);
        let body = json!({
            "dry_run": false,
            "dag_run_id": run_id,
            "reset_dag_runs": true,
            "task_ids": [],
        });
        let res = self.send(Method::POST, url, Some(body)).await?;
        self.expect_success("reset", res).await?;
        Ok(())
    }
}
