use anyhow::{Context, Result, bail};
use console::style;
use std::sync::Arc;

use super::{ChainResumeArgs, ChainStartArgs, ContextArgs, RunRefArgs, TriggerArgs};
use crate::core::chain::HopOutcome;
use crate::core::commands::{DATASET_CONTEXT, TASK_CONTEXT, TriggerRunCommand};
use crate::core::config::Config;
use crate::core::error::CoreError;
use crate::core::reconcile::WatchOutcome;
use crate::core::run::{RunStatus, WorkflowRun};
use crate::core::services::Services;
use crate::core::store::{RunStore, SqliteStore};
use crate::core::terminal::{
    GuideSection, print_info, print_run, print_step, print_success, print_warn, styled_status,
};

/// Where command results go: styled lines, or one JSON document.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Output {
    pub json: bool,
}

impl Output {
    fn emit<T: serde::Serialize>(&self, value: &T, styled: impl FnOnce()) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            styled();
        }
        Ok(())
    }

    fn run(&self, run: &WorkflowRun) -> Result<()> {
        self.emit(run, || print_run(run))
    }
}

pub(crate) async fn open_services(config: Config) -> Result<Arc<Services>> {
    let path = config.store_path();
    let store = SqliteStore::open(&path)
        .await
        .with_context(|| format!("opening run store at {}", path.display()))?;
    let store: Arc<dyn RunStore> = Arc::new(store);
    Ok(Arc::new(Services::build(config, store)?))
}

fn parse_params(raw: Option<&str>) -> Result<serde_json::Value> {
    match raw {
        None => Ok(serde_json::json!({})),
        Some(text) => serde_json::from_str(text).context("--params must be a JSON object"),
    }
}

/// Job id from `--job`, or looked up from the stored run.
async fn run_ref(services: &Services, args: RunRefArgs) -> Result<(String, String)> {
    let Some(run_id) = args.run else {
        bail!("--run is required");
    };
    let job_id = match args.job {
        Some(job) => job,
        None => services
            .store
            .load_run(&run_id)
            .await?
            .map(|run| run.job_id)
            .ok_or_else(|| CoreError::not_found("WorkflowRun", &run_id))?,
    };
    Ok((job_id, run_id))
}

pub(crate) async fn trigger(config: Config, args: TriggerArgs, out: Output) -> Result<()> {
    let Some(stage) = args.stage else {
        bail!("--stage is required");
    };
    let services = open_services(config).await?;

    let mut cmd = TriggerRunCommand::new(stage);
    cmd.job_id = args.job;
    cmd.parameters = parse_params(args.params.as_deref())?;
    cmd.principal = args.principal;
    cmd.parent_task_id = args.task;
    cmd.dataset_id = args.dataset;
    cmd.note = args.note;

    let run = services.commands.trigger_run(cmd).await?;
    if !args.watch {
        return out.run(&run);
    }

    if !out.json {
        print_success(&format!("Triggered {}", run.run_id));
        print_step("Watching until the run finishes (Ctrl+C to detach)");
    }
    let outcome = tokio::select! {
        outcome = services.reconciler.watch_run(&run.run_id) => Some(outcome),
        _ = tokio::signal::ctrl_c() => None,
    };
    let latest = services.store.load_run(&run.run_id).await?.unwrap_or(run);
    match outcome {
        Some(WatchOutcome::TimedOut) if !out.json => {
            print_warn("Watch limit reached; the run's outcome is undetermined")
        }
        None if !out.json => print_info("Detached; the daemon keeps tracking the run"),
        _ => {}
    }
    out.run(&latest)
}

pub(crate) async fn status(config: Config, args: RunRefArgs, out: Output) -> Result<()> {
    let services = open_services(config).await?;
    let (job_id, run_id) = run_ref(&services, args).await?;
    let run = services.commands.get_run_status(&job_id, &run_id).await?;
    out.run(&run)?;
    if !out.json
        && let Some(cached) = services.commands.cached_status(&job_id, &run_id)
    {
        print_info(&format!(
            "Last announced: {} at {}",
            cached.event_type,
            cached.updated_at.to_rfc3339()
        ));
    }
    Ok(())
}

pub(crate) async fn stop(config: Config, args: RunRefArgs, out: Output) -> Result<()> {
    let services = open_services(config).await?;
    let (job_id, run_id) = run_ref(&services, args).await?;
    let run = services.commands.stop_run(&job_id, &run_id).await?;
    if !out.json {
        print_success(&format!("Run {} stopped", run.run_id));
    }
    out.run(&run)
}

pub(crate) async fn retry(config: Config, args: RunRefArgs, out: Output) -> Result<()> {
    let services = open_services(config).await?;
    let (job_id, run_id) = run_ref(&services, args).await?;
    let run = services.commands.retry_run(&job_id, &run_id).await?;
    if !out.json {
        print_success(&format!("Run {} queued for retry", run.run_id));
    }
    out.run(&run)
}

pub(crate) async fn list(config: Config, statuses: Vec<RunStatus>, out: Output) -> Result<()> {
    let services = open_services(config).await?;
    let runs = services.store.list_runs_by_status(&statuses).await?;
    out.emit(&runs, || {
        if runs.is_empty() {
            print_info("No runs recorded.");
            return;
        }
        for run in &runs {
            println!(
                "  {:<60} {:<28} {}",
                run.run_id,
                style(&run.stage_id).bold(),
                styled_status(run.status)
            );
        }
    })
}

pub(crate) async fn context_add(config: Config, args: ContextArgs) -> Result<()> {
    let kind = args.kind.unwrap_or_default();
    if kind != TASK_CONTEXT && kind != DATASET_CONTEXT {
        bail!("--kind must be '{}' or '{}'", TASK_CONTEXT, DATASET_CONTEXT);
    }
    let Some(id) = args.id else {
        bail!("--id is required");
    };
    let services = open_services(config).await?;
    services.store.register_context(&kind, &id).await?;
    print_success(&format!("Registered {} {}", kind, id));
    Ok(())
}

pub(crate) fn chain_list(config: Config, out: Output) -> Result<()> {
    out.emit(&config.chains, || {
        let mut section = GuideSection::new("Chains");
        for chain in &config.chains {
            section = section.command(&chain.name, &chain.stages.join(" -> "));
        }
        section.print();
    })
}

pub(crate) async fn chain_start(config: Config, args: ChainStartArgs, out: Output) -> Result<()> {
    let parameters = parse_params(args.params.as_deref())?;
    let services = open_services(config).await?;
    let (execution, run) = services
        .chain
        .start_chain(&args.name, parameters, args.principal)
        .await?;
    out.emit(
        &serde_json::json!({ "execution": execution, "run": run }),
        || {
            print_success(&format!("Chain {} started", execution.chain_name));
            print_info(&format!("Execution {}", execution.id));
            print_run(&run);
            print_info("The daemon advances the chain as each stage finishes.");
        },
    )
}

pub(crate) async fn chain_show(config: Config, execution_id: &str, out: Output) -> Result<()> {
    let services = open_services(config).await?;
    let execution = services
        .store
        .load_job_execution(execution_id)
        .await?
        .ok_or_else(|| CoreError::not_found("JobExecution", execution_id))?;
    out.emit(&execution, || {
        let stage = execution
            .stages
            .get(execution.current_index)
            .map(String::as_str)
            .unwrap_or("-");
        let mut section = GuideSection::new(&format!("Execution {}", execution.id))
            .status("Chain", &execution.chain_name)
            .status("Status", execution.status.as_str())
            .status(
                "Stage",
                &format!(
                    "{}/{} {}",
                    execution.current_index + 1,
                    execution.stages.len(),
                    stage
                ),
            );
        if let Some(error) = &execution.error {
            section = section.status("Error", error);
        }
        section.print();
    })
}

pub(crate) async fn chain_resume(config: Config, args: ChainResumeArgs, out: Output) -> Result<()> {
    let (Some(stage), Some(run), Some(next)) = (args.stage, args.run, args.next) else {
        bail!("--stage, --run and --next are required");
    };
    let index: usize = match args.index {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("--index must be a number, got '{}'", raw))?,
        None => bail!("--index is required"),
    };
    let services = open_services(config).await?;
    match services.chain.resume_hop(&stage, &run, &next, index).await? {
        HopOutcome::Advanced(run) => {
            if !out.json {
                print_success(&format!("Chain advanced to {}", run.stage_id));
            }
            out.run(&run)
        }
        HopOutcome::Skipped(reason) => {
            print_warn(&format!("Nothing to resume: {}", reason));
            Ok(())
        }
        HopOutcome::Halted(reason) => bail!("Chain halted: {}", reason),
    }
}
