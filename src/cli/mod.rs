mod daemon;
mod runs;

use anyhow::{Result, bail};
use console::style;
use std::path::PathBuf;

use crate::core::config::Config;
use crate::core::run::RunStatus;
use crate::core::terminal::{self, GuideSection, print_error};
use crate::logging;

fn print_help() {
    GuideSection::new("Runs")
        .command("trigger --stage <id>", "Trigger a workflow run")
        .command("status --run <id>", "Refresh and show a run's status")
        .command("stop --run <id>", "Stop a run")
        .command("retry --run <id>", "Reset and retry a finished run")
        .command("runs [--status a,b]", "List recorded runs")
        .print();

    GuideSection::new("Chains")
        .command("chain list", "Show configured chains")
        .command("chain start --name <chain>", "Start a chain at its first stage")
        .command("chain show --execution <id>", "Show a chain execution")
        .command("chain resume", "Continue a chain from a successful run")
        .print();

    GuideSection::new("Service")
        .command("daemon", "Reconcile runs and advance chains until Ctrl+C")
        .command("context add", "Register a task or dataset context")
        .print();

    GuideSection::new("Global flags")
        .text("--config <path>          Config file (default: $DAGSYNC_DATA_DIR/dagsync.toml)")
        .text("--json                   Print machine-readable JSON")
        .print();

    println!(
        "\n {} {} <command> [flags]\n",
        style("Usage:").bold(),
        style("dagsync").green()
    );
}

/// Value following the flag at `i`, and the index to continue from.
fn take_value(args: &[String], i: usize) -> (Option<String>, usize) {
    if i + 1 < args.len() {
        (Some(args[i + 1].clone()), i + 2)
    } else {
        (None, i + 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct GlobalFlags {
    pub args: Vec<String>,
    pub config: Option<PathBuf>,
    pub json: bool,
}

/// Strip the flags every command accepts, wherever they appear.
pub(crate) fn parse_global_flags(raw: &[String]) -> GlobalFlags {
    let mut flags = GlobalFlags::default();
    let mut i = 0;
    while i < raw.len() {
        match raw[i].as_str() {
            "--config" | "-c" => {
                let (value, next) = take_value(raw, i);
                flags.config = value.map(PathBuf::from);
                i = next;
            }
            "--json" => {
                flags.json = true;
                i += 1;
            }
            _ => {
                flags.args.push(raw[i].clone());
                i += 1;
            }
        }
    }
    flags
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct TriggerArgs {
    pub stage: Option<String>,
    pub job: Option<String>,
    pub params: Option<String>,
    pub principal: Option<String>,
    pub task: Option<String>,
    pub dataset: Option<String>,
    pub note: Option<String>,
    pub watch: bool,
}

pub(crate) fn parse_trigger_args(args: &[String], start: usize) -> TriggerArgs {
    let mut parsed = TriggerArgs::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--stage" | "-s" => (parsed.stage, i) = take_value(args, i),
            "--job" => (parsed.job, i) = take_value(args, i),
            "--params" | "-p" => (parsed.params, i) = take_value(args, i),
            "--principal" => (parsed.principal, i) = take_value(args, i),
            "--task" => (parsed.task, i) = take_value(args, i),
            "--dataset" => (parsed.dataset, i) = take_value(args, i),
            "--note" => (parsed.note, i) = take_value(args, i),
            "--watch" | "-w" => {
                parsed.watch = true;
                i += 1;
            }
            _ => i += 1,
        }
    }
    parsed
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct RunRefArgs {
    pub job: Option<String>,
    pub run: Option<String>,
}

pub(crate) fn parse_run_ref_args(args: &[String], start: usize) -> RunRefArgs {
    let mut parsed = RunRefArgs::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--job" => (parsed.job, i) = take_value(args, i),
            "--run" | "-r" => (parsed.run, i) = take_value(args, i),
            _ => i += 1,
        }
    }
    parsed
}

/// `--status queued,running`; no flag means every status.
pub(crate) fn parse_status_filter(args: &[String], start: usize) -> Result<Vec<RunStatus>> {
    let mut raw: Option<String> = None;
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--status" => (raw, i) = take_value(args, i),
            _ => i += 1,
        }
    }
    let Some(raw) = raw else {
        return Ok(RunStatus::ALL.to_vec());
    };
    let mut statuses = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match RunStatus::from_status(part) {
            Some(status) => statuses.push(status),
            None => bail!("Unknown run status '{}'", part),
        }
    }
    Ok(statuses)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChainStartArgs {
    pub name: String,
    pub params: Option<String>,
    pub principal: Option<String>,
}

pub(crate) fn parse_chain_start_args(args: &[String], start: usize) -> ChainStartArgs {
    let mut name = "default".to_string();
    let mut params = None;
    let mut principal = None;
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--name" | "-n" => {
                if i + 1 < args.len() {
                    name = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--params" | "-p" => (params, i) = take_value(args, i),
            "--principal" => (principal, i) = take_value(args, i),
            _ => i += 1,
        }
    }
    ChainStartArgs {
        name,
        params,
        principal,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct ChainResumeArgs {
    pub stage: Option<String>,
    pub run: Option<String>,
    pub next: Option<String>,
    pub index: Option<String>,
}

pub(crate) fn parse_chain_resume_args(args: &[String], start: usize) -> ChainResumeArgs {
    let mut parsed = ChainResumeArgs::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--stage" => (parsed.stage, i) = take_value(args, i),
            "--run" => (parsed.run, i) = take_value(args, i),
            "--next" => (parsed.next, i) = take_value(args, i),
            "--index" => (parsed.index, i) = take_value(args, i),
            _ => i += 1,
        }
    }
    parsed
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct ContextArgs {
    pub kind: Option<String>,
    pub id: Option<String>,
}

pub(crate) fn parse_context_args(args: &[String], start: usize) -> ContextArgs {
    let mut parsed = ContextArgs::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--kind" | "-k" => (parsed.kind, i) = take_value(args, i),
            "--id" => (parsed.id, i) = take_value(args, i),
            _ => i += 1,
        }
    }
    parsed
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

pub async fn run_main() -> Result<()> {
    let raw: Vec<String> = std::env::args().collect();
    let globals = parse_global_flags(&raw);
    let args = globals.args;

    if args.len() < 2 || matches!(args[1].as_str(), "help" | "--help" | "-h") {
        print_help();
        return Ok(());
    }

    let config = Config::load(globals.config.as_deref()).await?;
    let cmd = args[1].as_str();
    // one-shot commands keep stdout for their own output
    logging::init(
        logging::resolve_level(&config.logging.level),
        &config.log_path(),
        cmd != "daemon",
    );
    let out = runs::Output { json: globals.json };

    match cmd {
        "daemon" => daemon::run_daemon(config).await,
        "trigger" => runs::trigger(config, parse_trigger_args(&args, 2), out).await,
        "status" => runs::status(config, parse_run_ref_args(&args, 2), out).await,
        "stop" => runs::stop(config, parse_run_ref_args(&args, 2), out).await,
        "retry" => runs::retry(config, parse_run_ref_args(&args, 2), out).await,
        "runs" => runs::list(config, parse_status_filter(&args, 2)?, out).await,
        "chain" => {
            let sub_cmd = if args.len() > 2 { args[2].as_str() } else { "" };
            match sub_cmd {
                "list" => runs::chain_list(config, out),
                "start" => runs::chain_start(config, parse_chain_start_args(&args, 3), out).await,
                "show" => {
                    let Some(id) = flag_value(&args, "--execution") else {
                        bail!("--execution is required");
                    };
                    runs::chain_show(config, &id, out).await
                }
                "resume" => {
                    runs::chain_resume(config, parse_chain_resume_args(&args, 3), out).await
                }
                _ => {
                    print_error("Unknown or missing chain command. Expected: list, start, show, resume");
                    print_help();
                    Ok(())
                }
            }
        }
        "context" => {
            let sub_cmd = if args.len() > 2 { args[2].as_str() } else { "" };
            match sub_cmd {
                "add" => runs::context_add(config, parse_context_args(&args, 3)).await,
                _ => {
                    print_error("Unknown or missing context command. Expected: add");
                    Ok(())
                }
            }
        }
        other => {
            print_help();
            terminal::print_warn("Run 'dagsync help' for the command list.");
            bail!("Unknown command '{}'", other)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        parse_chain_resume_args, parse_chain_start_args, parse_context_args, parse_global_flags,
        parse_run_ref_args, parse_status_filter, parse_trigger_args,
    };
    use crate::core::run::RunStatus;
    use std::path::PathBuf;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn global_flags_are_stripped_anywhere() {
        let flags = parse_global_flags(&argv(&[
            "dagsync", "status", "--json", "--run", "r1", "--config", "/etc/dagsync.toml",
        ]));
        assert!(flags.json);
        assert_eq!(flags.config, Some(PathBuf::from("/etc/dagsync.toml")));
        assert_eq!(flags.args, argv(&["dagsync", "status", "--run", "r1"]));
    }

    #[test]
    fn parse_trigger_args_reads_every_flag() {
        let args = argv(&[
            "dagsync",
            "trigger",
            "--stage",
            "etl",
            "--params",
            r#"{"a":1}"#,
            "--task",
            "t-1",
            "--dataset",
            "d-1",
            "--note",
            "nightly",
            "--watch",
        ]);
        let parsed = parse_trigger_args(&args, 2);
        assert_eq!(parsed.stage.as_deref(), Some("etl"));
        assert_eq!(parsed.params.as_deref(), Some(r#"{"a":1}"#));
        assert_eq!(parsed.task.as_deref(), Some("t-1"));
        assert_eq!(parsed.dataset.as_deref(), Some("d-1"));
        assert_eq!(parsed.note.as_deref(), Some("nightly"));
        assert!(parsed.watch);
        assert!(parsed.job.is_none());
    }

    #[test]
    fn trailing_flag_without_value_is_ignored() {
        let parsed = parse_run_ref_args(&argv(&["dagsync", "stop", "--run"]), 2);
        assert!(parsed.run.is_none());

        let parsed = parse_run_ref_args(&argv(&["dagsync", "stop", "--job", "j", "--run", "r"]), 2);
        assert_eq!(parsed.job.as_deref(), Some("j"));
        assert_eq!(parsed.run.as_deref(), Some("r"));
    }

    #[test]
    fn status_filter_defaults_to_everything_and_rejects_unknown_words() {
        let all = parse_status_filter(&argv(&["dagsync", "runs"]), 2).unwrap();
        assert_eq!(all.len(), RunStatus::ALL.len());

        let some =
            parse_status_filter(&argv(&["dagsync", "runs", "--status", "queued, running"]), 2)
                .unwrap();
        assert_eq!(some, vec![RunStatus::Queued, RunStatus::Running]);

        assert!(parse_status_filter(&argv(&["dagsync", "runs", "--status", "done"]), 2).is_err());
    }

    #[test]
    fn chain_args_parse() {
        let start = parse_chain_start_args(&argv(&["dagsync", "chain", "start"]), 3);
        assert_eq!(start.name, "default");

        let resume = parse_chain_resume_args(
            &argv(&[
                "dagsync", "chain", "resume", "--stage", "a", "--run", "r1", "--next", "b",
                "--index", "1",
            ]),
            3,
        );
        assert_eq!(resume.stage.as_deref(), Some("a"));
        assert_eq!(resume.run.as_deref(), Some("r1"));
        assert_eq!(resume.next.as_deref(), Some("b"));
        assert_eq!(resume.index.as_deref(), Some("1"));
    }

    #[test]
    fn context_args_parse() {
        let parsed = parse_context_args(
            &argv(&["dagsync", "context", "add", "--kind", "task", "--id", "t-9"]),
            3,
        );
        assert_eq!(parsed.kind.as_deref(), Some("task"));
        assert_eq!(parsed.id.as_deref(), Some("t-9"));
    }
}
