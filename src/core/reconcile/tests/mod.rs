
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::core::chain::TerminalRunHandler;
use crate::core::commands::TriggerRunCommand;
use crate::core::config::ReconcileConfig;
use crate::core::error::CoreResult;
use crate::core::run::{RunStatus, WorkflowRun};
use crate::core::testkit::Fixture;

pub(super) fn settings(poll_secs: u64, max_watch_secs: u64) -> ReconcileConfig {
    ReconcileConfig {
        poll_interval_secs: poll_secs,
        max_watch_secs,
        ..ReconcileConfig::default()
    }
}

pub(super) async fn queued_run(fx: &Fixture, stage: &str) -> WorkflowRun {
    fx.commands
        .trigger_run(TriggerRunCommand::new(stage))
        .await
        .unwrap()
}

#[derive(Default)]
pub(super) struct Handoffs {
    pub seen: Mutex<Vec<(String, RunStatus)>>,
}

#[async_trait]
impl TerminalRunHandler for Handoffs {
    async fn on_run_terminal(&self, run: &WorkflowRun) -> CoreResult<()> {
        self.seen
            .lock()
            .unwrap()
            .push((run.run_id.clone(), run.status));
        Ok(())
    }
}

impl Handoffs {
    pub fn shared() -> (Arc<Self>, Option<Arc<dyn TerminalRunHandler>>) {
        let handoffs = Arc::new(Self::default());
        let dyn_handler: Arc<dyn TerminalRunHandler> = handoffs.clone();
        (handoffs, Some(dyn_handler))
    }
}
