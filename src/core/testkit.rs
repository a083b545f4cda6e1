//! Wiring shared by component tests: scripted orchestrator, in-memory store
//! and a recording sink behind a real publisher.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::core::chain::{ChainController, ChainDefinition, ChainRegistry, TerminalRunHandler};
use crate::core::commands::RunCommands;
use crate::core::config::{CleanupConfig, ReconcileConfig};
use crate::core::events::{Event, EventPublisher, EventSink, EventType, RecordingSink, StatusCache};
use crate::core::orchestrator::OrchestratorClient;
use crate::core::orchestrator::scripted::ScriptedOrchestrator;
use crate::core::reconcile::{Reconciler, WatchRequest};
use crate::core::run::WorkflowRun;
use crate::core::store::{RunStore, SqliteStore};

pub struct Fixture {
    pub orchestrator: Arc<ScriptedOrchestrator>,
    pub store: Arc<SqliteStore>,
    pub sink: Arc<RecordingSink>,
    pub publisher: Arc<EventPublisher>,
    pub commands: Arc<RunCommands>,
}

impl Fixture {
    pub fn new() -> Self {
        let orchestrator = Arc::new(ScriptedOrchestrator::new());
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let sink = Arc::new(RecordingSink::default());
        let publisher = Arc::new(EventPublisher::new(
            "dagsync",
            vec![sink.clone() as Arc<dyn EventSink>],
            Arc::new(StatusCache::new(Duration::from_secs(3600))),
        ));
        let commands = Arc::new(RunCommands::new(
            orchestrator.clone() as Arc<dyn OrchestratorClient>,
            store.clone() as Arc<dyn RunStore>,
            publisher.clone(),
        ));
        Self {
            orchestrator,
            store,
            sink,
            publisher,
            commands,
        }
    }

    pub fn store_dyn(&self) -> Arc<dyn RunStore> {
        self.store.clone()
    }

    pub fn client_dyn(&self) -> Arc<dyn OrchestratorClient> {
        self.orchestrator.clone()
    }

    /// Chain controller for `stages` (chain name "test"), attached to the
    /// commands as their terminal handler.
    pub fn chain(
        &self,
        stages: &[&str],
    ) -> (Arc<ChainController>, mpsc::UnboundedReceiver<WatchRequest>) {
        let registry = ChainRegistry::new(&[ChainDefinition {
            name: "test".to_string(),
            stages: stages.iter().map(|s| s.to_string()).collect(),
        }]);
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = Arc::new(ChainController::new(
            self.store_dyn(),
            self.publisher.clone(),
            self.commands.clone(),
            registry,
            tx,
            Duration::from_secs(30),
        ));
        let weak: std::sync::Weak<dyn TerminalRunHandler> =
            Arc::downgrade(&(controller.clone() as Arc<dyn TerminalRunHandler>));
        self.commands.attach_terminal_handler(weak);
        (controller, rx)
    }

    pub fn reconciler(
        &self,
        settings: ReconcileConfig,
        terminal: Option<Arc<dyn TerminalRunHandler>>,
    ) -> Arc<Reconciler> {
        Arc::new(Reconciler::new(
            self.client_dyn(),
            self.store_dyn(),
            self.publisher.clone(),
            terminal,
            settings,
            CleanupConfig::default(),
        ))
    }

    pub async fn run(&self, run_id: &str) -> WorkflowRun {
        self.store.load_run(run_id).await.unwrap().unwrap()
    }

    pub fn global_events(&self) -> Vec<Event> {
        self.sink.events_on("dagsync:global")
    }

    pub fn count(&self, event_type: EventType) -> usize {
        self.global_events()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}
