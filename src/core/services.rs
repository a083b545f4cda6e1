//! Process-wide wiring. Everything is constructed once here and handed to
//! its users explicitly.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::core::chain::{ChainController, ChainRegistry, TerminalRunHandler};
use crate::core::commands::RunCommands;
use crate::core::config::Config;
use crate::core::error::CoreResult;
use crate::core::events::{BroadcastHub, EventPublisher, EventSink, JsonlSink, StatusCache};
use crate::core::orchestrator::{GuardedOrchestrator, HttpOrchestrator, OrchestratorClient};
use crate::core::reconcile::{CleanupReport, Reconciler, WatchRequest};
use crate::core::resilience::BreakerRegistry;
use crate::core::store::RunStore;

pub const EVENTS_FILE: &str = "events.jsonl";

pub struct Services {
    pub config: Config,
    pub store: Arc<dyn RunStore>,
    pub breakers: Arc<BreakerRegistry>,
    pub hub: Arc<BroadcastHub>,
    pub publisher: Arc<EventPublisher>,
    pub commands: Arc<RunCommands>,
    pub chain: Arc<ChainController>,
    pub reconciler: Arc<Reconciler>,
    watch_intake: Mutex<Option<mpsc::UnboundedReceiver<WatchRequest>>>,
}

impl Services {
    /// HTTP client behind retry and the dependency's circuit breaker.
    pub fn build(config: Config, store: Arc<dyn RunStore>) -> CoreResult<Self> {
        let breakers = Arc::new(BreakerRegistry::new());
        let breaker = breakers.get_or_create(
            &config.orchestrator.service_name,
            config.breaker.failure_threshold,
            Duration::from_secs(config.breaker.recovery_timeout_secs),
        );
        let http = HttpOrchestrator::new(&config.orchestrator)?;
        let client: Arc<dyn OrchestratorClient> =
            Arc::new(GuardedOrchestrator::new(http, breaker, config.retry.policy()));
        Ok(Self::assemble(config, store, client, breakers))
    }

    pub fn assemble(
        config: Config,
        store: Arc<dyn RunStore>,
        client: Arc<dyn OrchestratorClient>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        let hub = Arc::new(BroadcastHub::new(config.events.channel_capacity));
        let cache = Arc::new(StatusCache::new(Duration::from_secs(
            config.events.cache_ttl_secs,
        )));
        let global = format!("{}:global", config.events.channel_prefix);
        let journal = Arc::new(JsonlSink::new(config.data_dir.join(EVENTS_FILE), global));
        let sinks = vec![
            hub.clone() as Arc<dyn EventSink>,
            journal as Arc<dyn EventSink>,
        ];
        let publisher = Arc::new(EventPublisher::new(
            config.events.channel_prefix.clone(),
            sinks,
            cache,
        ));

        let commands = Arc::new(RunCommands::new(
            client.clone(),
            store.clone(),
            publisher.clone(),
        ));

        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        let chain = Arc::new(ChainController::new(
            store.clone(),
            publisher.clone(),
            commands.clone(),
            ChainRegistry::new(&config.chains),
            watch_tx,
            Duration::from_secs(config.chain.hop_start_delay_secs),
        ));
        let terminal: Arc<dyn TerminalRunHandler> = chain.clone();
        commands.attach_terminal_handler(Arc::downgrade(&terminal));

        let reconciler = Arc::new(Reconciler::new(
            client,
            store.clone(),
            publisher.clone(),
            Some(terminal),
            config.reconcile.clone(),
            config.cleanup.clone(),
        ));

        Self {
            config,
            store,
            breakers,
            hub,
            publisher,
            commands,
            chain,
            reconciler,
            watch_intake: Mutex::new(Some(watch_rx)),
        }
    }

    /// Route chain watch requests into the reconciler. Only the first call
    /// starts the intake.
    pub fn start_watch_intake(&self) -> Option<JoinHandle<()>> {
        let rx = self
            .watch_intake
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()?;
        info!("Watch intake started");
        Some(self.reconciler.clone().serve_watch_requests(rx))
    }

    /// Periodic housekeeping: status cache, finished watches and broadcast
    /// channels nobody listens to any more.
    pub async fn cleanup(&self) -> CoreResult<CleanupReport> {
        let report = self.reconciler.cleanup().await?;
        let pruned = self.hub.prune_idle();
        if pruned > 0 {
            debug!("Dropped {} idle event channels", pruned);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::orchestrator::ExternalState;
    use crate::core::orchestrator::scripted::ScriptedOrchestrator;
    use crate::core::store::SqliteStore;

    fn services(dir: &std::path::Path) -> (Services, Arc<ScriptedOrchestrator>) {
        let orchestrator = Arc::new(ScriptedOrchestrator::new());
        let store: Arc<dyn RunStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let services = Services::assemble(
            Config::with_data_dir(dir),
            store,
            orchestrator.clone(),
            Arc::new(BreakerRegistry::new()),
        );
        (services, orchestrator)
    }

    #[test]
    fn build_registers_the_orchestrator_breaker() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn RunStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let services = Services::build(Config::with_data_dir(dir.path()), store).unwrap();
        let snapshots = services.breakers.snapshots();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].name, "airflow");
    }

    #[tokio::test]
    async fn chained_completion_flows_through_the_wiring() {
        let dir = tempfile::tempdir().unwrap();
        let (services, orchestrator) = services(dir.path());
        let mut global = services.hub.subscribe("dagsync:global");

        let (_, run) = services
            .chain
            .start_chain("default", serde_json::json!({}), None)
            .await
            .unwrap();
        assert_eq!(global.recv().await.unwrap().run_id.as_deref(), Some(run.run_id.as_str()));

        orchestrator.push_query_state(&run.run_id, ExternalState::Success);
        services
            .commands
            .get_run_status(&run.job_id, &run.run_id)
            .await
            .unwrap();
        assert_eq!(services.chain.process_due_hops().await.unwrap(), 1);
        assert_eq!(orchestrator.triggers_for("ml_training_pipeline").len(), 1);

        let lines = std::fs::read_to_string(dir.path().join(EVENTS_FILE)).unwrap();
        assert_eq!(lines.lines().count(), 3);
    }

    #[tokio::test]
    async fn cleanup_drops_channels_without_listeners() {
        let dir = tempfile::tempdir().unwrap();
        let (services, _) = services(dir.path());
        let _global = services.hub.subscribe("dagsync:global");
        let run_channel = services.hub.subscribe("dagsync:job:j:run:r1");
        assert_eq!(services.hub.channel_names().len(), 2);

        drop(run_channel);
        services.cleanup().await.unwrap();
        assert_eq!(services.hub.channel_names(), vec!["dagsync:global".to_string()]);
    }

    #[tokio::test]
    async fn watch_intake_starts_once() {
        let dir = tempfile::tempdir().unwrap();
        let (services, _) = services(dir.path());
        let intake = services.start_watch_intake();
        assert!(intake.is_some());
        assert!(services.start_watch_intake().is_none());
        services.reconciler.shutdown().await;
        intake.unwrap().await.unwrap();
    }
}
