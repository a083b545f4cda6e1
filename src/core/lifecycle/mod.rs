use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::core::services::Services;

#[derive(Debug, PartialEq)]
pub enum LifecycleState {
    Init,
    Recover,
    Ready,
    Shutdown,
}

#[async_trait::async_trait]
pub trait LifecycleComponent {
    async fn on_init(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_start(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct LifecycleManager {
    state: LifecycleState,
    components: Vec<Arc<Mutex<dyn LifecycleComponent + Send + Sync>>>,
    pub scheduler: JobScheduler,
}

impl LifecycleManager {
    pub async fn new() -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            state: LifecycleState::Init,
            components: Vec::new(),
            scheduler,
        })
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    pub fn attach(&mut self, component: Arc<Mutex<dyn LifecycleComponent + Send + Sync>>) {
        self.components.push(component);
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Init");
        self.state = LifecycleState::Init;
        for comp in &self.components {
            comp.lock().await.on_init().await?;
        }

        info!("Lifecycle Phase: Recover");
        self.state = LifecycleState::Recover;
        for comp in &self.components {
            comp.lock().await.on_start().await?;
        }

        info!("Lifecycle Phase: Ready (Starting Scheduler)");
        self.scheduler.start().await?;
        self.state = LifecycleState::Ready;

        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Shutdown");
        self.state = LifecycleState::Shutdown;

        if let Err(e) = self.scheduler.shutdown().await {
            warn!("Scheduler shutdown error: {}", e);
        }
        for comp in &self.components {
            if let Err(e) = comp.lock().await.on_shutdown().await {
                warn!("Component shutdown error: {}", e);
            }
        }

        Ok(())
    }
}

/// Background reconciliation as a lifecycle component: recovers pending work
/// on start and stops every watch on shutdown.
pub struct Coordinator {
    services: Arc<Services>,
    intake: Option<JoinHandle<()>>,
}

impl Coordinator {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            intake: None,
        }
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for Coordinator {
    async fn on_init(&mut self) -> Result<()> {
        let pending = self.services.store.list_pending_hops().await?;
        if !pending.is_empty() {
            info!("{} chain hops pending from a previous run", pending.len());
        }
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        self.intake = self.services.start_watch_intake();
        let report = self.services.reconciler.sweep().await?;
        info!(
            "Recovered {} non-terminal runs ({} watches started)",
            report.candidates, report.spawned
        );
        self.services.chain.recover_stalled_executions().await?;
        self.services.chain.process_due_hops().await?;
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        self.services.reconciler.shutdown().await;
        if let Some(intake) = self.intake.take() {
            let _ = intake.await;
        }
        Ok(())
    }
}

/// Register the periodic sweep, cleanup and hop jobs.
pub async fn schedule_background(lifecycle: &LifecycleManager, services: &Arc<Services>) -> Result<()> {
    let config = &services.config;

    let sweep_services = services.clone();
    match Job::new_repeated_async(
        Duration::from_secs(config.reconcile.sweep_interval_secs.max(1)),
        move |_uuid, mut _l| {
            let services = sweep_services.clone();
            Box::pin(async move {
                if let Err(e) = services.reconciler.sweep().await {
                    error!("Reconciliation sweep failed: {}", e);
                }
            })
        },
    ) {
        Ok(job) => {
            lifecycle.scheduler.add(job).await?;
        }
        Err(e) => error!("Failed to create sweep job: {}", e),
    }

    let cleanup_services = services.clone();
    match Job::new_repeated_async(
        Duration::from_secs(config.cleanup.interval_secs.max(1)),
        move |_uuid, mut _l| {
            let services = cleanup_services.clone();
            Box::pin(async move {
                if let Err(e) = services.cleanup().await {
                    error!("Cleanup failed: {}", e);
                }
            })
        },
    ) {
        Ok(job) => {
            lifecycle.scheduler.add(job).await?;
        }
        Err(e) => error!("Failed to create cleanup job: {}", e),
    }

    let hop_services = services.clone();
    match Job::new_repeated_async(
        Duration::from_secs(config.chain.hop_interval_secs.max(1)),
        move |_uuid, mut _l| {
            let services = hop_services.clone();
            Box::pin(async move {
                if let Err(e) = services.chain.recover_stalled_executions().await {
                    error!("Chain recovery failed: {}", e);
                }
                if let Err(e) = services.chain.process_due_hops().await {
                    error!("Chain hop processing failed: {}", e);
                }
            })
        },
    ) {
        Ok(job) => {
            lifecycle.scheduler.add(job).await?;
        }
        Err(e) => error!("Failed to create chain hop job: {}", e),
    }

    info!(
        "Scheduled sweep every {}s, cleanup every {}s, chain hops every {}s",
        config.reconcile.sweep_interval_secs,
        config.cleanup.interval_secs,
        config.chain.hop_interval_secs
    );
    Ok(())
}
