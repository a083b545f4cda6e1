use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::runs::open_services;
use crate::core::config::Config;
use crate::core::lifecycle::{Coordinator, LifecycleManager, schedule_background};
use crate::core::services::Services;
use crate::core::terminal::{GuideSection, print_warn};

const PID_FILE: &str = "dagsync.pid";

/// Mirror the global event channel into the daemon log.
fn spawn_event_echo(services: &Services) -> JoinHandle<()> {
    let mut rx = services
        .hub
        .subscribe(&services.publisher.global_channel());
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => info!(
                    "[{}] job={} run={}",
                    event.event_type,
                    event.job_id,
                    event.run_id.as_deref().unwrap_or("-")
                ),
                Err(RecvError::Lagged(n)) => warn!("Event echo skipped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Foreground reconciler: recover, schedule, then run until Ctrl+C.
pub async fn run_daemon(config: Config) -> Result<()> {
    std::fs::create_dir_all(&config.data_dir)?;
    let pid_file = config.data_dir.join(PID_FILE);
    if let Ok(pid) = std::fs::read_to_string(&pid_file) {
        print_warn(&format!(
            "Daemon already running (pid {}). Remove {} if it is stale.",
            pid.trim(),
            pid_file.display()
        ));
        return Ok(());
    }

    let services = open_services(config).await?;
    let echo = spawn_event_echo(&services);
    let mut lifecycle = LifecycleManager::new().await?;
    lifecycle.attach(Arc::new(Mutex::new(Coordinator::new(services.clone()))));
    schedule_background(&lifecycle, &services).await?;
    lifecycle.start().await?;
    std::fs::write(&pid_file, std::process::id().to_string())?;
    info!("Daemon ready ({:?})", lifecycle.state());

    let mut summary = GuideSection::new("dagsync daemon")
        .status("Orchestrator", &services.config.orchestrator.base_url)
        .status("Store", &services.config.store_path().display().to_string())
        .status("Chains", &services.chain.registry().names().join(", "))
        .status(
            "Watching",
            &format!("{} runs", services.reconciler.active_watches()),
        );
    for breaker in services.breakers.snapshots() {
        summary = summary.status(&format!("Breaker {}", breaker.name), breaker.state.as_str());
    }
    summary.blank().text("Press Ctrl+C to stop.").print();
    println!();

    let signal = tokio::signal::ctrl_c().await;
    for breaker in services.breakers.snapshots() {
        info!(
            "Breaker {} is {} (tripped {} times)",
            breaker.name,
            breaker.state.as_str(),
            breaker.trip_count
        );
    }
    info!("Shutdown requested");
    lifecycle.shutdown().await?;
    echo.abort();
    info!(
        "Published {} events ({} delivery failures)",
        services.publisher.published_count(),
        services.publisher.failure_count()
    );
    let _ = std::fs::remove_file(&pid_file);
    signal?;
    Ok(())
}
