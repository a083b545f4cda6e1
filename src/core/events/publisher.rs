use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, error};

use super::cache::{CachedStatus, StatusCache};
use super::hub::EventSink;
use super::types::Event;
use crate::core::error::{CoreError, CoreResult};

/// Fans an event out to the global, job, run and principal channels and
/// keeps the status cache in step.
pub struct EventPublisher {
    prefix: String,
    sinks: Vec<Arc<dyn EventSink>>,
    cache: Arc<StatusCache>,
    published: AtomicU64,
    failures: AtomicU64,
}

impl EventPublisher {
    pub fn new(prefix: impl Into<String>, sinks: Vec<Arc<dyn EventSink>>, cache: Arc<StatusCache>) -> Self {
        Self {
            prefix: prefix.into(),
            sinks,
            cache,
            published: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn global_channel(&self) -> String {
        format!("{}:global", self.prefix)
    }

    pub fn job_channel(&self, job_id: &str) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    pub fn run_channel(&self, job_id: &str, run_id: &str) -> String {
        format!("{}:job:{}:run:{}", self.prefix, job_id, run_id)
    }

    pub fn principal_channel(&self, principal: &str) -> String {
        format!("{}:principal:{}", self.prefix, principal)
    }

    pub fn channels_for(&self, event: &Event) -> Vec<String> {
        let mut channels = vec![self.global_channel(), self.job_channel(&event.job_id)];
        if let Some(run_id) = &event.run_id {
            channels.push(self.run_channel(&event.job_id, run_id));
        }
        if let Some(principal) = &event.principal {
            channels.push(self.principal_channel(principal));
        }
        channels
    }

    pub fn cache(&self) -> &Arc<StatusCache> {
        &self.cache
    }

    /// Deliver to every channel. A sink failure does not stop delivery to
    /// the remaining channels; it is logged, counted and returned.
    pub async fn publish(&self, event: &Event) -> CoreResult<()> {
        if event.event_type.carries_run_status() {
            if let (Some(run_id), Some(status)) = (&event.run_id, event.status()) {
                self.cache.put(CachedStatus {
                    job_id: event.job_id.clone(),
                    run_id: run_id.clone(),
                    status,
                    event_type: event.event_type.as_str().to_string(),
                    updated_at: event.timestamp,
                });
            }
        }

        let mut failed = Vec::new();
        for channel in self.channels_for(event) {
            for sink in &self.sinks {
                if let Err(e) = sink.publish(&channel, event).await {
                    failed.push(format!("{}: {}", channel, e));
                }
            }
        }

        if failed.is_empty() {
            self.published.fetch_add(1, Ordering::Relaxed);
            debug!("Published {} for job {}", event.event_type, event.job_id);
            return Ok(());
        }

        let total = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        let message = failed.join("; ");
        error!(
            "Failed to publish {} for job {} ({} failures so far): {}",
            event.event_type, event.job_id, total, message
        );
        Err(CoreError::Publish(message))
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}
