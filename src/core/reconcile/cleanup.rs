use chrono::Utc;
use tracing::{debug, info};

use super::Reconciler;
use crate::core::error::CoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CleanupReport {
    /// Cache entries past their TTL.
    pub expired: usize,
    /// Cache entries for runs terminal longer than the retention window.
    pub retired: usize,
    pub pruned_watches: usize,
}

impl Reconciler {
    pub async fn cleanup(&self) -> CoreResult<CleanupReport> {
        let cache = self.publisher.cache();
        let expired = cache.purge_expired();

        let cutoff = i64::try_from(self.cleanup.retention_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        let mut retired = 0;
        if let Some(cutoff) = cutoff {
            for run in self.store.list_terminal_runs_before(cutoff).await? {
                if cache.remove(&run.job_id, &run.run_id) {
                    retired += 1;
                }
            }
        }

        let report = CleanupReport {
            expired,
            retired,
            pruned_watches: self.prune_finished(),
        };
        if report.expired + report.retired > 0 {
            info!(
                "Cleanup dropped {} expired and {} retired cache entries",
                report.expired, report.retired
            );
        } else {
            debug!("Cleanup found nothing to drop");
        }
        Ok(report)
    }
}
