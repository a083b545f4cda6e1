use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::core::run::RunStatus;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedStatus {
    pub job_id: String,
    pub run_id: String,
    pub status: RunStatus,
    pub event_type: String,
    pub updated_at: DateTime<Utc>,
}

struct Entry {
    value: CachedStatus,
    expires_at: Instant,
}

/// Short-lived `(job_id, run_id) -> status` map for fast reads.
pub struct StatusCache {
    ttl: Duration,
    entries: Mutex<HashMap<(String, String), Entry>>,
}

/// Longer TTLs are clamped so expiry instants cannot overflow.
const MAX_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

impl StatusCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: ttl.min(MAX_TTL),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), Entry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn put(&self, value: CachedStatus) {
        let key = (value.job_id.clone(), value.run_id.clone());
        let expires_at = Instant::now() + self.ttl;
        self.lock().insert(key, Entry { value, expires_at });
    }

    pub fn get(&self, job_id: &str, run_id: &str) -> Option<CachedStatus> {
        let key = (job_id.to_string(), run_id.to_string());
        let mut entries = self.lock();
        match entries.get(&key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn remove(&self, job_id: &str, run_id: &str) -> bool {
        self.lock()
            .remove(&(job_id.to_string(), run_id.to_string()))
            .is_some()
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }
}
