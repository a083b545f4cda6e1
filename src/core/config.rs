use anyhow::{Result, bail};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::core::chain::ChainDefinition;
use crate::core::error::{CoreError, CoreResult};
use crate::core::resilience::RetryPolicy;

pub const CONFIG_FILE: &str = "dagsync.toml";

const WEEK_SECS: u64 = 7 * 24 * 60 * 60;
const YEAR_HOURS: u64 = 365 * 24;

/// Root of all persisted state: `DAGSYNC_DATA_DIR`, else `~/.dagsync`.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DAGSYNC_DATA_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".dagsync")
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default = "default_chains")]
    pub chains: Vec<ChainDefinition>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(skip)]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    #[serde(default = "default_credential")]
    pub username: String,
    #[serde(default = "default_credential")]
    pub password: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_thirty")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_thirty")]
    pub poll_interval_secs: u64,
    /// Wall-clock cap for a single watch (12 hours).
    #[serde(default = "default_max_watch")]
    pub max_watch_secs: u64,
    #[serde(default = "default_error_backoff_factor")]
    pub error_backoff_factor: u32,
    #[serde(default = "default_max_concurrent_watches")]
    pub max_concurrent_watches: usize,
    #[serde(default = "default_true")]
    pub sync_sub_tasks: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    #[serde(default = "default_hop_interval")]
    pub hop_interval_secs: u64,
    /// Delay before a freshly chained run is first polled.
    #[serde(default = "default_thirty")]
    pub hop_start_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_api_prefix() -> String {
    "/api/v1".to_string()
}
fn default_credential() -> String {
    "airflow".to_string()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_service_name() -> String {
    "airflow".to_string()
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    2_000
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_jitter_fraction() -> f64 {
    0.5
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_recovery_timeout() -> u64 {
    30
}
fn default_thirty() -> u64 {
    30
}
fn default_max_watch() -> u64 {
    12 * 60 * 60
}
fn default_error_backoff_factor() -> u32 {
    2
}
fn default_max_concurrent_watches() -> usize {
    64
}
fn default_true() -> bool {
    true
}
fn default_channel_prefix() -> String {
    "dagsync".to_string()
}
fn default_cache_ttl() -> u64 {
    3600
}
fn default_channel_capacity() -> usize {
    256
}
fn default_cleanup_interval() -> u64 {
    300
}
fn default_retention_hours() -> u64 {
    24
}
fn default_hop_interval() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_chains() -> Vec<ChainDefinition> {
    vec![ChainDefinition {
        name: "default".to_string(),
        stages: vec![
            "data_processing_pipeline".to_string(),
            "ml_training_pipeline".to_string(),
            "simple_workflow_example".to_string(),
        ],
    }]
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_prefix: default_api_prefix(),
            username: default_credential(),
            password: default_credential(),
            request_timeout_secs: default_request_timeout(),
            service_name: default_service_name(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
            jitter_fraction: default_jitter_fraction(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_thirty(),
            poll_interval_secs: default_thirty(),
            max_watch_secs: default_max_watch(),
            error_backoff_factor: default_error_backoff_factor(),
            max_concurrent_watches: default_max_concurrent_watches(),
            sync_sub_tasks: true,
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_prefix: default_channel_prefix(),
            cache_ttl_secs: default_cache_ttl(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
            retention_hours: default_retention_hours(),
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            hop_interval_secs: default_hop_interval(),
            hop_start_delay_secs: default_thirty(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            self.backoff_factor,
            Duration::from_millis(self.max_delay_ms),
            self.jitter_fraction,
        )
    }
}

impl ReconcileConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        self.poll_interval() * self.error_backoff_factor.max(1)
    }

    pub fn max_watch(&self) -> Duration {
        Duration::from_secs(self.max_watch_secs)
    }
}

fn within(field: &'static str, value: u64, min: u64, max: u64) -> CoreResult<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(CoreError::validation(
            field,
            format!("must be between {} and {}, got {}", min, max, value),
        ))
    }
}

impl Config {
    /// Defaults plus the built-in chain list, rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            chains: default_chains(),
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Load from `path`, or from `dagsync.toml` in the data directory.
    /// A missing default file yields the built-in defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let data_dir = data_dir();
        let (config_path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (data_dir.join(CONFIG_FILE), false),
        };

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path).await?;
            let mut parsed: Config = toml::from_str(&content).map_err(|e| {
                CoreError::validation("config", format!("{}: {}", config_path.display(), e))
            })?;
            parsed.data_dir = data_dir;
            info!("Loaded config from {}", config_path.display());
            parsed
        } else if explicit {
            bail!("Config file {} does not exist", config_path.display());
        } else {
            info!("No {} found, using defaults.", CONFIG_FILE);
            Self::with_data_dir(data_dir)
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        let read = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        if let Some(url) = read("DAGSYNC_ORCHESTRATOR_URL") {
            self.orchestrator.base_url = url;
        }
        if let Some(user) = read("DAGSYNC_ORCHESTRATOR_USERNAME") {
            self.orchestrator.username = user;
        }
        if let Some(pass) = read("DAGSYNC_ORCHESTRATOR_PASSWORD") {
            self.orchestrator.password = pass;
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.retry.max_attempts < 1 {
            return Err(CoreError::validation("retry.max_attempts", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_fraction) {
            return Err(CoreError::validation(
                "retry.jitter_fraction",
                "must be between 0 and 1",
            ));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(CoreError::validation("retry.backoff_factor", "must be >= 1"));
        }
        let r = &self.reconcile;
        within("reconcile.sweep_interval_secs", r.sweep_interval_secs, 1, WEEK_SECS)?;
        within("reconcile.poll_interval_secs", r.poll_interval_secs, 1, WEEK_SECS)?;
        within("reconcile.max_watch_secs", r.max_watch_secs, 1, WEEK_SECS)?;
        within("reconcile.error_backoff_factor", u64::from(r.error_backoff_factor), 1, 100)?;
        if r.max_concurrent_watches < 1 {
            return Err(CoreError::validation(
                "reconcile.max_concurrent_watches",
                "must be at least 1",
            ));
        }
        within("events.cache_ttl_secs", self.events.cache_ttl_secs, 1, WEEK_SECS)?;
        if self.events.channel_capacity < 1 {
            return Err(CoreError::validation("events.channel_capacity", "must be at least 1"));
        }
        within("cleanup.interval_secs", self.cleanup.interval_secs, 1, WEEK_SECS)?;
        within("cleanup.retention_hours", self.cleanup.retention_hours, 0, YEAR_HOURS)?;
        within("chain.hop_interval_secs", self.chain.hop_interval_secs, 1, WEEK_SECS)?;
        within("chain.hop_start_delay_secs", self.chain.hop_start_delay_secs, 0, WEEK_SECS)?;
        if self.breaker.failure_threshold < 1 {
            return Err(CoreError::validation(
                "breaker.failure_threshold",
                "must be at least 1",
            ));
        }
        let mut seen = HashSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.name.as_str()) {
                return Err(CoreError::validation(
                    "chains",
                    format!("duplicate chain name {}", chain.name),
                ));
            }
            if chain.stages.is_empty() {
                return Err(CoreError::validation(
                    "chains",
                    format!("chain {} has no stages", chain.name),
                ));
            }
        }
        Ok(())
    }

    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("dagsync.db"))
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("dagsync.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_schedule() {
        let config = Config::with_data_dir("/tmp/dagsync-test");
        assert_eq!(config.reconcile.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.reconcile.error_backoff(), Duration::from_secs(60));
        assert_eq!(config.reconcile.max_watch(), Duration::from_secs(43_200));
        assert_eq!(config.cleanup.interval_secs, 300);
        assert_eq!(config.events.cache_ttl_secs, 3600);
        assert_eq!(config.chains[0].stages.len(), 3);
        assert_eq!(
            config.store_path(),
            PathBuf::from("/tmp/dagsync-test/dagsync.db")
        );
        config.validate().unwrap();
    }

    #[test]
    fn retry_section_builds_policy() {
        let policy = RetryConfig::default().policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_before_jitter(1), Duration::from_secs(2));
        assert_eq!(policy.delay_before_jitter(9), Duration::from_secs(30));
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let toml_content = r#"
[orchestrator]
base_url = "http://airflow.internal:8080"

[reconcile]
poll_interval_secs = 10

[[chains]]
name = "nightly"
stages = ["extract", "load"]
"#;
        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.orchestrator.base_url, "http://airflow.internal:8080");
        assert_eq!(config.orchestrator.api_prefix, "/api/v1");
        assert_eq!(config.reconcile.poll_interval_secs, 10);
        assert_eq!(config.reconcile.sweep_interval_secs, 30);
        assert_eq!(config.chains.len(), 1);
        assert_eq!(config.chains[0].name, "nightly");
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = Config::with_data_dir("/tmp");
        config.retry.jitter_fraction = 1.5;
        assert!(matches!(
            config.validate(),
            Err(CoreError::Validation { .. })
        ));

        let mut config = Config::with_data_dir("/tmp");
        config.chains.push(config.chains[0].clone());
        assert!(config.validate().is_err());

        let mut config = Config::with_data_dir("/tmp");
        config.chains[0].stages.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_bounds_timing_values() {
        let rejected = [
            "[reconcile]\npoll_interval_secs = 0\n",
            "[reconcile]\nsweep_interval_secs = 0\n",
            "[reconcile]\nerror_backoff_factor = 0\n",
            "[reconcile]\nmax_watch_secs = 9223372036854775807\n",
            "[reconcile]\nmax_concurrent_watches = 0\n",
            "[events]\ncache_ttl_secs = 9223372036854775807\n",
            "[events]\nchannel_capacity = 0\n",
            "[cleanup]\nretention_hours = 9223372036854775807\n",
            "[cleanup]\ninterval_secs = 0\n",
            "[chain]\nhop_interval_secs = 0\n",
        ];
        for raw in rejected {
            let config: Config = toml::from_str(raw).unwrap();
            assert!(
                matches!(config.validate(), Err(CoreError::Validation { .. })),
                "accepted {}",
                raw
            );
        }

        let config: Config =
            toml::from_str("[reconcile]\npoll_interval_secs = 1\nmax_watch_secs = 604800\n").unwrap();
        config.validate().unwrap();
    }

    #[tokio::test]
    async fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(Config::load(Some(&missing)).await.is_err());
    }

    #[tokio::test]
    async fn explicit_file_is_loaded_and_validated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dagsync.toml");
        std::fs::write(&path, "[breaker]\nfailure_threshold = 0\n").unwrap();
        let err = Config::load(Some(&path)).await.unwrap_err();
        assert!(err.to_string().contains("failure_threshold"));

        std::fs::write(&path, "[breaker]\nfailure_threshold = 5\n").unwrap();
        let config = Config::load(Some(&path)).await.unwrap();
        assert_eq!(config.breaker.failure_threshold, 5);
    }
}
