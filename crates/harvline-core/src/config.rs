//! Per-source harvest configuration

use std::path::PathBuf;
use std::time::Duration;

use crate::identity::IdentityStrategy;
use crate::retry::RetryPolicy;

/// Everything the engine needs to harvest one source.
///
/// Built once per source (the CLI merges `[defaults]` with the source's own
/// table) and passed by reference; the engine keeps no global configuration.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Label for logs and progress
    pub name: String,
    /// Rate budget owner; sources naming the same remote share one budget
    pub remote: String,
    pub store_path: PathBuf,
    pub backup_dir: PathBuf,
    /// Downstream cleaned outputs whose records also count as known
    pub artifacts: Vec<PathBuf>,
    pub identity: IdentityStrategy,

    pub max_calls: usize,
    pub time_window_seconds: f64,
    pub max_retries: u32,
    pub backoff_base_seconds: f64,
    /// 0 disables early stop
    pub consecutive_empty_threshold: u32,
    /// Give up on the walk after this many failed units in a row; 0 disables
    pub max_consecutive_errors: u32,
    /// Hard cap on units visited per run
    pub max_units: Option<usize>,
    pub progress_interval_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            remote: "default".to_string(),
            store_path: PathBuf::from("./data/default.jsonl"),
            backup_dir: PathBuf::from("./data/backups"),
            artifacts: Vec::new(),
            identity: IdentityStrategy::default(),
            max_calls: 30,
            time_window_seconds: 60.0,
            max_retries: 3,
            backoff_base_seconds: 5.0,
            consecutive_empty_threshold: 5,
            max_consecutive_errors: 10,
            max_units: None,
            progress_interval_secs: 30,
        }
    }
}

impl SourceConfig {
    pub fn time_window(&self) -> Duration {
        Duration::from_secs_f64(self.time_window_seconds.max(0.0))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_base: Duration::from_secs_f64(self.backoff_base_seconds.max(0.0)),
        }
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }
}
