//! Configuration loading from TOML files

use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail, ensure};
use harvline_core::{IdentityStrategy, SourceConfig};
use harvline_http::HttpSourceConfig;
use serde::Deserialize;

/// Global configuration for harvline
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub defaults: Defaults,
    #[serde(rename = "source")]
    pub sources: Vec<SourceEntry>,
}

/// Settings every source inherits unless it overrides them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Defaults {
    /// Where `<name>.jsonl` stores go when a source has no `store_path`
    pub data_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub max_calls: usize,
    pub time_window_seconds: f64,
    pub max_retries: u32,
    pub backoff_base_seconds: f64,
    pub consecutive_empty_threshold: u32,
    pub max_consecutive_errors: u32,
    pub progress_interval_secs: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        let base = SourceConfig::default();
        Self {
            data_dir: PathBuf::from("./data"),
            backup_dir: base.backup_dir,
            max_calls: base.max_calls,
            time_window_seconds: base.time_window_seconds,
            max_retries: base.max_retries,
            backoff_base_seconds: base.backoff_base_seconds,
            consecutive_empty_threshold: base.consecutive_empty_threshold,
            max_consecutive_errors: base.max_consecutive_errors,
            progress_interval_secs: base.progress_interval_secs,
        }
    }
}

/// One `[[source]]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    pub name: String,
    /// Rate budget name; defaults to `name`
    #[serde(default)]
    pub remote: Option<String>,
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    #[serde(default)]
    pub max_units: Option<usize>,
    #[serde(default)]
    pub identity: IdentityStrategy,

    // Per-source overrides of [defaults]
    #[serde(default)]
    pub max_calls: Option<usize>,
    #[serde(default)]
    pub time_window_seconds: Option<f64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub backoff_base_seconds: Option<f64>,
    #[serde(default)]
    pub consecutive_empty_threshold: Option<u32>,
    #[serde(default)]
    pub max_consecutive_errors: Option<u32>,

    pub http: HttpSourceConfig,
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./harvline.toml (current directory)
    /// 2. ~/.config/harvline/config.toml
    ///
    /// If no config file found, returns default config (no sources).
    pub fn load() -> Result<Self> {
        let local_config = PathBuf::from("harvline.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = directories::ProjectDirs::from("", "", "harvline") {
            let user_config = config_dir.config_dir().join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        log::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        let mut stores: HashMap<PathBuf, &str> = HashMap::new();
        // Backups are named `<stem>_<stamp><.ext>`, so two stores with one stem
        // and one backup_dir would race for the same snapshot path
        let mut backup_names: HashMap<(PathBuf, OsString), &str> = HashMap::new();
        for entry in &self.sources {
            ensure!(
                names.insert(entry.name.as_str()),
                "source {:?} defined twice",
                entry.name
            );
            let cfg = self.source_config(entry);
            if let Some(other) = stores.insert(cfg.store_path.clone(), &entry.name) {
                bail!(
                    "sources {other:?} and {:?} share store {}",
                    entry.name,
                    cfg.store_path.display()
                );
            }
            let stem = cfg.store_path.file_stem().unwrap_or_default().to_os_string();
            if let Some(other) = backup_names.insert((cfg.backup_dir.clone(), stem), &entry.name) {
                bail!(
                    "sources {other:?} and {:?} have stores with the same file stem and \
                     backup_dir {}; their snapshots would collide",
                    entry.name,
                    cfg.backup_dir.display()
                );
            }
            ensure!(cfg.max_calls >= 1, "{}: max_calls must be at least 1", cfg.name);
            ensure!(
                cfg.time_window_seconds.is_finite() && cfg.time_window_seconds > 0.0,
                "{}: time_window_seconds must be positive",
                cfg.name
            );
            ensure!(
                cfg.backoff_base_seconds.is_finite() && cfg.backoff_base_seconds >= 0.0,
                "{}: backoff_base_seconds must be non-negative",
                cfg.name
            );
            entry
                .http
                .validate()
                .with_context(|| format!("{}: invalid [source.http]", entry.name))?;
        }
        Ok(())
    }

    pub fn find(&self, name: &str) -> Result<&SourceEntry> {
        self.sources
            .iter()
            .find(|s| s.name == name)
            .with_context(|| format!("No source named {name:?} in config"))
    }

    /// Merge `[defaults]` into one source's settings.
    pub fn source_config(&self, entry: &SourceEntry) -> SourceConfig {
        let d = &self.defaults;
        SourceConfig {
            name: entry.name.clone(),
            remote: entry.remote.clone().unwrap_or_else(|| entry.name.clone()),
            store_path: entry
                .store_path
                .clone()
                .unwrap_or_else(|| d.data_dir.join(format!("{}.jsonl", entry.name))),
            backup_dir: entry
                .backup_dir
                .clone()
                .unwrap_or_else(|| d.backup_dir.clone()),
            artifacts: entry.artifacts.clone(),
            identity: entry.identity.clone(),
            max_calls: entry.max_calls.unwrap_or(d.max_calls),
            time_window_seconds: entry.time_window_seconds.unwrap_or(d.time_window_seconds),
            max_retries: entry.max_retries.unwrap_or(d.max_retries),
            backoff_base_seconds: entry.backoff_base_seconds.unwrap_or(d.backoff_base_seconds),
            consecutive_empty_threshold: entry
                .consecutive_empty_threshold
                .unwrap_or(d.consecutive_empty_threshold),
            max_consecutive_errors: entry
                .max_consecutive_errors
                .unwrap_or(d.max_consecutive_errors),
            max_units: entry.max_units,
            progress_interval_secs: d.progress_interval_secs,
        }
    }
}
