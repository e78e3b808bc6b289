//! Resume ledger: rebuild the exclusion set from disk at startup.
//!
//! Sources, in scan order:
//!
//! 1. the primary store,
//! 2. every backup snapshot of that store (oldest first),
//! 3. downstream cleaned artifacts (same line format, optionally `.gz`).
//!
//! Lines are decoded into [`IdentityLine`], which keeps field values as raw
//! JSON slices; only the fields the identity strategy selects are parsed,
//! and none at all when the line has an external ID.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use serde::Deserialize;
use serde_json::value::RawValue;

use crate::error::StoreError;
use crate::identity::{ExclusionSet, IdentityStrategy};
use crate::store;

/// Read buffer for store scans (1MB)
const SCAN_BUF_SIZE: usize = 1024 * 1024;

/// Identity-critical projection of a stored record.
///
/// `id` and `timestamp` stay raw: downstream artifacts carry numeric IDs and
/// epoch timestamps, and one odd value must not cost the line its key.
#[derive(Deserialize)]
struct IdentityLine<'a> {
    #[serde(default)]
    source: Option<String>,
    #[serde(default, borrow)]
    id: Option<&'a RawValue>,
    #[serde(default, borrow)]
    timestamp: Option<&'a RawValue>,
    #[serde(default, borrow)]
    fields: BTreeMap<String, &'a RawValue>,
}

/// String or number IDs; `5` and `"5"` name the same record.
fn line_id(raw: &RawValue) -> Option<String> {
    match serde_json::from_str(raw.get()).ok()? {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// RFC 3339 string or epoch seconds; anything else is treated as absent.
fn line_timestamp(raw: &RawValue) -> Option<DateTime<Utc>> {
    match serde_json::from_str(raw.get()).ok()? {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerFileKind {
    Store,
    Backup,
    Artifact,
}

impl fmt::Display for LedgerFileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store => f.write_str("store"),
            Self::Backup => f.write_str("backup"),
            Self::Artifact => f.write_str("artifact"),
        }
    }
}

/// Files the ledger scans for one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerPaths {
    pub store: PathBuf,
    pub backups: Vec<PathBuf>,
    pub artifacts: Vec<PathBuf>,
}

impl LedgerPaths {
    /// Locate backups of `store` under `backup_dir`.
    ///
    /// Glob matches whose suffix is not a run stamp are ignored, so
    /// `gerrit_old.jsonl` next to `gerrit_20261018T093000.123Z.jsonl` is not
    /// mistaken for a snapshot.
    pub fn discover(store: &Path, backup_dir: &Path, artifacts: &[PathBuf]) -> Self {
        let pattern = store::backup_glob(store, backup_dir);
        let mut stamped = Vec::new();
        match glob::glob(&pattern) {
            Ok(entries) => {
                for entry in entries {
                    let path = match entry {
                        Ok(p) => p,
                        Err(e) => {
                            log::warn!("Skipping unreadable backup entry: {e}");
                            continue;
                        }
                    };
                    if let Some(ts) = store::parse_backup_stamp(store, &path) {
                        stamped.push((ts, path));
                    }
                }
            }
            Err(e) => log::warn!("Invalid backup pattern {pattern}: {e}"),
        }
        stamped.sort();

        Self {
            store: store.to_path_buf(),
            backups: stamped.into_iter().map(|(_, p)| p).collect(),
            artifacts: artifacts.to_vec(),
        }
    }

    fn files(&self) -> impl Iterator<Item = (LedgerFileKind, &Path)> {
        std::iter::once((LedgerFileKind::Store, self.store.as_path()))
            .chain(self.backups.iter().map(|p| (LedgerFileKind::Backup, p.as_path())))
            .chain(
                self.artifacts
                    .iter()
                    .map(|p| (LedgerFileKind::Artifact, p.as_path())),
            )
    }
}

/// Scan result for one file.
#[derive(Debug, Clone)]
pub struct FileStats {
    pub kind: LedgerFileKind,
    pub path: PathBuf,
    pub lines: usize,
    /// Keys not already contributed by an earlier file
    pub new_keys: usize,
    /// Not valid JSON, or missing required shape (torn tail, foreign line)
    pub malformed: usize,
    /// Valid line but no identity could be derived
    pub unkeyed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct LedgerStats {
    pub files: Vec<FileStats>,
    pub elapsed: std::time::Duration,
}

impl LedgerStats {
    pub fn lines(&self) -> usize {
        self.files.iter().map(|f| f.lines).sum()
    }

    pub fn malformed(&self) -> usize {
        self.files.iter().map(|f| f.malformed).sum()
    }

    pub fn unkeyed(&self) -> usize {
        self.files.iter().map(|f| f.unkeyed).sum()
    }

    pub fn backups(&self) -> usize {
        self.files
            .iter()
            .filter(|f| f.kind == LedgerFileKind::Backup)
            .count()
    }

    pub fn log(&self, source: &str, set: &ExclusionSet) {
        for f in &self.files {
            log::debug!(
                "{source}: {} {}: {} lines, {} new keys, {} malformed",
                f.kind,
                f.path.display(),
                f.lines,
                f.new_keys,
                f.malformed
            );
        }
        log::info!(
            "{source}: {} known keys ({} strong, {} weak) from {} files in {:.1}s",
            set.len(),
            set.strong_len(),
            set.weak_len(),
            self.files.len(),
            self.elapsed.as_secs_f64()
        );
        if self.malformed() > 0 || self.unkeyed() > 0 {
            log::warn!(
                "{source}: ledger skipped {} malformed and {} unkeyed lines",
                self.malformed(),
                self.unkeyed()
            );
        }
    }
}

fn open_scan(path: &Path) -> io::Result<Box<dyn BufRead>> {
    let file = File::open(path)?;
    let inner: Box<dyn Read> = if path.extension().is_some_and(|e| e == "gz") {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(Box::new(BufReader::with_capacity(SCAN_BUF_SIZE, inner)))
}

/// Build the exclusion set for `source` from every file in `paths`.
///
/// Missing files are skipped. A file that exists but cannot be read is a
/// storage failure: resuming without it could re-append its records.
pub fn load_exclusions(
    paths: &LedgerPaths,
    source: &str,
    strategy: &IdentityStrategy,
) -> Result<(ExclusionSet, LedgerStats), StoreError> {
    let start = Instant::now();
    let mut set = ExclusionSet::new();
    let mut stats = LedgerStats::default();

    for (kind, path) in paths.files() {
        let reader = match open_scan(path) {
            Ok(r) => r,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("{source}: no {kind} at {}", path.display());
                continue;
            }
            Err(e) => {
                return Err(StoreError::Ledger {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        };
        let file_stats =
            scan_file(reader, kind, path, source, strategy, &mut set).map_err(|e| {
                StoreError::Ledger {
                    path: path.to_path_buf(),
                    source: e,
                }
            })?;
        stats.files.push(file_stats);
    }

    stats.elapsed = start.elapsed();
    Ok((set, stats))
}

fn scan_file(
    mut reader: Box<dyn BufRead>,
    kind: LedgerFileKind,
    path: &Path,
    source: &str,
    strategy: &IdentityStrategy,
    set: &mut ExclusionSet,
) -> io::Result<FileStats> {
    let mut stats = FileStats {
        kind,
        path: path.to_path_buf(),
        lines: 0,
        new_keys: 0,
        malformed: 0,
        unkeyed: 0,
    };
    let mut buf = Vec::with_capacity(4096);

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        let Ok(text) = std::str::from_utf8(&buf) else {
            stats.lines += 1;
            stats.malformed += 1;
            continue;
        };
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        stats.lines += 1;

        let line: IdentityLine<'_> = match serde_json::from_str(text) {
            Ok(l) => l,
            Err(e) => {
                stats.malformed += 1;
                log::debug!("{}:{}: {e}", path.display(), stats.lines);
                continue;
            }
        };
        let line_source = line.source.as_deref().unwrap_or(source);
        let fields = line
            .fields
            .iter()
            .filter(|(name, _)| strategy.selects(name))
            .map(|(name, raw)| {
                let value = serde_json::from_str(raw.get()).unwrap_or(serde_json::Value::Null);
                (name.as_str(), Cow::Owned(value))
            });
        let id = line.id.and_then(line_id);
        let timestamp = line.timestamp.and_then(line_timestamp);
        match strategy.derive(line_source, id.as_deref(), timestamp.as_ref(), fields) {
            Ok(key) => {
                if set.insert(&key) {
                    stats.new_keys += 1;
                }
            }
            Err(_) => stats.unkeyed += 1,
        }
    }
    Ok(stats)
}
