//! Error types for the harvesting engine

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Local storage failure. The only error category that ends a run.
#[derive(Debug)]
pub enum StoreError {
    /// Snapshot of the existing store could not be taken; nothing was written
    Backup {
        store: PathBuf,
        backup: PathBuf,
        source: io::Error,
    },
    /// Store could not be opened or repaired for appending
    Open { path: PathBuf, source: io::Error },
    /// Append or flush of a record failed
    Write { path: PathBuf, source: io::Error },
    /// Store, backup, or artifact exists but could not be read
    Ledger { path: PathBuf, source: io::Error },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backup {
                store,
                backup,
                source,
            } => write!(
                f,
                "backup of {} to {} failed: {source}",
                store.display(),
                backup.display()
            ),
            Self::Open { path, source } => {
                write!(f, "cannot open store {}: {source}", path.display())
            }
            Self::Write { path, source } => {
                write!(f, "write to store {} failed: {source}", path.display())
            }
            Self::Ledger { path, source } => {
                write!(f, "cannot read {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backup { source, .. }
            | Self::Open { source, .. }
            | Self::Write { source, .. }
            | Self::Ledger { source, .. } => Some(source),
        }
    }
}

/// Fetched content could not be turned into records.
///
/// The unit is skipped; nothing from it reaches the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parse: {}", self.message)
    }
}

impl std::error::Error for ParseError {}

impl From<serde_json::Error> for ParseError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(e.to_string())
    }
}
