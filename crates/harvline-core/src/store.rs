//! Append-only JSONL store with pre-run backup snapshots.
//!
//! Layout:
//!
//! ```text
//! data/gerrit.jsonl                                  # primary store, one record per line
//! data/backups/gerrit_20261018T093000.123Z.jsonl     # snapshot taken before a resumed run
//! ```
//!
//! Every accepted record is written with a single `write_all` and synced
//! before the next one, so a crash leaves at most one torn final line. The
//! next open terminates that line; the ledger skips it as malformed.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::StoreError;
use crate::record::Record;

/// Timestamp format of the run stamp embedded in backup file names
pub const RUN_STAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";

/// Run stamp for backup names, e.g. `20261018T093000.123Z`.
pub fn run_stamp(now: DateTime<Utc>) -> String {
    now.format(RUN_STAMP_FORMAT).to_string()
}

/// Split a store file name into (`stem`, `.ext`); `.ext` may be empty.
fn name_parts(store_path: &Path) -> (String, String) {
    let stem = store_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    let ext = store_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (stem, ext)
}

/// `<backup_dir>/<stem>_<stamp><.ext>`
pub fn backup_path(store_path: &Path, backup_dir: &Path, stamp: &str) -> PathBuf {
    let (stem, ext) = name_parts(store_path);
    backup_dir.join(format!("{stem}_{stamp}{ext}"))
}

/// Glob matching candidate backups of `store_path`.
pub fn backup_glob(store_path: &Path, backup_dir: &Path) -> String {
    let (stem, ext) = name_parts(store_path);
    let dir = glob::Pattern::escape(&backup_dir.to_string_lossy());
    format!(
        "{dir}/{}_*{}",
        glob::Pattern::escape(&stem),
        glob::Pattern::escape(&ext)
    )
}

/// Run stamp of a backup of `store_path`, or `None` if `candidate` is some
/// other file that merely matched the glob (e.g. `gerrit_old.jsonl`).
pub fn parse_backup_stamp(store_path: &Path, candidate: &Path) -> Option<NaiveDateTime> {
    let (stem, ext) = name_parts(store_path);
    let name = candidate.file_name()?.to_str()?;
    let stamp = name
        .strip_prefix(stem.as_str())?
        .strip_prefix('_')?
        .strip_suffix(ext.as_str())?;
    NaiveDateTime::parse_from_str(stamp, RUN_STAMP_FORMAT).ok()
}

/// Copy the store byte-for-byte to a new backup file.
///
/// The backup is created with `create_new`, so an existing snapshot is never
/// overwritten. A partially written backup is removed before returning the
/// error.
pub fn snapshot(store_path: &Path, backup_dir: &Path, stamp: &str) -> Result<PathBuf, StoreError> {
    let backup = backup_path(store_path, backup_dir, stamp);
    let fail = |source: io::Error| StoreError::Backup {
        store: store_path.to_path_buf(),
        backup: backup.clone(),
        source,
    };

    fs::create_dir_all(backup_dir).map_err(fail)?;
    let mut src = File::open(store_path).map_err(fail)?;
    let mut dst = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&backup)
        .map_err(fail)?;

    let copied = io::copy(&mut src, &mut dst).and_then(|n| dst.sync_all().map(|()| n));
    match copied {
        Ok(bytes) => {
            log::info!(
                "Backed up {} ({bytes} bytes) to {}",
                store_path.display(),
                backup.display()
            );
            Ok(backup)
        }
        Err(e) => {
            drop(dst);
            let _ = fs::remove_file(&backup);
            Err(fail(e))
        }
    }
}

/// Single writer appending records to the store.
pub struct StoreWriter {
    file: File,
    path: PathBuf,
    appended: usize,
}

impl std::fmt::Debug for StoreWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreWriter")
            .field("path", &self.path)
            .field("appended", &self.appended)
            .finish_non_exhaustive()
    }
}

impl StoreWriter {
    /// Open the store for appending, snapshotting it first when needed.
    ///
    /// A backup is taken when the store exists and either the run is resuming
    /// (exclusion set non-empty at start) or the file is non-empty. If the
    /// backup fails nothing is opened for writing.
    ///
    /// Returns the writer and the backup path, if one was taken.
    pub fn open_for_append(
        store_path: &Path,
        backup_dir: &Path,
        resuming: bool,
        stamp: &str,
    ) -> Result<(Self, Option<PathBuf>), StoreError> {
        let open_err = |source: io::Error| StoreError::Open {
            path: store_path.to_path_buf(),
            source,
        };

        let existing_len = match fs::metadata(store_path) {
            Ok(m) => Some(m.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(open_err(e)),
        };

        let backup = match existing_len {
            Some(len) if resuming || len > 0 => Some(snapshot(store_path, backup_dir, stamp)?),
            _ => None,
        };

        if let Some(parent) = store_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(open_err)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(store_path)
            .map_err(open_err)?;

        if existing_len.unwrap_or(0) > 0 {
            repair_torn_tail(&mut file, store_path).map_err(open_err)?;
        }

        Ok((
            Self {
                file,
                path: store_path.to_path_buf(),
                appended: 0,
            },
            backup,
        ))
    }

    /// Append one record and sync it to disk before returning.
    pub fn append(&mut self, record: &Record) -> Result<(), StoreError> {
        let write_err = |source: io::Error| StoreError::Write {
            path: self.path.clone(),
            source,
        };
        let mut line = record
            .to_line()
            .map_err(|e| write_err(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        line.push(b'\n');
        self.file.write_all(&line).map_err(write_err)?;
        self.file.sync_data().map_err(write_err)?;
        self.appended += 1;
        Ok(())
    }

    /// Records appended by this writer.
    pub fn appended(&self) -> usize {
        self.appended
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Terminate a final line left without `\n` by an interrupted write.
fn repair_torn_tail(file: &mut File, path: &Path) -> io::Result<()> {
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    if last[0] != b'\n' {
        log::warn!(
            "{}: last line is incomplete (interrupted write?), terminating it",
            path.display()
        );
        file.write_all(b"\n")?;
        file.sync_data()?;
    }
    Ok(())
}
