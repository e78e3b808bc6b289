//! Per-source orchestration loop.
//!
//! ```text
//! INIT → LOADING_EXCLUSIONS → FETCHING ─┬─ ok ──→ RESOLVING → APPENDING → CHECK_BOUNDARY ─┬→ FETCHING (next unit)
//!                                       │                                               └→ DONE
//!                                       └─ err ─→ RETRYING (bounded) → FETCHING
//!                                                 └→ ERRORED (skip unit) → CHECK_BOUNDARY
//! ```
//!
//! One outstanding remote call per source. Per-unit failures become counters;
//! only [`StoreError`] escapes, because continuing after a local write or
//! backup failure could lose data silently.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use indicatif::ProgressBar;

use crate::adapter::Adapter;
use crate::boundary::{BoundaryDecision, BoundaryTracker};
use crate::clock::Clock;
use crate::config::SourceConfig;
use crate::error::StoreError;
use crate::identity::{ExclusionSet, Resolver, Verdict};
use crate::ledger::{self, LedgerPaths};
use crate::progress::{Counters, ProgressReporter, SharedProgress, fmt_num};
use crate::rate_limit::RateBudgets;
use crate::record::Record;
use crate::retry::{RetryError, call_with_retry};
use crate::shutdown::is_shutdown_requested;
use crate::store::StoreWriter;

/// Process-wide state shared by every source pipeline.
///
/// Constructed once and passed by reference; holds the rate budgets (so
/// sources on the same remote share one) and the run stamp naming this run's
/// backups.
pub struct HarvestContext {
    pub clock: Arc<dyn Clock>,
    pub budgets: RateBudgets,
    pub progress: SharedProgress,
    pub run_stamp: String,
}

impl fmt::Debug for HarvestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HarvestContext")
            .field("run_stamp", &self.run_stamp)
            .finish_non_exhaustive()
    }
}

impl HarvestContext {
    pub fn new(clock: Arc<dyn Clock>, progress: SharedProgress, run_stamp: String) -> Self {
        Self {
            clock,
            budgets: RateBudgets::new(),
            progress,
            run_stamp,
        }
    }
}

/// Where a source pipeline currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    LoadingExclusions,
    Fetching,
    Resolving,
    Appending,
    CheckBoundary,
    Errored,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::LoadingExclusions => "loading exclusions",
            Self::Fetching => "fetching",
            Self::Resolving => "resolving",
            Self::Appending => "appending",
            Self::CheckBoundary => "checking boundary",
            Self::Errored => "errored",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

/// Why a walk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    /// The adapter ran out of units
    #[default]
    Exhausted,
    /// Consecutive-empty threshold reached
    Boundary,
    /// `max_units` reached
    UnitCap,
    /// `max_consecutive_errors` failed units in a row
    TooManyErrors,
    /// The adapter reported the end of the remote's history
    EndOfData,
    /// SIGINT/SIGTERM
    Shutdown,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Exhausted => "exhausted",
            Self::Boundary => "boundary",
            Self::UnitCap => "unit cap",
            Self::TooManyErrors => "too many errors",
            Self::EndOfData => "end of data",
            Self::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Outcome of one source's run.
#[derive(Debug, Clone, Default)]
pub struct HarvestSummary {
    pub source: String,
    /// Exclusion set size after the ledger scan
    pub known_at_start: usize,
    pub units: usize,
    pub collected: usize,
    /// Of `collected`, accepted under a weak (content-hash) key
    pub collected_weak: usize,
    pub duplicates: usize,
    /// Units that failed permanently (not retried)
    pub skipped: usize,
    /// Units whose transient failures exhausted the retries
    pub errored: usize,
    /// Units whose content could not be parsed
    pub parse_failures: usize,
    /// Candidate records with no derivable identity
    pub unkeyed: usize,
    pub backup: Option<PathBuf>,
    pub stop: StopReason,
    pub elapsed: Duration,
}

impl HarvestSummary {
    fn counters(&self) -> Counters {
        Counters {
            units: self.units,
            collected: self.collected,
            duplicates: self.duplicates,
            skipped: self.skipped,
            errored: self.errored + self.parse_failures,
        }
    }

    pub fn log(&self) {
        log::info!(
            "{}: {} collected ({} weak), {} duplicates over {} units; {} skipped, {} errored, {} unparsable, {} unkeyed; stop: {} [{:.1}s]",
            self.source,
            fmt_num(self.collected),
            fmt_num(self.collected_weak),
            fmt_num(self.duplicates),
            fmt_num(self.units),
            self.skipped,
            self.errored,
            self.parse_failures,
            self.unkeyed,
            self.stop,
            self.elapsed.as_secs_f64()
        );
        if let Some(backup) = &self.backup {
            log::info!("{}: pre-run snapshot at {}", self.source, backup.display());
        }
    }
}

/// Render summaries of all sources as a table.
pub fn summary_table(summaries: &[HarvestSummary]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Source").fg(Color::Cyan),
            Cell::new("Known").fg(Color::Cyan),
            Cell::new("Units").fg(Color::Cyan),
            Cell::new("Collected").fg(Color::Cyan),
            Cell::new("Weak").fg(Color::Cyan),
            Cell::new("Dupes").fg(Color::Cyan),
            Cell::new("Skipped").fg(Color::Cyan),
            Cell::new("Errored").fg(Color::Cyan),
            Cell::new("Unkeyed").fg(Color::Cyan),
            Cell::new("Stop").fg(Color::Cyan),
            Cell::new("Time").fg(Color::Cyan),
        ]);
    for s in summaries {
        table.add_row(vec![
            s.source.clone(),
            fmt_num(s.known_at_start),
            fmt_num(s.units),
            fmt_num(s.collected),
            fmt_num(s.collected_weak),
            fmt_num(s.duplicates),
            s.skipped.to_string(),
            (s.errored + s.parse_failures).to_string(),
            fmt_num(s.unkeyed),
            s.stop.to_string(),
            format!("{:.1}s", s.elapsed.as_secs_f64()),
        ]);
    }
    table
}

/// Harvests one source.
pub struct Harvester<'a> {
    ctx: &'a HarvestContext,
    config: &'a SourceConfig,
    resolver: Resolver,
}

impl<'a> Harvester<'a> {
    pub fn new(ctx: &'a HarvestContext, config: &'a SourceConfig) -> Self {
        Self {
            ctx,
            config,
            resolver: Resolver::new(config.identity.clone()),
        }
    }

    fn phase(&self, pb: &ProgressBar, phase: Phase) {
        log::trace!("{}: {phase}", self.config.name);
        pb.set_message(phase.to_string());
    }

    /// Load the exclusion set for this source without harvesting.
    pub fn load_exclusions(
        &self,
        source: &str,
    ) -> Result<(ExclusionSet, ledger::LedgerStats), StoreError> {
        let cfg = self.config;
        let paths = LedgerPaths::discover(&cfg.store_path, &cfg.backup_dir, &cfg.artifacts);
        ledger::load_exclusions(&paths, source, self.resolver.strategy())
    }

    /// Walk the adapter's units until exhausted, the boundary, a cap, or
    /// shutdown.
    pub fn run<A: Adapter>(&self, adapter: &A) -> Result<HarvestSummary, StoreError> {
        let start = Instant::now();
        let cfg = self.config;
        let pb = self.ctx.progress.source_line(&cfg.name);
        self.phase(&pb, Phase::Init);

        let mut summary = HarvestSummary {
            source: cfg.name.clone(),
            ..Default::default()
        };

        self.phase(&pb, Phase::LoadingExclusions);
        let (mut known, ledger_stats) = self.load_exclusions(adapter.source())?;
        ledger_stats.log(&cfg.name, &known);
        summary.known_at_start = known.len();
        let resuming = !known.is_empty();

        let (mut writer, backup) = StoreWriter::open_for_append(
            &cfg.store_path,
            &cfg.backup_dir,
            resuming,
            &self.ctx.run_stamp,
        )?;
        summary.backup = backup;

        let limiter = self.ctx.budgets.budget_for(
            &cfg.remote,
            cfg.max_calls,
            cfg.time_window(),
            &self.ctx.clock,
        );
        let policy = cfg.retry_policy();
        let mut boundary = BoundaryTracker::new(cfg.consecutive_empty_threshold, resuming);
        let mut reporter = ProgressReporter::new(cfg.name.clone(), cfg.progress_interval());
        let mut failed_in_row = 0u32;

        log::info!(
            "{}: harvesting into {} ({})",
            cfg.name,
            cfg.store_path.display(),
            if resuming { "resuming" } else { "fresh" }
        );

        for unit in adapter.units() {
            if is_shutdown_requested() {
                summary.stop = StopReason::Shutdown;
                break;
            }
            if cfg.max_units.is_some_and(|cap| summary.units >= cap) {
                summary.stop = StopReason::UnitCap;
                break;
            }
            summary.units += 1;

            let label = format!("{} {unit}", cfg.name);
            pb.set_message(format!("{unit}: {}", Phase::Fetching));
            let fetched = call_with_retry(
                &label,
                &policy,
                &limiter,
                |e| adapter.classify(e),
                || adapter.fetch(&unit),
            );

            let mut end_of_data = false;
            let outcome = match fetched {
                Ok(payload) => match adapter.parse(&unit, payload) {
                    Ok(records) => {
                        end_of_data = adapter.ends_walk(&unit, &records);
                        self.phase(&pb, Phase::Resolving);
                        Some(self.persist(records, &mut known, &mut writer, &mut summary, &pb)?)
                    }
                    Err(e) => {
                        log::warn!("{label}: {e}, unit skipped");
                        summary.parse_failures += 1;
                        None
                    }
                },
                Err(RetryError::Permanent(e)) => {
                    log::warn!("{label}: skipped ({e})");
                    summary.skipped += 1;
                    None
                }
                Err(e @ RetryError::Exhausted { .. }) => {
                    log::warn!("{label}: {e}, unit skipped");
                    summary.errored += 1;
                    None
                }
            };

            self.phase(&pb, Phase::CheckBoundary);
            let decision = match outcome {
                Some(accepted) => {
                    failed_in_row = 0;
                    boundary.observe(accepted)
                }
                None => {
                    self.phase(&pb, Phase::Errored);
                    failed_in_row += 1;
                    if cfg.max_consecutive_errors > 0 && failed_in_row >= cfg.max_consecutive_errors {
                        log::error!(
                            "{}: {failed_in_row} failed units in a row, giving up on this walk",
                            cfg.name
                        );
                        summary.stop = StopReason::TooManyErrors;
                        break;
                    }
                    boundary.observe_failure()
                }
            };

            reporter.tick(&summary.counters());
            if end_of_data {
                log::info!("{}: {unit} is past the end of the remote's history", cfg.name);
                summary.stop = StopReason::EndOfData;
                break;
            }
            if decision == BoundaryDecision::Stop {
                log::info!(
                    "{}: {} units in a row brought nothing new, stopping at {unit}",
                    cfg.name,
                    boundary.consecutive_empty()
                );
                summary.stop = StopReason::Boundary;
                break;
            }
        }

        self.phase(&pb, Phase::Done);
        pb.finish_and_clear();
        summary.elapsed = start.elapsed();
        debug_assert_eq!(writer.appended(), summary.collected);
        Ok(summary)
    }

    /// Dedup and append one unit's candidates. Returns how many were new.
    fn persist(
        &self,
        records: Vec<Record>,
        known: &mut ExclusionSet,
        writer: &mut StoreWriter,
        summary: &mut HarvestSummary,
        pb: &ProgressBar,
    ) -> Result<usize, StoreError> {
        let mut accepted = 0;
        for record in records {
            match self.resolver.admit(&record, known) {
                Ok(Verdict::Accepted(key)) => {
                    if accepted == 0 {
                        self.phase(pb, Phase::Appending);
                    }
                    writer.append(&record)?;
                    accepted += 1;
                    summary.collected += 1;
                    if key.is_weak() {
                        summary.collected_weak += 1;
                        log::debug!("{}: accepted weak key {key}", self.config.name);
                    }
                }
                Ok(Verdict::Duplicate(_)) => summary.duplicates += 1,
                Err(e) => {
                    log::debug!("{e}");
                    summary.unkeyed += 1;
                }
            }
        }
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_table_shows_unkeyed() {
        let summary = HarvestSummary {
            source: "irc".to_string(),
            unkeyed: 1234,
            stop: StopReason::EndOfData,
            ..Default::default()
        };
        let rendered = summary_table(&[summary]).to_string();
        assert!(rendered.contains("Unkeyed"));
        assert!(rendered.contains("1,234"));
        assert!(rendered.contains("end of data"));
    }
}
