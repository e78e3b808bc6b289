//! End-to-end harvest runs against synthetic sources.
//!
//! Sources are in-memory page lists walked newest-first; time is virtual
//! (`ManualClock`), so rate-limit waits and backoff sleeps cost nothing.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use harvline_core::{
    Adapter, Clock, FailureClass, HarvestContext, HarvestSummary, Harvester, ManualClock,
    ParseError, ProgressContext, RateLimiter, Record, SourceConfig, StopReason, StoreError,
};
use tempfile::TempDir;

// =============================================================================
// Synthetic source
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum FakeError {
    Throttled,
    Gone,
}

impl fmt::Display for FakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Throttled => f.write_str("429 too many requests"),
            Self::Gone => f.write_str("404 not found"),
        }
    }
}

/// Pages of record IDs, page 0 newest. `None` ids become weak-keyed chat lines.
struct PagedSource {
    pages: Vec<Vec<&'static str>>,
    /// Scripted failures per page, consumed one per fetch attempt
    failures: RefCell<HashMap<usize, VecDeque<FakeError>>>,
    broken_pages: Vec<usize>,
    /// Repeat the last page forever instead of ending the walk
    endless: bool,
    /// Report an empty page as the end of history
    ends_on_empty: bool,
    clock: Option<Arc<ManualClock>>,
    fetch_times: RefCell<Vec<Instant>>,
    fetches: Cell<usize>,
}

impl PagedSource {
    fn new(pages: Vec<Vec<&'static str>>) -> Self {
        Self {
            pages,
            failures: RefCell::new(HashMap::new()),
            broken_pages: Vec::new(),
            endless: false,
            ends_on_empty: false,
            clock: None,
            fetch_times: RefCell::new(Vec::new()),
            fetches: Cell::new(0),
        }
    }

    fn fail(self, page: usize, errors: &[FakeError]) -> Self {
        self.failures
            .borrow_mut()
            .insert(page, errors.iter().copied().collect());
        self
    }

    fn endless(mut self) -> Self {
        self.endless = true;
        self
    }

    fn ends_on_empty(mut self) -> Self {
        self.ends_on_empty = true;
        self
    }

    fn broken(mut self, page: usize) -> Self {
        self.broken_pages.push(page);
        self
    }

    fn timed(mut self, clock: Arc<ManualClock>) -> Self {
        self.clock = Some(clock);
        self
    }
}

fn record(id: &str) -> Record {
    Record::new("review", "synthetic")
        .with_id(id)
        .with_field("body", format!("comment {id}"))
}

impl Adapter for PagedSource {
    type Unit = usize;
    type Payload = Vec<Record>;
    type Error = FakeError;

    fn source(&self) -> &str {
        "review"
    }

    fn units(&self) -> Box<dyn Iterator<Item = usize> + '_> {
        if self.endless {
            Box::new(0..)
        } else {
            Box::new(0..self.pages.len())
        }
    }

    fn fetch(&self, unit: &usize) -> Result<Vec<Record>, FakeError> {
        self.fetches.set(self.fetches.get() + 1);
        if let Some(clock) = &self.clock {
            self.fetch_times.borrow_mut().push(clock.now());
        }
        if let Some(err) = self
            .failures
            .borrow_mut()
            .get_mut(unit)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        let idx = (*unit).min(self.pages.len() - 1);
        // Fresh records every fetch: identity must not depend on the instance
        Ok(self.pages[idx].iter().map(|id| record(id)).collect())
    }

    fn classify(&self, err: &FakeError) -> FailureClass {
        match err {
            FakeError::Throttled => FailureClass::Transient,
            FakeError::Gone => FailureClass::Permanent,
        }
    }

    fn parse(&self, unit: &usize, payload: Vec<Record>) -> Result<Vec<Record>, ParseError> {
        if self.broken_pages.contains(unit) {
            return Err(ParseError::new(format!("page {unit}: unexpected markup")));
        }
        Ok(payload)
    }

    fn ends_walk(&self, _unit: &usize, records: &[Record]) -> bool {
        self.ends_on_empty && records.is_empty()
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    dir: TempDir,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
            clock: Arc::new(ManualClock::new()),
        }
    }

    fn store(&self) -> std::path::PathBuf {
        self.dir.path().join("review.jsonl")
    }

    fn backups(&self) -> std::path::PathBuf {
        self.dir.path().join("backups")
    }

    fn config(&self, threshold: u32) -> SourceConfig {
        SourceConfig {
            name: "review".to_string(),
            remote: "review-host".to_string(),
            store_path: self.store(),
            backup_dir: self.backups(),
            max_calls: 5,
            time_window_seconds: 10.0,
            max_retries: 2,
            backoff_base_seconds: 1.0,
            consecutive_empty_threshold: threshold,
            ..Default::default()
        }
    }

    fn context(&self, stamp: &str) -> HarvestContext {
        let clock: Arc<dyn Clock> = self.clock.clone();
        HarvestContext::new(clock, Arc::new(ProgressContext::hidden()), stamp.to_string())
    }

    fn run(&self, config: &SourceConfig, stamp: &str, source: &PagedSource) -> HarvestSummary {
        let ctx = self.context(stamp);
        Harvester::new(&ctx, config)
            .run(source)
            .expect("harvest should succeed")
    }

    fn seed(&self, ids: &[&str]) {
        let mut content = String::new();
        for id in ids {
            content.push_str(&String::from_utf8(record(id).to_line().unwrap()).unwrap());
            content.push('\n');
        }
        fs::write(self.store(), content).unwrap();
    }

    fn stored_ids(&self) -> Vec<String> {
        read_ids(&self.store())
    }
}

fn read_ids(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter_map(|l| serde_json::from_str::<Record>(l).ok())
        .filter_map(|r| r.id)
        .collect()
}

// =============================================================================
// Properties
// =============================================================================

/// Known {A, B}; pages [A,B], [B,C], [D]: page 1 brings nothing, page 2
/// brings C and resets the counter, page 3 brings D.
#[test]
fn scenario_a_resume_collects_only_new() {
    let h = Harness::new();
    h.seed(&["A", "B"]);
    let before = fs::read(h.store()).unwrap();

    let source = PagedSource::new(vec![vec!["A", "B"], vec!["B", "C"], vec!["D"]]);
    let summary = h.run(&h.config(2), "20261018T090000.000Z", &source);

    assert_eq!(h.stored_ids(), vec!["A", "B", "C", "D"]);
    assert_eq!(summary.known_at_start, 2);
    assert_eq!(summary.collected, 2);
    assert_eq!(summary.duplicates, 3);
    assert_eq!(summary.units, 3);
    assert_eq!(summary.stop, StopReason::Exhausted);

    // Snapshot equals the store as it was before the run
    let backup = summary.backup.expect("resumed run must snapshot the store");
    assert_eq!(fs::read(backup).unwrap(), before);
}

/// A resumed walk is armed from the first unit, so with threshold 1 the
/// duplicate-only first page ends it before C and D are reached.
#[test]
fn scenario_a_threshold_one_stops_after_first_page() {
    let h = Harness::new();
    h.seed(&["A", "B"]);

    let source = PagedSource::new(vec![vec!["A", "B"], vec!["B", "C"], vec!["D"]]);
    let summary = h.run(&h.config(1), "20261018T090000.000Z", &source);

    assert_eq!(summary.stop, StopReason::Boundary);
    assert_eq!(summary.units, 1);
    assert_eq!(summary.collected, 0);
    assert_eq!(h.stored_ids(), vec!["A", "B"]);
}

#[test]
fn second_run_is_idempotent() {
    let h = Harness::new();
    let pages = vec![vec!["1", "2"], vec!["3"], vec!["4", "5"], vec!["6"]];
    let config = h.config(3);

    let first = h.run(&config, "20261018T090000.000Z", &PagedSource::new(pages.clone()));
    assert_eq!(first.collected, 6);
    assert!(first.backup.is_none());
    let after_first = fs::read(h.store()).unwrap();

    let second = h.run(&config, "20261018T100000.000Z", &PagedSource::new(pages));
    assert_eq!(second.collected, 0);
    assert_eq!(second.known_at_start, 6);
    assert_eq!(fs::read(h.store()).unwrap(), after_first);
}

#[test]
fn interrupted_run_resumes_to_same_store() {
    let pages = vec![vec!["1", "2"], vec!["3", "4"], vec!["5"], vec!["6", "7"]];

    let whole = Harness::new();
    let config = whole.config(0);
    whole.run(&config, "20261018T090000.000Z", &PagedSource::new(pages.clone()));

    let split = Harness::new();
    let mut partial = split.config(0);
    partial.max_units = Some(2);
    let cut = split.run(&partial, "20261018T090000.000Z", &PagedSource::new(pages.clone()));
    assert_eq!(cut.stop, StopReason::UnitCap);
    assert_eq!(split.stored_ids(), vec!["1", "2", "3", "4"]);

    let resumed = split.run(&split.config(0), "20261018T100000.000Z", &PagedSource::new(pages));
    assert_eq!(resumed.collected, 3);
    assert_eq!(
        fs::read(split.store()).unwrap(),
        fs::read(whole.store()).unwrap()
    );
}

#[test]
fn torn_final_line_does_not_duplicate_on_resume() {
    let h = Harness::new();
    h.seed(&["1", "2"]);
    // Killed mid-write of record 3
    let mut content = fs::read_to_string(h.store()).unwrap();
    content.push_str("{\"source\":\"review\",\"id\":\"3\",\"fie");
    fs::write(h.store(), content).unwrap();

    let source = PagedSource::new(vec![vec!["1", "2", "3"], vec!["4"]]);
    let summary = h.run(&h.config(0), "20261018T090000.000Z", &source);

    assert_eq!(summary.collected, 2);
    assert_eq!(h.stored_ids(), vec!["1", "2", "3", "4"]);
}

#[test]
fn all_known_source_stops_at_threshold() {
    let h = Harness::new();
    h.seed(&["x", "y"]);
    let source = PagedSource::new(vec![vec!["x", "y"]]).endless();

    let summary = h.run(&h.config(3), "20261018T090000.000Z", &source);

    assert_eq!(summary.stop, StopReason::Boundary);
    assert_eq!(summary.units, 3);
    assert_eq!(summary.collected, 0);
    assert_eq!(source.fetches.get(), 3);
}

#[test]
fn empty_page_ends_fresh_walk() {
    let h = Harness::new();
    // Fresh store: the boundary never arms on a source with no data at all
    let source = PagedSource::new(vec![vec![]]).endless().ends_on_empty();

    let summary = h.run(&h.config(5), "20261018T090000.000Z", &source);

    assert_eq!(summary.stop, StopReason::EndOfData);
    assert_eq!(summary.units, 1);
    assert_eq!(source.fetches.get(), 1);
}

#[test]
fn backfill_without_boundary_ends_at_empty_page() {
    let h = Harness::new();
    let source = PagedSource::new(vec![vec!["1", "2"], vec!["3"], vec![]])
        .endless()
        .ends_on_empty();

    let summary = h.run(&h.config(0), "20261018T090000.000Z", &source);

    assert_eq!(summary.stop, StopReason::EndOfData);
    assert_eq!(summary.units, 3);
    assert_eq!(summary.collected, 3);
    assert_eq!(h.stored_ids(), vec!["1", "2", "3"]);
}

#[test]
fn transient_failure_retried_with_same_identity() {
    let h = Harness::new();
    let source = PagedSource::new(vec![vec!["1", "2"], vec!["2", "3"]])
        .fail(0, &[FakeError::Throttled]);

    let summary = h.run(&h.config(3), "20261018T090000.000Z", &source);

    assert_eq!(summary.collected, 3);
    assert_eq!(summary.duplicates, 1);
    assert_eq!(summary.errored, 0);
    assert_eq!(source.fetches.get(), 3);
    assert_eq!(h.stored_ids(), vec!["1", "2", "3"]);
    assert!(h.clock.sleeps().contains(&Duration::from_secs(1)));
}

#[test]
fn remote_failures_skip_units_and_continue() {
    let h = Harness::new();
    let source = PagedSource::new(vec![vec!["1"], vec!["2"], vec!["3"]])
        .fail(0, &[FakeError::Gone])
        .fail(1, &[FakeError::Throttled; 3]);

    let summary = h.run(&h.config(3), "20261018T090000.000Z", &source);

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.errored, 1);
    assert_eq!(summary.collected, 1);
    assert_eq!(summary.stop, StopReason::Exhausted);
    // 1 permanent attempt + 3 transient attempts + 1 success
    assert_eq!(source.fetches.get(), 5);
    assert_eq!(h.stored_ids(), vec!["3"]);
}

#[test]
fn parse_failure_writes_nothing_from_unit() {
    let h = Harness::new();
    let source = PagedSource::new(vec![vec!["1"], vec!["2"], vec!["3"]]).broken(1);

    let summary = h.run(&h.config(3), "20261018T090000.000Z", &source);

    assert_eq!(summary.parse_failures, 1);
    assert_eq!(h.stored_ids(), vec!["1", "3"]);
}

#[test]
fn consecutive_failures_end_walk() {
    let h = Harness::new();
    let source = PagedSource::new(vec![vec!["1"]; 10])
        .fail(0, &[FakeError::Gone])
        .fail(1, &[FakeError::Gone])
        .fail(2, &[FakeError::Gone]);
    let mut config = h.config(0);
    config.max_consecutive_errors = 3;

    let summary = h.run(&config, "20261018T090000.000Z", &source);

    assert_eq!(summary.stop, StopReason::TooManyErrors);
    assert_eq!(summary.units, 3);
    assert_eq!(summary.collected, 0);
}

#[test]
fn weak_keys_dedup_across_overlapping_pages() {
    struct ChatLog;

    impl Adapter for ChatLog {
        type Unit = usize;
        type Payload = Vec<(&'static str, &'static str)>;
        type Error = FakeError;

        fn source(&self) -> &str {
            "irc"
        }

        fn units(&self) -> Box<dyn Iterator<Item = usize> + '_> {
            Box::new(0..2)
        }

        fn fetch(&self, unit: &usize) -> Result<Self::Payload, FakeError> {
            Ok(match unit {
                0 => vec![("alice", "hi all"), ("bob", "morning")],
                _ => vec![("bob", "morning"), ("carol", "o/")],
            })
        }

        fn classify(&self, _: &FakeError) -> FailureClass {
            FailureClass::Permanent
        }

        fn parse(&self, _: &usize, lines: Self::Payload) -> Result<Vec<Record>, ParseError> {
            Ok(lines
                .into_iter()
                .map(|(nick, body)| {
                    Record::new("irc", "log")
                        .with_field("nick", nick)
                        .with_field("body", body)
                })
                .collect())
        }
    }

    let h = Harness::new();
    let ctx = h.context("20261018T090000.000Z");
    let config = h.config(3);
    let summary = Harvester::new(&ctx, &config).run(&ChatLog).unwrap();

    assert_eq!(summary.collected, 3);
    assert_eq!(summary.collected_weak, 3);
    assert_eq!(summary.duplicates, 1);

    // Re-run: ledger rebuilds weak keys from disk
    let summary = Harvester::new(&ctx, &config).run(&ChatLog).unwrap();
    assert_eq!(summary.collected, 0);
    assert_eq!(summary.duplicates, 4);
}

#[test]
fn fetches_respect_rate_budget() {
    let h = Harness::new();
    let source = PagedSource::new((0..20).map(|_| vec!["same"]).collect()).timed(h.clock.clone());
    let mut config = h.config(0);
    config.max_calls = 3;
    config.time_window_seconds = 10.0;

    h.run(&config, "20261018T090000.000Z", &source);

    let times = source.fetch_times.borrow();
    assert_eq!(times.len(), 20);
    let window = Duration::from_secs(10);
    for (i, start) in times.iter().enumerate() {
        let in_window = times[i..]
            .iter()
            .filter(|t| t.saturating_duration_since(*start) < window)
            .count();
        assert!(in_window <= 3, "{in_window} calls in window starting at fetch {i}");
    }
}

/// max_calls=2 per 10s: the third back-to-back acquire lands ≥ 10s after the first.
#[test]
fn scenario_b_third_call_waits_full_window() {
    let clock = Arc::new(ManualClock::new());
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let limiter = RateLimiter::new(2, Duration::from_secs(10), dyn_clock);

    limiter.acquire();
    let first = clock.now();
    limiter.acquire();
    limiter.acquire();
    assert!(clock.now() - first >= Duration::from_secs(10));
}

#[test]
fn failed_backup_aborts_run() {
    let h = Harness::new();
    h.seed(&["1"]);
    let before = fs::read(h.store()).unwrap();
    fs::write(h.backups(), "a file where the backup dir should be").unwrap();

    let ctx = h.context("20261018T090000.000Z");
    let config = h.config(3);
    let source = PagedSource::new(vec![vec!["2"]]);
    let err = Harvester::new(&ctx, &config).run(&source).unwrap_err();

    assert!(matches!(err, StoreError::Backup { .. }));
    assert_eq!(source.fetches.get(), 0);
    assert_eq!(fs::read(h.store()).unwrap(), before);
}

#[test]
fn resumed_runs_accumulate_backups() {
    let h = Harness::new();
    let config = h.config(3);
    h.run(&config, "20261018T090000.000Z", &PagedSource::new(vec![vec!["1"]]));
    h.run(&config, "20261018T100000.000Z", &PagedSource::new(vec![vec!["2"]]));
    h.run(&config, "20261018T110000.000Z", &PagedSource::new(vec![vec!["3"]]));

    let mut backups: Vec<_> = fs::read_dir(h.backups())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    backups.sort();
    assert_eq!(backups.len(), 2);
    assert_eq!(read_ids(&backups[0]), vec!["1"]);
    assert_eq!(read_ids(&backups[1]), vec!["1", "2"]);
    assert_eq!(h.stored_ids(), vec!["1", "2", "3"]);
}
