//! Progress reporting for TTY and non-TTY environments.
//!
//! TTY mode: one indicatif spinner line per source, updated per unit.
//! Non-TTY mode: hidden bars plus periodic coarse log lines.

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

/// Central progress context managing multi-progress bars.
pub struct ProgressContext {
    multi: MultiProgress,
    is_tty: bool,
}

impl ProgressContext {
    /// Create new context, detecting TTY automatically.
    pub fn new() -> Self {
        let is_tty = std::io::stderr().is_terminal();
        Self {
            multi: MultiProgress::new(),
            is_tty,
        }
    }

    /// Context that never draws (tests, `--quiet` pipelines).
    pub fn hidden() -> Self {
        Self {
            multi: MultiProgress::new(),
            is_tty: false,
        }
    }

    /// Spinner line for one source's walk.
    ///
    /// Update with `pb.set_message(...)` per unit; `pb.finish_and_clear()`
    /// when the walk ends. Hidden outside a TTY.
    pub fn source_line(&self, name: &str) -> ProgressBar {
        if !self.is_tty {
            return ProgressBar::hidden();
        }
        let pb = self.multi.add(ProgressBar::new(0));
        pb.set_style(
            ProgressStyle::with_template("{spinner:.green} {prefix:<20.cyan.bold} {wide_msg}")
                .expect("invalid template"),
        );
        // Truncate long names to keep lines aligned
        let display: String = name.chars().take(20).collect();
        pb.set_prefix(display);
        pb.enable_steady_tick(Duration::from_millis(80));
        pb
    }

    pub fn is_tty(&self) -> bool {
        self.is_tty
    }

    /// Get reference to `MultiProgress` for log bridge.
    pub fn multi(&self) -> &MultiProgress {
        &self.multi
    }
}

impl Default for ProgressContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe wrapper for `ProgressContext`.
pub type SharedProgress = Arc<ProgressContext>;

/// Running counters a reporter prints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub units: usize,
    pub collected: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub errored: usize,
}

/// Emits a coarse progress log line at most once per interval.
#[derive(Debug)]
pub struct ProgressReporter {
    label: String,
    interval: Duration,
    last: Instant,
}

impl ProgressReporter {
    pub fn new(label: impl Into<String>, interval: Duration) -> Self {
        Self {
            label: label.into(),
            interval,
            last: Instant::now(),
        }
    }

    /// Log `counters` if the interval has elapsed. Returns whether it logged.
    pub fn tick(&mut self, counters: &Counters) -> bool {
        if self.last.elapsed() < self.interval {
            return false;
        }
        self.last = Instant::now();
        log::info!(
            "{}: {} units, {} collected, {} duplicates, {} skipped, {} errored",
            self.label,
            fmt_num(counters.units),
            fmt_num(counters.collected),
            fmt_num(counters.duplicates),
            counters.skipped,
            counters.errored
        );
        true
    }
}

/// Format number with thousand separators.
pub fn fmt_num(n: usize) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fmt_num_small() {
        assert_eq!(fmt_num(0), "0");
        assert_eq!(fmt_num(123), "123");
    }

    #[test]
    fn fmt_num_thousands() {
        assert_eq!(fmt_num(1_000), "1,000");
        assert_eq!(fmt_num(123_456), "123,456");
        assert_eq!(fmt_num(1_234_567), "1,234,567");
    }

    #[test]
    fn reporter_respects_interval() {
        let counters = Counters::default();
        let mut every = ProgressReporter::new("irc", Duration::ZERO);
        assert!(every.tick(&counters));
        assert!(every.tick(&counters));

        let mut rare = ProgressReporter::new("irc", Duration::from_secs(3600));
        assert!(!rare.tick(&counters));
    }

    #[test]
    fn hidden_context_hides_lines() {
        let ctx = ProgressContext::hidden();
        assert!(!ctx.is_tty());
        assert!(ctx.source_line("gerrit").is_hidden());
    }
}
