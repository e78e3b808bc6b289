//! Early-stop heuristic for backward / paginated walks.
//!
//! Walks run newest-first, so once `threshold` consecutive units bring
//! nothing new the walk has most likely reached what earlier runs collected.
//! This bounds run time against long histories; an isolated gap behind a long
//! run of duplicate-only units can be missed.

/// What the orchestration loop should do after a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryDecision {
    Continue,
    Stop,
}

/// Counts consecutive units with zero newly-accepted records.
///
/// The tracker is *armed* once the run has collected at least one record, or
/// from the start when the run resumes into known history (non-empty
/// exclusion set). A fresh run into an empty store is never stopped early:
/// empty units there mean sparse history, not a known boundary.
#[derive(Debug, Clone)]
pub struct BoundaryTracker {
    threshold: u32,
    consecutive_empty: u32,
    collected: u64,
    resumed: bool,
}

impl BoundaryTracker {
    /// `threshold == 0` disables early stop.
    pub fn new(threshold: u32, resumed: bool) -> Self {
        Self {
            threshold,
            consecutive_empty: 0,
            collected: 0,
            resumed,
        }
    }

    fn armed(&self) -> bool {
        self.collected > 0 || self.resumed
    }

    /// Record the outcome of a unit that was fetched and parsed.
    pub fn observe(&mut self, accepted: usize) -> BoundaryDecision {
        if accepted > 0 {
            self.collected += accepted as u64;
            self.consecutive_empty = 0;
        } else {
            self.consecutive_empty = self.consecutive_empty.saturating_add(1);
        }
        self.decide()
    }

    /// A unit that failed tells nothing about the boundary; the counter is
    /// left untouched.
    pub fn observe_failure(&mut self) -> BoundaryDecision {
        self.decide()
    }

    fn decide(&self) -> BoundaryDecision {
        if self.threshold > 0 && self.consecutive_empty >= self.threshold && self.armed() {
            BoundaryDecision::Stop
        } else {
            BoundaryDecision::Continue
        }
    }

    pub fn consecutive_empty(&self) -> u32 {
        self.consecutive_empty
    }

    pub fn collected(&self) -> u64 {
        self.collected
    }
}
