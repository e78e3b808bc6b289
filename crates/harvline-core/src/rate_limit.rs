//! Sliding-window rate limiter, one per remote.
//!
//! Uses `Mutex<VecDeque<Instant>>`; the lock is released while waiting so
//! `can_proceed` stays responsive.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use crate::clock::Clock;

/// Extra wait past the oldest entry's expiry, absorbs timer granularity
pub const SAFETY_MARGIN: Duration = Duration::from_millis(50);

/// Bounds calls to one remote to `max_calls` per sliding `window`.
pub struct RateLimiter {
    max_calls: usize,
    window: Duration,
    calls: Mutex<VecDeque<Instant>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_calls", &self.max_calls)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// `max_calls` is clamped to at least 1.
    pub fn new(max_calls: usize, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_calls: max_calls.max(1),
            window,
            calls: Mutex::new(VecDeque::with_capacity(max_calls)),
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn prune(&self, calls: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&oldest) = calls.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                calls.pop_front();
            } else {
                break;
            }
        }
    }

    /// Block until a call fits in the window, then record it.
    ///
    /// Returns the total time spent waiting.
    pub fn acquire(&self) -> Duration {
        let mut waited = Duration::ZERO;
        loop {
            let wait = {
                let mut calls = self.calls.lock().expect("rate limiter lock poisoned");
                let now = self.clock.now();
                self.prune(&mut calls, now);
                if calls.len() < self.max_calls {
                    calls.push_back(now);
                    return waited;
                }
                // Front exists: len >= max_calls >= 1
                let oldest = calls[0];
                (oldest + self.window).saturating_duration_since(now) + SAFETY_MARGIN
            };
            log::debug!("rate limit reached, waiting {:.2}s", wait.as_secs_f64());
            self.clock.sleep(wait);
            waited += wait;
        }
    }

    /// Whether `acquire` would return without waiting. Records nothing.
    pub fn can_proceed(&self) -> bool {
        let mut calls = self.calls.lock().expect("rate limiter lock poisoned");
        let now = self.clock.now();
        self.prune(&mut calls, now);
        calls.len() < self.max_calls
    }

    /// Calls currently inside the window.
    pub fn in_window(&self) -> usize {
        let mut calls = self.calls.lock().expect("rate limiter lock poisoned");
        let now = self.clock.now();
        self.prune(&mut calls, now);
        calls.len()
    }
}

/// Rate budgets keyed by remote name.
///
/// Sources that name the same remote get the same limiter; the first source
/// to register a remote fixes its limits.
#[derive(Default)]
pub struct RateBudgets {
    budgets: Mutex<FxHashMap<String, Arc<RateLimiter>>>,
}

impl RateBudgets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn budget_for(
        &self,
        remote: &str,
        max_calls: usize,
        window: Duration,
        clock: &Arc<dyn Clock>,
    ) -> Arc<RateLimiter> {
        let mut budgets = self.budgets.lock().expect("budget registry poisoned");
        budgets
            .entry(remote.to_string())
            .or_insert_with(|| {
                log::debug!(
                    "rate budget {remote}: {max_calls} calls / {:.0}s",
                    window.as_secs_f64()
                );
                Arc::new(RateLimiter::new(max_calls, window, clock.clone()))
            })
            .clone()
    }
}
