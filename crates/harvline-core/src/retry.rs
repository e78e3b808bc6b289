//! Retry with linear backoff around one remote call

use std::fmt;
use std::time::Duration;

use crate::rate_limit::RateLimiter;

/// How a remote failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Rate-limited, timed out, connection reset: worth waiting and retrying
    Transient,
    /// Not found, auth failure, malformed response: retrying will not help
    Permanent,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Permanent => f.write_str("permanent"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    /// Linear backoff: retry n waits n × base (5s, 10s, 15s, ... for base 5s)
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        self.backoff_base.saturating_mul(attempt)
    }
}

/// Final failure after the retry controller gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Classified permanent; not retried
    Permanent(E),
    /// Transient on every attempt
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            Self::Permanent(e) | Self::Exhausted { last: e, .. } => e,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Permanent(e) => write!(f, "permanent failure: {e}"),
            Self::Exhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempts: {last}")
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

/// Run `attempt_fn` under the rate limiter, retrying transient failures.
///
/// The limiter is acquired before every attempt, retries included, so backoff
/// never lets a source exceed its budget. Sleeps go through the limiter's
/// clock.
pub fn call_with_retry<T, E: fmt::Display>(
    label: &str,
    policy: &RetryPolicy,
    limiter: &RateLimiter,
    classify: impl Fn(&E) -> FailureClass,
    mut attempt_fn: impl FnMut() -> Result<T, E>,
) -> Result<T, RetryError<E>> {
    let mut attempt = 0u32;
    loop {
        limiter.acquire();
        match attempt_fn() {
            Ok(v) => return Ok(v),
            Err(e) => match classify(&e) {
                FailureClass::Permanent => {
                    log::warn!("{label}: permanent failure: {e}");
                    return Err(RetryError::Permanent(e));
                }
                FailureClass::Transient if attempt < policy.max_retries => {
                    attempt += 1;
                    let delay = policy.backoff_duration(attempt);
                    log::debug!(
                        "{label}: attempt {attempt}/{} failed: {e}, retrying in {:.1}s",
                        policy.max_retries,
                        delay.as_secs_f64()
                    );
                    limiter.clock().sleep(delay);
                }
                FailureClass::Transient => {
                    log::error!("{label}: failed after {} attempts: {e}", attempt + 1);
                    return Err(RetryError::Exhausted {
                        attempts: attempt + 1,
                        last: e,
                    });
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::cell::Cell;
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    enum FakeError {
        Throttled,
        NotFound,
    }

    impl fmt::Display for FakeError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    fn classify(e: &FakeError) -> FailureClass {
        match e {
            FakeError::Throttled => FailureClass::Transient,
            FakeError::NotFound => FailureClass::Permanent,
        }
    }

    fn setup() -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::new());
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let limiter = RateLimiter::new(100, Duration::from_secs(1), dyn_clock);
        (clock, limiter)
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_base: Duration::from_secs(2),
        }
    }

    #[test]
    fn backoff_linear() {
        let p = policy(3);
        assert_eq!(p.backoff_duration(1), Duration::from_secs(2));
        assert_eq!(p.backoff_duration(2), Duration::from_secs(4));
        assert_eq!(p.backoff_duration(3), Duration::from_secs(6));
    }

    #[test]
    fn transient_then_success() {
        let (clock, limiter) = setup();
        let calls = Cell::new(0);
        let result = call_with_retry("unit", &policy(3), &limiter, classify, || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(FakeError::Throttled)
            } else {
                Ok("page")
            }
        });
        assert_eq!(result.unwrap(), "page");
        assert_eq!(calls.get(), 3);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(2), Duration::from_secs(4)]
        );
    }

    #[test]
    fn permanent_not_retried() {
        let (clock, limiter) = setup();
        let calls = Cell::new(0);
        let result: Result<(), _> = call_with_retry("unit", &policy(3), &limiter, classify, || {
            calls.set(calls.get() + 1);
            Err(FakeError::NotFound)
        });
        let err = result.unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(err.into_inner(), FakeError::NotFound);
        assert_eq!(calls.get(), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn exhausted_after_max_retries() {
        let (_clock, limiter) = setup();
        let calls = Cell::new(0);
        let result: Result<(), _> = call_with_retry("unit", &policy(2), &limiter, classify, || {
            calls.set(calls.get() + 1);
            Err(FakeError::Throttled)
        });
        match result.unwrap_err() {
            RetryError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert_eq!(last, FakeError::Throttled);
            }
            other => panic!("expected exhaustion, got {other}"),
        }
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn every_attempt_goes_through_limiter() {
        let clock = Arc::new(ManualClock::new());
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let limiter = RateLimiter::new(1, Duration::from_secs(60), dyn_clock);
        let zero = RetryPolicy {
            max_retries: 1,
            backoff_base: Duration::ZERO,
        };
        let _: Result<(), _> =
            call_with_retry("unit", &zero, &limiter, classify, || Err(FakeError::Throttled));
        // Second attempt had to wait out the 60s window
        assert!(clock.elapsed() >= Duration::from_secs(60));
    }
}
