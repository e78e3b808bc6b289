//! Harvline Core - resumable, rate-limited, deduplicating harvesting engine
//!
//! Source-specific collectors implement [`Adapter`]; this crate supplies the
//! rest: rate budgets, retry with backoff, identity keys and dedup, the
//! append-only store with pre-run backups, the resume ledger, early stop, and
//! the per-source orchestration loop.

pub mod adapter;
pub mod boundary;
pub mod clock;
pub mod config;
pub mod error;
pub mod harvest;
pub mod identity;
pub mod ledger;
pub mod logging;
pub mod progress;
pub mod rate_limit;
pub mod record;
pub mod retry;
pub mod shutdown;
pub mod store;

// Re-exports for convenience
pub use adapter::Adapter;
pub use boundary::{BoundaryDecision, BoundaryTracker};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SourceConfig;
pub use error::{ParseError, StoreError};
pub use harvest::{HarvestContext, HarvestSummary, Harvester, Phase, StopReason, summary_table};
pub use identity::{ExclusionSet, IdentityKey, IdentityStrategy, Resolver, Verdict};
pub use ledger::{LedgerPaths, LedgerStats, load_exclusions};
pub use logging::{IndicatifLogger, init_logging};
pub use progress::{ProgressContext, SharedProgress};
pub use rate_limit::{RateBudgets, RateLimiter};
pub use record::Record;
pub use retry::{FailureClass, RetryError, RetryPolicy, call_with_retry};
pub use shutdown::{install_signal_handlers, is_shutdown_requested, request_shutdown, shutdown_flag};
pub use store::{StoreWriter, run_stamp};
