//! Durable job execution: claiming, worker dispatch, retry backoff, and
//! tenant-scoped executor management.
//!
//! Jobs are ordinary rows claimed through optimistic locking, so any number
//! of engine nodes can run executors against the same store without an
//! external coordinator. A claim that loses the revision race simply skips
//! the job.

pub mod executor;
pub mod handlers;
pub mod tenant;

use chrono::{DateTime, Duration, Utc};

use windlass_types::config::JobExecutorConfig;

/// What a handler did with a claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The work is done; the job row is consumed with the unit of work.
    Completed,
    /// The target cannot accept the work yet (e.g. its instance is
    /// suspended). The job stays, rescheduled, with its retry budget
    /// untouched.
    Deferred,
}

/// Due date for the next attempt after `failures` previous failures
/// (1-based). Exponential in the failure count, capped at the configured
/// ceiling.
pub(crate) fn retry_due_date(
    config: &JobExecutorConfig,
    failures: u32,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let exponent = failures.saturating_sub(1).min(32);
    let backoff_secs = config
        .backoff_base_secs
        .saturating_mul(1u64 << exponent)
        .min(config.backoff_max_secs);
    now + Duration::seconds(backoff_secs as i64)
}
