//! Engine configuration with serde defaults.
//!
//! Every field has a default so a bare `[engine]` / `[job_executor]` TOML
//! table (or none at all) yields a working configuration.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How many times the command pipeline re-runs a unit of work after a
    /// concurrent-update conflict before surfacing the error.
    #[serde(default = "default_command_retries")]
    pub command_retries: u32,

    /// Job executor tuning.
    #[serde(default)]
    pub job_executor: JobExecutorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_retries: default_command_retries(),
            job_executor: JobExecutorConfig::default(),
        }
    }
}

fn default_command_retries() -> u32 {
    3
}

// ---------------------------------------------------------------------------
// JobExecutorConfig
// ---------------------------------------------------------------------------

/// Tuning for one job executor instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecutorConfig {
    /// Acquisition poll interval in seconds.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Maximum jobs fetched per acquisition cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Bounded worker pool size.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    /// Claim lease duration in seconds. Crashed workers' claims become
    /// acquirable again once the lease expires.
    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: u64,
    /// Retries granted to newly created jobs.
    #[serde(default = "default_job_retries")]
    pub default_retries: u32,
    /// Base of the exponential retry backoff, in seconds.
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    /// Backoff ceiling in seconds.
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    /// How long shutdown waits for in-flight workers to drain.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            batch_size: default_batch_size(),
            worker_pool_size: default_worker_pool_size(),
            lock_lease_secs: default_lock_lease_secs(),
            default_retries: default_job_retries(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_batch_size() -> usize {
    10
}

fn default_worker_pool_size() -> usize {
    4
}

fn default_lock_lease_secs() -> u64 {
    300
}

fn default_job_retries() -> u32 {
    3
}

fn default_backoff_base_secs() -> u64 {
    10
}

fn default_backoff_max_secs() -> u64 {
    3600
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
