//! Job acquisition loop and worker dispatch.
//!
//! One executor polls for acquirable jobs (for one tenant), claims each with
//! a non-retrying optimistic-lock command, and hands claimed jobs to a
//! bounded worker pool. Claim, execution, and failure bookkeeping are each
//! their own unit of work, so a worker crash at any point leaves either an
//! unclaimed job, a leased claim that expires, or a rescheduled retry.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use windlass_types::entity::{JobEntity, Selector, StoredEntity};

use crate::command::Command;
use crate::command::context::CommandContext;
use crate::command::pipeline::CommandPipeline;
use crate::error::EngineError;
use crate::job::{JobOutcome, retry_due_date};
use crate::storage::StorageBackend;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Claim one job by writing a lock lease under its current revision.
///
/// Never retried: losing the revision race means another node claimed the
/// job, and the right response is to move on, not to fight for it.
pub struct ClaimJobCommand {
    pub job_id: Uuid,
    pub owner: String,
    pub tenant_id: Option<String>,
}

impl<S: StorageBackend> Command<S> for ClaimJobCommand {
    type Output = bool;

    fn name(&self) -> &'static str {
        "claim-job"
    }

    fn max_retries(&self, _config: &windlass_types::config::EngineConfig) -> u32 {
        0
    }

    async fn run(&self, ctx: &mut CommandContext<S>) -> Result<bool, EngineError> {
        let Some(mut job) = ctx.session().find_job(self.job_id).await? else {
            return Ok(false);
        };
        if !job.is_acquirable(self.tenant_id.as_deref(), Utc::now()) {
            return Ok(false);
        }
        job.lock_owner = Some(self.owner.clone());
        job.lock_expiry =
            Some(Utc::now() + Duration::seconds(ctx.config().job_executor.lock_lease_secs as i64));
        ctx.session().update(job);
        Ok(true)
    }
}

/// Run a claimed job's handler and delete the job, as one unit of work.
pub struct ExecuteJobCommand {
    pub job_id: Uuid,
    pub owner: String,
}

impl<S: StorageBackend> Command<S> for ExecuteJobCommand {
    type Output = ();

    fn name(&self) -> &'static str {
        "execute-job"
    }

    async fn run(&self, ctx: &mut CommandContext<S>) -> Result<(), EngineError> {
        let Some(job) = ctx.session().find_job(self.job_id).await? else {
            return Ok(());
        };
        // A lapsed lease may have been reclaimed elsewhere.
        if job.lock_owner.as_deref() != Some(self.owner.as_str()) {
            tracing::debug!(job_id = %self.job_id, "claim no longer ours, skipping");
            return Ok(());
        }

        let handler = ctx.services().job_handlers.resolve(job.kind)?;
        match handler.execute(&job, ctx).await? {
            JobOutcome::Completed => ctx.session().delete(job),
            JobOutcome::Deferred => {
                // Target not ready (suspended instance): keep the job, push
                // it past the next poll, leave the retry budget alone.
                let mut job = job;
                job.lock_owner = None;
                job.lock_expiry = None;
                job.due_date = Utc::now()
                    + Duration::seconds(ctx.config().job_executor.poll_interval_secs as i64);
                tracing::debug!(
                    job_id = %job.id,
                    kind = %job.kind,
                    next_due = %job.due_date,
                    "job deferred, target not ready"
                );
                ctx.session().update(job);
            }
        }
        Ok(())
    }
}

/// Record a failed attempt: decrement the retry budget, release the lock,
/// and either reschedule with exponential backoff or mark the job
/// permanently failed.
pub struct JobFailureCommand {
    pub job_id: Uuid,
    pub message: String,
}

impl<S: StorageBackend> Command<S> for JobFailureCommand {
    type Output = ();

    fn name(&self) -> &'static str {
        "job-failure"
    }

    async fn run(&self, ctx: &mut CommandContext<S>) -> Result<(), EngineError> {
        let Some(mut job) = ctx.session().find_job(self.job_id).await? else {
            return Ok(());
        };
        let config = &ctx.config().job_executor;

        job.retries = job.retries.saturating_sub(1);
        job.failures = job.failures.saturating_add(1);
        job.lock_owner = None;
        job.lock_expiry = None;

        if job.retries == 0 {
            job.failure_reason = Some(self.message.clone());
            tracing::warn!(
                job_id = %job.id,
                kind = %job.kind,
                error = self.message.as_str(),
                "job permanently failed, retries exhausted"
            );
        } else {
            job.due_date = retry_due_date(config, job.failures, Utc::now());
            tracing::warn!(
                job_id = %job.id,
                kind = %job.kind,
                retries_left = job.retries,
                next_due = %job.due_date,
                error = self.message.as_str(),
                "job failed, rescheduled"
            );
        }
        ctx.session().update(job);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JobExecutor
// ---------------------------------------------------------------------------

/// Background acquisition loop plus bounded worker pool for one tenant.
pub struct JobExecutor<S: StorageBackend> {
    pipeline: Arc<CommandPipeline<S>>,
    tenant_id: Option<String>,
    /// Node identity written into claim leases.
    owner: String,
    workers: Arc<Semaphore>,
    cancel: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S: StorageBackend> JobExecutor<S> {
    pub fn new(pipeline: Arc<CommandPipeline<S>>, tenant_id: Option<String>) -> Self {
        let pool_size = pipeline.services().config.job_executor.worker_pool_size;
        Self {
            pipeline,
            tenant_id,
            owner: format!("windlass-{}", Uuid::now_v7()),
            workers: Arc::new(Semaphore::new(pool_size)),
            cancel: CancellationToken::new(),
            loop_handle: Mutex::new(None),
        }
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    /// Spawn the acquisition loop. Idempotent: a second call is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut slot = self.loop_handle.lock().await;
        if slot.is_some() {
            return;
        }
        tracing::info!(
            owner = self.owner.as_str(),
            tenant_id = self.tenant_id.as_deref().unwrap_or("<default>"),
            "job executor starting"
        );
        let this = Arc::clone(self);
        *slot = Some(tokio::spawn(this.run()));
    }

    async fn run(self: Arc<Self>) {
        let poll = std::time::Duration::from_secs(
            self.pipeline.services().config.job_executor.poll_interval_secs,
        );
        let wakeup = Arc::clone(&self.pipeline.services().job_wakeup);
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if let Err(e) = self.acquire_cycle().await {
                tracing::error!(error = %e, "job acquisition cycle failed");
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = wakeup.notified() => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
        tracing::debug!(owner = self.owner.as_str(), "acquisition loop stopped");
    }

    /// One poll: fetch due jobs and dispatch each to a worker slot.
    async fn acquire_cycle(self: &Arc<Self>) -> Result<(), EngineError> {
        let batch_size = self.pipeline.services().config.job_executor.batch_size;
        let candidates = self
            .pipeline
            .backend()
            .select_matching(&Selector::AcquirableJobs {
                tenant_id: self.tenant_id.clone(),
                now: Utc::now(),
                limit: batch_size,
            })
            .await
            .map_err(EngineError::from)?;

        for candidate in candidates {
            let StoredEntity::Job(job) = candidate else {
                continue;
            };
            let Ok(permit) = Arc::clone(&self.workers).acquire_owned().await else {
                break;
            };
            if self.cancel.is_cancelled() {
                break;
            }
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.process(job).await;
                drop(permit);
            });
        }
        Ok(())
    }

    /// Claim and run one job on a worker.
    async fn process(&self, job: JobEntity) {
        let claim = ClaimJobCommand {
            job_id: job.id,
            owner: self.owner.clone(),
            tenant_id: self.tenant_id.clone(),
        };
        match self.pipeline.execute(&claim).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) if e.is_retryable() => {
                tracing::debug!(job_id = %job.id, "lost claim race");
                return;
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "claim failed");
                return;
            }
        }

        let execute = ExecuteJobCommand {
            job_id: job.id,
            owner: self.owner.clone(),
        };
        if let Err(e) = self.pipeline.execute(&execute).await {
            tracing::warn!(job_id = %job.id, kind = %job.kind, error = %e, "job execution failed");
            let failure = JobFailureCommand {
                job_id: job.id,
                message: e.to_string(),
            };
            if let Err(e) = self.pipeline.execute(&failure).await {
                tracing::error!(job_id = %job.id, error = %e, "failure bookkeeping failed");
            }
        }
    }

    /// Stop acquiring and wait for in-flight workers, up to the configured
    /// grace period. Claims held past the grace period expire with their
    /// leases and become acquirable again.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.loop_handle.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "acquisition loop panicked");
            }
        }

        let config = &self.pipeline.services().config.job_executor;
        let grace = std::time::Duration::from_secs(config.shutdown_grace_secs);
        let pool_size = config.worker_pool_size as u32;
        match tokio::time::timeout(grace, self.workers.acquire_many(pool_size)).await {
            Ok(Ok(_permits)) => {
                tracing::info!(owner = self.owner.as_str(), "job executor drained");
            }
            Ok(Err(_)) | Err(_) => {
                tracing::warn!(
                    owner = self.owner.as_str(),
                    "shutdown grace elapsed with workers still running"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
