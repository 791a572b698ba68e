//! Bounded parallel worker pool over the claim queue.
//!
//! A fixed number of slots each loop claim -> heartbeat -> execute ->
//! ack until the queue drains (no Pending and no Running rows) or the
//! cancellation token fires. Job failures are contained at the slot
//! boundary; only manifest trouble aborts the run.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::database::models::{JobItem, JobStatus};
use crate::database::repositories::ManifestRepository;
use crate::pipeline::JobPipeline;
use crate::Result;

/// Worker pool tuning.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    /// Idle slots re-check the queue at this cadence.
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Stop after this many jobs across all slots, if set.
    pub max_jobs: Option<u64>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(60),
            max_jobs: None,
        }
    }
}

/// Outcome tally of one drain run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub processed: u64,
    /// Acked Succeeded with at least one clip.
    pub succeeded: u64,
    /// Acked Succeeded with no clips (nothing worth clipping).
    pub skipped: u64,
    /// Attempts re-queued for another try.
    pub retried: u64,
    /// Terminally Failed.
    pub failed: u64,
}

/// Keeps a claim's liveness stamp fresh for as long as it is held.
///
/// Aborts its task on drop, so a panicking or returning slot can never
/// leave a heartbeat running for a job it no longer owns.
pub struct HeartbeatGuard {
    handle: tokio::task::JoinHandle<()>,
}

impl HeartbeatGuard {
    pub fn spawn(
        manifest: Arc<dyn ManifestRepository>,
        job_id: String,
        interval: Duration,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The claim itself stamped the first heartbeat.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = manifest.heartbeat(&job_id).await {
                    warn!(job_id = %job_id, error = %e, "heartbeat write failed");
                }
            }
        });
        Self { handle }
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Drains the claim queue with a bounded set of worker slots.
pub struct WorkerPool {
    manifest: Arc<dyn ManifestRepository>,
    pipeline: Arc<dyn JobPipeline>,
    config: WorkerPoolConfig,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        manifest: Arc<dyn ManifestRepository>,
        pipeline: Arc<dyn JobPipeline>,
        config: WorkerPoolConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            manifest,
            pipeline,
            config,
            cancel,
        }
    }

    /// Run slots until the queue drains, the job budget is spent, or
    /// cancellation fires. Manifest errors abort the run loudly.
    pub async fn run(&self) -> Result<RunStats> {
        let stats = Arc::new(Mutex::new(RunStats::default()));
        let processed = Arc::new(AtomicU64::new(0));
        let wake = Arc::new(Notify::new());
        let mut slots = JoinSet::new();

        for slot in 0..self.config.workers.max(1) {
            let owner = format!("worker-{}-{}", std::process::id(), slot);
            let ctx = SlotContext {
                owner,
                manifest: self.manifest.clone(),
                pipeline: self.pipeline.clone(),
                config: self.config.clone(),
                cancel: self.cancel.clone(),
                stats: stats.clone(),
                processed: processed.clone(),
                wake: wake.clone(),
            };
            slots.spawn(async move { ctx.run().await });
        }

        let mut first_error = None;
        while let Some(joined) = slots.join_next().await {
            let outcome = match joined {
                Ok(result) => result,
                Err(e) => {
                    // A panicking slot abandons only its own claim; the
                    // stale reset will reclaim the row later.
                    error!(error = %e, "worker slot aborted");
                    continue;
                }
            };
            if let Err(e) = outcome {
                error!(error = %e, "worker slot hit a manifest error, stopping the run");
                if first_error.is_none() {
                    first_error = Some(e);
                }
                self.cancel.cancel();
            }
        }

        let stats = *stats.lock();
        match first_error {
            Some(e) => Err(e),
            None => {
                info!(
                    processed = stats.processed,
                    succeeded = stats.succeeded,
                    skipped = stats.skipped,
                    retried = stats.retried,
                    failed = stats.failed,
                    "worker pool drained"
                );
                Ok(stats)
            }
        }
    }
}

struct SlotContext {
    owner: String,
    manifest: Arc<dyn ManifestRepository>,
    pipeline: Arc<dyn JobPipeline>,
    config: WorkerPoolConfig,
    cancel: CancellationToken,
    stats: Arc<Mutex<RunStats>>,
    processed: Arc<AtomicU64>,
    /// Pinged when a failed attempt lands back in Pending.
    wake: Arc<Notify>,
}

impl SlotContext {
    async fn run(&self) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                debug!(owner = %self.owner, "slot stopping on cancellation");
                return Ok(());
            }
            if !self.reserve_budget() {
                debug!(owner = %self.owner, "job budget spent, slot stopping");
                return Ok(());
            }

            match self.manifest.claim(&self.owner).await? {
                Some(job) => self.process(job).await?,
                None => {
                    self.release_budget();
                    let counts = self.manifest.counts().await?;
                    if counts.outstanding() == 0 {
                        debug!(owner = %self.owner, "queue drained, slot stopping");
                        return Ok(());
                    }
                    // Other slots still hold claims that may re-queue.
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }
    }

    async fn process(&self, job: JobItem) -> Result<()> {
        info!(
            owner = %self.owner,
            job_id = %job.id,
            artifact = %job.artifact_path,
            attempt = job.attempt_count,
            of = job.max_attempts,
            "claimed job"
        );

        let _heartbeat = HeartbeatGuard::spawn(
            self.manifest.clone(),
            job.id.clone(),
            self.config.heartbeat_interval,
        );

        let result = self.pipeline.execute(&job).await;
        drop(_heartbeat);

        match result {
            Ok(outputs) => match self.manifest.ack_success(&job.id, &outputs).await {
                Ok(()) => {
                    let mut stats = self.stats.lock();
                    stats.processed += 1;
                    if outputs.is_empty() {
                        stats.skipped += 1;
                    } else {
                        stats.succeeded += 1;
                    }
                    drop(stats);
                    info!(job_id = %job.id, clips = outputs.len(), "job succeeded");
                    Ok(())
                }
                // The pipeline reported success but the outputs do not
                // hold up; fail the attempt instead.
                Err(e @ (crate::Error::TransientExecution(_) | crate::Error::PermanentInput(_))) => {
                    warn!(job_id = %job.id, error = %e, "success ack rejected");
                    self.ack_failed(&job, e).await
                }
                Err(e) => Err(e),
            },
            Err(e) => self.ack_failed(&job, e).await,
        }
    }

    async fn ack_failed(&self, job: &JobItem, error: crate::Error) -> Result<()> {
        let retryable = error.is_retryable();
        let landed = self
            .manifest
            .ack_failure(&job.id, &error.to_string(), retryable)
            .await?;

        let mut stats = self.stats.lock();
        stats.processed += 1;
        match landed {
            JobStatus::Pending => stats.retried += 1,
            _ => stats.failed += 1,
        }
        drop(stats);

        match landed {
            JobStatus::Pending => {
                self.wake.notify_waiters();
                warn!(
                    job_id = %job.id,
                    error = %error,
                    "job attempt failed, re-queued"
                )
            }
            _ => error!(
                job_id = %job.id,
                error = %error,
                "job failed terminally"
            ),
        }
        Ok(())
    }

    /// Take one unit of the shared job budget, if any remains.
    fn reserve_budget(&self) -> bool {
        let Some(max) = self.config.max_jobs else {
            return true;
        };
        let mut current = self.processed.load(Ordering::Relaxed);
        loop {
            if current >= max {
                return false;
            }
            match self.processed.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn release_budget(&self) {
        if self.config.max_jobs.is_some() {
            self.processed.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
