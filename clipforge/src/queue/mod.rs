//! Resolve-on-enqueue: deciding which discovered artifacts need work.
//!
//! For each candidate the coordinator compares the on-disk content and
//! the active configuration against the manifest and either skips the
//! artifact (cache hit), re-queues it as dirty, or enqueues it fresh.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::database::models::{JobItem, JobStatus};
use crate::database::repositories::ManifestRepository;
use crate::fingerprint::{self, FingerprintChange};
use crate::{Error, Result};

/// Knobs for one resolve pass.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Re-queue even on a cache hit.
    pub force: bool,
    pub max_attempts: u32,
    pub priority: i64,
    /// Staleness cutoff applied to orphaned Running rows before resolving.
    pub stale_timeout: Duration,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            force: false,
            max_attempts: 3,
            priority: 0,
            stale_timeout: Duration::from_secs(7200),
        }
    }
}

/// What one resolve pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolveStats {
    pub enqueued: u64,
    pub cache_hits: u64,
    pub dirty: u64,
    /// Artifacts that could not be fingerprinted.
    pub errors: u64,
    pub stale_reset: u64,
}

impl ResolveStats {
    pub fn total(&self) -> u64 {
        self.enqueued + self.cache_hits + self.dirty + self.errors
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResolveOutcome {
    Enqueued,
    CacheHit,
    DirtyRequeued,
}

/// Decides, per artifact, whether work is owed.
pub struct QueueCoordinator {
    manifest: Arc<dyn ManifestRepository>,
}

impl QueueCoordinator {
    pub fn new(manifest: Arc<dyn ManifestRepository>) -> Self {
        Self { manifest }
    }

    /// Resolve a batch of discovered artifacts against the manifest.
    ///
    /// Orphaned claims are reset first so a crashed run's rows rejoin
    /// the queue before resolution looks at them.
    pub async fn resolve_batch(
        &self,
        artifacts: &[PathBuf],
        config_fingerprint: &str,
        options: &ResolveOptions,
    ) -> Result<ResolveStats> {
        let mut stats = ResolveStats {
            stale_reset: self.manifest.reset_stale(options.stale_timeout).await?,
            ..Default::default()
        };

        for path in artifacts {
            match self.resolve_one(path, config_fingerprint, options).await {
                Ok(ResolveOutcome::Enqueued) => stats.enqueued += 1,
                Ok(ResolveOutcome::CacheHit) => stats.cache_hits += 1,
                Ok(ResolveOutcome::DirtyRequeued) => stats.dirty += 1,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to resolve artifact");
                    stats.errors += 1;
                }
            }
        }

        info!(
            enqueued = stats.enqueued,
            cache_hits = stats.cache_hits,
            dirty = stats.dirty,
            errors = stats.errors,
            stale_reset = stats.stale_reset,
            "resolve pass complete"
        );
        Ok(stats)
    }

    async fn resolve_one(
        &self,
        path: &Path,
        config_fingerprint: &str,
        options: &ResolveOptions,
    ) -> Result<ResolveOutcome> {
        let path_str = path.to_string_lossy().into_owned();
        let existing = self.manifest.get(&path_str).await?;

        match existing {
            None => {
                let template = self
                    .enqueue_template(path, &path_str, config_fingerprint, options)
                    .await?;
                self.manifest.upsert(&template).await?;
                debug!(path = %path.display(), "enqueued new artifact");
                Ok(ResolveOutcome::Enqueued)
            }
            // Live claim; reconciliation is reset_stale's job.
            Some(job) if job.status == JobStatus::Running => {
                debug!(path = %path.display(), owner = ?job.owner, "artifact has a live claim, leaving it");
                Ok(ResolveOutcome::CacheHit)
            }
            Some(job) if job.status == JobStatus::Succeeded => {
                // Lazy tiers: a quick-window match settles the cache hit,
                // and the full-content hash is only read on a mismatch.
                let stored = job.stored_fingerprint();
                let compare_path = path.to_path_buf();
                let content =
                    tokio::task::spawn_blocking(move || fingerprint::compare(&stored, &compare_path))
                        .await
                        .map_err(|e| Error::Other(format!("fingerprint task failed: {}", e)))??;

                let config_changed = job.config_fingerprint != config_fingerprint;
                let unchanged = matches!(
                    content,
                    FingerprintChange::Unchanged | FingerprintChange::MetadataOnlyChanged
                ) && !config_changed;

                if unchanged && !options.force {
                    debug!(path = %path.display(), "cache hit, skipping");
                    return Ok(ResolveOutcome::CacheHit);
                }

                debug!(
                    path = %path.display(),
                    ?content,
                    config_changed,
                    force = options.force,
                    "succeeded artifact is dirty, re-queueing"
                );
                let template = self
                    .enqueue_template(path, &path_str, config_fingerprint, options)
                    .await?;
                self.manifest.mark_dirty(&job.id).await?;
                self.manifest.upsert(&template).await?;
                Ok(ResolveOutcome::DirtyRequeued)
            }
            // Pending, Failed or Dirty: re-upsert with fresh fingerprints.
            Some(job) => {
                let template = self
                    .enqueue_template(path, &path_str, config_fingerprint, options)
                    .await?;
                self.manifest.upsert(&template).await?;
                debug!(path = %path.display(), from = %job.status, "re-queued artifact");
                Ok(ResolveOutcome::Enqueued)
            }
        }
    }

    /// Full two-tier fingerprints for a row that is about to be queued.
    async fn enqueue_template(
        &self,
        path: &Path,
        path_str: &str,
        config_fingerprint: &str,
        options: &ResolveOptions,
    ) -> Result<JobItem> {
        let owned = path.to_path_buf();
        let current = tokio::task::spawn_blocking(move || fingerprint::fingerprint_artifact(&owned))
            .await
            .map_err(|e| Error::Other(format!("fingerprint task failed: {}", e)))??;
        Ok(
            JobItem::new(path_str, &current, config_fingerprint, options.max_attempts)
                .with_priority(options.priority),
        )
    }
}
