//! Job manifest repository.
//!
//! All mutations run on the serialized write pool inside `BEGIN IMMEDIATE`
//! transactions, and every state machine edge writes its audit row in the
//! same transaction as the row update it describes.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqliteConnection;
use tracing::{debug, warn};

use crate::database::models::{JobItem, JobStatus, StateTransition, StatusCounts};
use crate::database::time::{cutoff_rfc3339, now_rfc3339};
use crate::database::{DbPool, WritePool, begin_immediate};
use crate::fingerprint;
use crate::{Error, Result};

/// Max stored length of `last_error` on the job row.
const LAST_ERROR_MAX_CHARS: usize = 500;

/// Max stored length of a transition's error excerpt.
const TRANSITION_ERROR_MAX_CHARS: usize = 200;

/// Claim retries when SQLite reports the database busy despite the
/// serialized writer (e.g. an external process holding the file).
const CLAIM_BUSY_RETRIES: u32 = 3;

/// Repository for the job manifest.
#[async_trait]
pub trait ManifestRepository: Send + Sync {
    /// Look up a row by artifact path.
    async fn get(&self, artifact_path: &str) -> Result<Option<JobItem>>;

    /// Look up a row by id, erroring when absent.
    async fn get_by_id(&self, job_id: &str) -> Result<JobItem>;

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<JobItem>>;

    async fn counts(&self) -> Result<StatusCounts>;

    /// Insert the row, or re-queue the existing row for the same
    /// artifact path as Pending with the new fingerprints.
    ///
    /// Rows that are `Running` (live owner) or `Succeeded` (requires an
    /// explicit [`mark_dirty`](Self::mark_dirty) first) are returned
    /// unchanged. A `Pending` row only has its fingerprints refreshed,
    /// with no state transition. A `Dirty` row gets its generation
    /// bumped on the way back to Pending.
    async fn upsert(&self, job: &JobItem) -> Result<JobItem>;

    /// Succeeded -> Dirty: the artifact or its configuration changed.
    async fn mark_dirty(&self, job_id: &str) -> Result<()>;

    /// Atomically claim the best Pending row for `owner`.
    ///
    /// Selection order is priority descending, then FIFO. The claim
    /// stamps `started_at` and the first heartbeat in the same write;
    /// `attempt_count` is only spent by [`ack_failure`](Self::ack_failure).
    async fn claim(&self, owner: &str) -> Result<Option<JobItem>>;

    /// Refresh the claim's liveness stamp. A no-op (logged, not an
    /// error) when the row is no longer Running.
    async fn heartbeat(&self, job_id: &str) -> Result<()>;

    /// Running -> Succeeded, after verifying each declared output exists
    /// and is non-empty, and recording output content hashes.
    async fn ack_success(&self, job_id: &str, output_paths: &[String]) -> Result<()>;

    /// Running -> Pending (budget left, retryable) or Running -> Failed.
    /// Returns the status the row landed on.
    async fn ack_failure(&self, job_id: &str, error: &str, retryable: bool) -> Result<JobStatus>;

    /// Re-queue Running rows whose liveness stamp is older than
    /// `timeout`. Returns the number of rows reset.
    async fn reset_stale(&self, timeout: Duration) -> Result<u64>;

    /// Re-queue all Failed rows with a fresh attempt budget.
    async fn retry_failed(&self) -> Result<u64>;

    /// Delete non-Running rows; with `with_history`, also drop audit
    /// rows that no longer have a job. Returns deleted job rows.
    async fn clear(&self, with_history: bool) -> Result<u64>;

    /// Audit trail for one job, oldest first.
    async fn transitions_for(&self, job_id: &str) -> Result<Vec<StateTransition>>;
}

/// sqlx-backed implementation over a read pool and the serialized write pool.
pub struct SqlxManifestRepository {
    read: DbPool,
    write: WritePool,
}

impl SqlxManifestRepository {
    pub fn new(read: DbPool, write: WritePool) -> Self {
        Self { read, write }
    }

    async fn fetch_for_update(conn: &mut SqliteConnection, job_id: &str) -> Result<JobItem> {
        sqlx::query_as::<_, JobItem>("SELECT * FROM job_items WHERE id = ?1")
            .bind(job_id)
            .fetch_optional(conn)
            .await?
            .ok_or_else(|| Error::not_found("job", job_id))
    }

    fn require_edge(job: &JobItem, to: JobStatus) -> Result<()> {
        if job.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(Error::InvalidStateTransition {
                from: job.status.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some("5")
                || db.message().contains("database is locked")
                || db.message().contains("database table is locked")
        }
        _ => false,
    }
}

async fn insert_transition(
    conn: &mut SqliteConnection,
    job_id: &str,
    from: Option<JobStatus>,
    to: JobStatus,
    owner: Option<&str>,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO state_transitions (job_id, from_status, to_status, timestamp, owner, error_excerpt)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(job_id)
    .bind(from.map(|s| s.as_str()))
    .bind(to.as_str())
    .bind(now_rfc3339())
    .bind(owner)
    .bind(error.map(|e| truncate_chars(e, TRANSITION_ERROR_MAX_CHARS)))
    .execute(conn)
    .await?;
    Ok(())
}

#[async_trait]
impl ManifestRepository for SqlxManifestRepository {
    async fn get(&self, artifact_path: &str) -> Result<Option<JobItem>> {
        let job = sqlx::query_as::<_, JobItem>("SELECT * FROM job_items WHERE artifact_path = ?1")
            .bind(artifact_path)
            .fetch_optional(&self.read)
            .await?;
        Ok(job)
    }

    async fn get_by_id(&self, job_id: &str) -> Result<JobItem> {
        sqlx::query_as::<_, JobItem>("SELECT * FROM job_items WHERE id = ?1")
            .bind(job_id)
            .fetch_optional(&self.read)
            .await?
            .ok_or_else(|| Error::not_found("job", job_id))
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<JobItem>> {
        let jobs = sqlx::query_as::<_, JobItem>(
            "SELECT * FROM job_items WHERE status = ?1 ORDER BY priority DESC, created_at ASC",
        )
        .bind(status)
        .fetch_all(&self.read)
        .await?;
        Ok(jobs)
    }

    async fn counts(&self) -> Result<StatusCounts> {
        let rows: Vec<(JobStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM job_items GROUP BY status")
                .fetch_all(&self.read)
                .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            counts.set(status, count.max(0) as u64);
        }
        Ok(counts)
    }

    async fn upsert(&self, job: &JobItem) -> Result<JobItem> {
        let mut tx = begin_immediate(&self.write).await?;

        let existing =
            sqlx::query_as::<_, JobItem>("SELECT * FROM job_items WHERE artifact_path = ?1")
                .bind(&job.artifact_path)
                .fetch_optional(&mut *tx)
                .await?;

        let result = match existing {
            None => {
                sqlx::query(
                    "INSERT INTO job_items (
                        id, artifact_path, quick_fingerprint, strong_fingerprint,
                        artifact_size, config_fingerprint, status, priority, generation,
                        attempt_count, max_attempts, owner, created_at, updated_at,
                        started_at, completed_at, last_heartbeat, last_error,
                        output_paths, output_hashes
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                               ?15, ?16, ?17, ?18, ?19, ?20)",
                )
                .bind(&job.id)
                .bind(&job.artifact_path)
                .bind(&job.quick_fingerprint)
                .bind(&job.strong_fingerprint)
                .bind(job.artifact_size)
                .bind(&job.config_fingerprint)
                .bind(JobStatus::Pending)
                .bind(job.priority)
                .bind(job.generation)
                .bind(0i64)
                .bind(job.max_attempts)
                .bind(Option::<String>::None)
                .bind(&job.created_at)
                .bind(&job.updated_at)
                .bind(Option::<String>::None)
                .bind(Option::<String>::None)
                .bind(Option::<String>::None)
                .bind(Option::<String>::None)
                .bind(Option::<String>::None)
                .bind(Option::<String>::None)
                .execute(&mut *tx)
                .await?;

                insert_transition(&mut tx, &job.id, None, JobStatus::Pending, None, None).await?;
                Self::fetch_for_update(&mut tx, &job.id).await?
            }
            // Live owner; resolve never yanks a claim.
            Some(e) if e.status == JobStatus::Running => e,
            // Needs an explicit mark_dirty before it can be re-queued.
            Some(e) if e.status == JobStatus::Succeeded => e,
            // Already queued: refresh the material fields in place. The
            // status does not move, so no audit row is written.
            Some(e) if e.status == JobStatus::Pending => {
                sqlx::query(
                    "UPDATE job_items SET
                        quick_fingerprint = ?1, strong_fingerprint = ?2, artifact_size = ?3,
                        config_fingerprint = ?4, priority = ?5, max_attempts = ?6,
                        updated_at = ?7
                     WHERE id = ?8",
                )
                .bind(&job.quick_fingerprint)
                .bind(&job.strong_fingerprint)
                .bind(job.artifact_size)
                .bind(&job.config_fingerprint)
                .bind(job.priority)
                .bind(job.max_attempts)
                .bind(now_rfc3339())
                .bind(&e.id)
                .execute(&mut *tx)
                .await?;

                Self::fetch_for_update(&mut tx, &e.id).await?
            }
            Some(e) => {
                let generation = if e.status == JobStatus::Dirty {
                    e.generation + 1
                } else {
                    e.generation
                };
                let now = now_rfc3339();
                sqlx::query(
                    "UPDATE job_items SET
                        quick_fingerprint = ?1, strong_fingerprint = ?2, artifact_size = ?3,
                        config_fingerprint = ?4, status = ?5, priority = ?6, generation = ?7,
                        attempt_count = 0, max_attempts = ?8, owner = NULL, updated_at = ?9,
                        started_at = NULL, completed_at = NULL, last_heartbeat = NULL,
                        last_error = NULL
                     WHERE id = ?10",
                )
                .bind(&job.quick_fingerprint)
                .bind(&job.strong_fingerprint)
                .bind(job.artifact_size)
                .bind(&job.config_fingerprint)
                .bind(JobStatus::Pending)
                .bind(job.priority)
                .bind(generation)
                .bind(job.max_attempts)
                .bind(&now)
                .bind(&e.id)
                .execute(&mut *tx)
                .await?;

                insert_transition(&mut tx, &e.id, Some(e.status), JobStatus::Pending, None, None)
                    .await?;
                Self::fetch_for_update(&mut tx, &e.id).await?
            }
        };

        tx.commit().await?;
        Ok(result)
    }

    async fn mark_dirty(&self, job_id: &str) -> Result<()> {
        let mut tx = begin_immediate(&self.write).await?;

        let job = Self::fetch_for_update(&mut tx, job_id).await?;
        Self::require_edge(&job, JobStatus::Dirty)?;

        sqlx::query("UPDATE job_items SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(JobStatus::Dirty)
            .bind(now_rfc3339())
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        insert_transition(&mut tx, job_id, Some(job.status), JobStatus::Dirty, None, None).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn claim(&self, owner: &str) -> Result<Option<JobItem>> {
        let mut backoff = Duration::from_millis(100);
        let mut attempt = 0u32;

        loop {
            match self.claim_once(owner).await {
                Ok(job) => return Ok(job),
                Err(Error::DatabaseSqlx(e)) if is_busy(&e) && attempt < CLAIM_BUSY_RETRIES => {
                    attempt += 1;
                    warn!(attempt, "claim hit a busy database, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn heartbeat(&self, job_id: &str) -> Result<()> {
        let now = now_rfc3339();
        let result = sqlx::query(
            "UPDATE job_items SET last_heartbeat = ?1, updated_at = ?1
             WHERE id = ?2 AND status = ?3",
        )
        .bind(&now)
        .bind(job_id)
        .bind(JobStatus::Running)
        .execute(&self.write)
        .await?;

        if result.rows_affected() == 0 {
            // The claim was acked or reset underneath us; nothing to do.
            debug!(job_id, "heartbeat for a row that is no longer running");
        }
        Ok(())
    }

    async fn ack_success(&self, job_id: &str, output_paths: &[String]) -> Result<()> {
        // Verify and hash outputs before touching the manifest; a bad
        // output must leave the row Running so the caller can ack failure.
        let mut hashes = serde_json::Map::new();
        for path in output_paths {
            let meta = tokio::fs::metadata(path).await.map_err(|e| {
                Error::transient(format!("declared output {} is missing: {}", path, e))
            })?;
            if meta.len() == 0 {
                return Err(Error::transient(format!("declared output {} is empty", path)));
            }
            let owned = path.clone();
            let digest = tokio::task::spawn_blocking(move || {
                fingerprint::strong_fingerprint(Path::new(&owned))
            })
            .await
            .map_err(|e| Error::Other(format!("output hashing task failed: {}", e)))??;
            hashes.insert(path.clone(), serde_json::Value::String(digest));
        }

        let paths_json = serde_json::to_string(output_paths)?;
        let hashes_json = serde_json::Value::Object(hashes).to_string();

        let mut tx = begin_immediate(&self.write).await?;

        let job = Self::fetch_for_update(&mut tx, job_id).await?;
        Self::require_edge(&job, JobStatus::Succeeded)?;

        let now = now_rfc3339();
        sqlx::query(
            "UPDATE job_items SET
                status = ?1, owner = NULL, completed_at = ?2, updated_at = ?2,
                last_heartbeat = NULL, last_error = NULL,
                output_paths = ?3, output_hashes = ?4
             WHERE id = ?5",
        )
        .bind(JobStatus::Succeeded)
        .bind(&now)
        .bind(&paths_json)
        .bind(&hashes_json)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        insert_transition(
            &mut tx,
            job_id,
            Some(job.status),
            JobStatus::Succeeded,
            job.owner.as_deref(),
            None,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn ack_failure(&self, job_id: &str, error: &str, retryable: bool) -> Result<JobStatus> {
        let mut tx = begin_immediate(&self.write).await?;

        let job = Self::fetch_for_update(&mut tx, job_id).await?;
        // The attempt is spent here, not at claim time: a claim that
        // died without acking (crash, stale reset) must not burn budget.
        let attempts = job.attempt_count + 1;
        let exhausted = attempts >= job.max_attempts;
        let next = if retryable && !exhausted {
            JobStatus::Pending
        } else {
            JobStatus::Failed
        };
        Self::require_edge(&job, next)?;

        let now = now_rfc3339();
        let completed_at = (next == JobStatus::Failed).then(|| now.clone());
        sqlx::query(
            "UPDATE job_items SET
                status = ?1, attempt_count = ?2, owner = NULL, last_heartbeat = NULL,
                last_error = ?3, completed_at = ?4, updated_at = ?5
             WHERE id = ?6",
        )
        .bind(next)
        .bind(attempts)
        .bind(truncate_chars(error, LAST_ERROR_MAX_CHARS))
        .bind(completed_at)
        .bind(&now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        insert_transition(
            &mut tx,
            job_id,
            Some(job.status),
            next,
            job.owner.as_deref(),
            Some(error),
        )
        .await?;
        tx.commit().await?;
        Ok(next)
    }

    async fn reset_stale(&self, timeout: Duration) -> Result<u64> {
        let cutoff = cutoff_rfc3339(timeout);
        let now = now_rfc3339();

        let mut tx = begin_immediate(&self.write).await?;

        // A claim that never heartbeat falls back to its start stamp.
        // Owners are read before the update; RETURNING would only show
        // the post-update NULL.
        let reset: Vec<(String, Option<String>)> = sqlx::query_as(
            "SELECT id, owner FROM job_items
             WHERE status = ?1
               AND COALESCE(last_heartbeat, started_at, updated_at) < ?2",
        )
        .bind(JobStatus::Running)
        .bind(&cutoff)
        .fetch_all(&mut *tx)
        .await?;

        for (job_id, owner) in &reset {
            sqlx::query(
                "UPDATE job_items SET
                    status = ?1, owner = NULL, last_heartbeat = NULL,
                    last_error = ?2, updated_at = ?3
                 WHERE id = ?4",
            )
            .bind(JobStatus::Pending)
            .bind("claim reset: owner stopped heartbeating")
            .bind(&now)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

            insert_transition(
                &mut tx,
                job_id,
                Some(JobStatus::Running),
                JobStatus::Pending,
                owner.as_deref(),
                Some("stale claim reset"),
            )
            .await?;
        }

        tx.commit().await?;

        if !reset.is_empty() {
            warn!(count = reset.len(), "reset stale running claims to pending");
        }
        Ok(reset.len() as u64)
    }

    async fn retry_failed(&self) -> Result<u64> {
        let now = now_rfc3339();
        let mut tx = begin_immediate(&self.write).await?;

        let reset: Vec<(String,)> = sqlx::query_as(
            "UPDATE job_items SET
                status = ?1, attempt_count = 0, owner = NULL,
                last_heartbeat = NULL, completed_at = NULL, updated_at = ?2
             WHERE status = ?3
             RETURNING id",
        )
        .bind(JobStatus::Pending)
        .bind(&now)
        .bind(JobStatus::Failed)
        .fetch_all(&mut *tx)
        .await?;

        for (job_id,) in &reset {
            insert_transition(
                &mut tx,
                job_id,
                Some(JobStatus::Failed),
                JobStatus::Pending,
                None,
                Some("manual retry"),
            )
            .await?;
        }

        tx.commit().await?;
        Ok(reset.len() as u64)
    }

    async fn clear(&self, with_history: bool) -> Result<u64> {
        let mut tx = begin_immediate(&self.write).await?;

        let result = sqlx::query("DELETE FROM job_items WHERE status != ?1")
            .bind(JobStatus::Running)
            .execute(&mut *tx)
            .await?;

        if with_history {
            sqlx::query(
                "DELETE FROM state_transitions
                 WHERE job_id NOT IN (SELECT id FROM job_items)",
            )
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn transitions_for(&self, job_id: &str) -> Result<Vec<StateTransition>> {
        let transitions = sqlx::query_as::<_, StateTransition>(
            "SELECT * FROM state_transitions WHERE job_id = ?1 ORDER BY id ASC",
        )
        .bind(job_id)
        .fetch_all(&self.read)
        .await?;
        Ok(transitions)
    }
}

impl SqlxManifestRepository {
    async fn claim_once(&self, owner: &str) -> Result<Option<JobItem>> {
        let mut tx = begin_immediate(&self.write).await?;
        let now = now_rfc3339();

        // Single-statement claim: selecting the candidate and flipping it
        // to RUNNING happen under the same write lock.
        let claimed: Option<JobItem> = sqlx::query_as(
            "UPDATE job_items SET
                status = ?1, owner = ?2, started_at = ?3, last_heartbeat = ?3,
                updated_at = ?3
             WHERE id = (
                 SELECT id FROM job_items
                 WHERE status = ?4
                 ORDER BY priority DESC, created_at ASC
                 LIMIT 1
             )
             RETURNING *",
        )
        .bind(JobStatus::Running)
        .bind(owner)
        .bind(&now)
        .bind(JobStatus::Pending)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(job) = &claimed {
            insert_transition(
                &mut tx,
                &job.id,
                Some(JobStatus::Pending),
                JobStatus::Running,
                Some(owner),
                None,
            )
            .await?;
        }

        tx.commit().await?;
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "héllo wörld".repeat(100);
        let t = truncate_chars(&s, 10);
        assert_eq!(t.chars().count(), 10);
    }

    #[test]
    fn truncate_short_string_is_identity() {
        assert_eq!(truncate_chars("short", 500), "short");
    }
}
