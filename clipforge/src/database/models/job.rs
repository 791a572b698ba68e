//! Manifest database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::fingerprint::ArtifactFingerprint;

/// Job status values.
///
/// The set is closed; unknown strings in the database are a corruption
/// bug, not a soft fallback.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    sqlx::Type,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Queued and waiting for a worker.
    Pending,
    /// Claimed by a worker; `owner` and heartbeats are live.
    Running,
    /// Finished; outputs verified and hashed.
    Succeeded,
    /// Attempts exhausted or a permanent input error.
    Failed,
    /// A previously succeeded artifact whose content or configuration
    /// changed; requeued for reprocessing.
    Dirty,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Dirty => "DIRTY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            "DIRTY" => Some(Self::Dirty),
            _ => None,
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether moving to `next` is a legal edge of the state machine.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                // Failed attempt with budget left, or stale-claim reset.
                | (Running, Pending)
                | (Succeeded, Dirty)
                | (Dirty, Pending)
                // Manual retry.
                | (Failed, Pending)
        )
    }
}

/// One row of the job manifest: a tracked input artifact.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobItem {
    pub id: String,
    /// Absolute path of the input artifact.
    pub artifact_path: String,
    /// Sampled-window fingerprint (cheap tier).
    pub quick_fingerprint: String,
    /// Full-content fingerprint (authoritative tier).
    pub strong_fingerprint: String,
    pub artifact_size: i64,
    /// Fingerprint of the canonical configuration payload the outputs
    /// were (or will be) rendered with.
    pub config_fingerprint: String,
    pub status: JobStatus,
    pub priority: i64,
    /// Bumped every time the row is re-queued as dirty.
    pub generation: i64,
    pub attempt_count: i64,
    pub max_attempts: i64,
    /// Worker that currently holds (or last held) the claim.
    pub owner: Option<String>,
    /// RFC 3339 timestamps.
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub last_heartbeat: Option<String>,
    pub last_error: Option<String>,
    /// JSON array of rendered clip paths.
    pub output_paths: Option<String>,
    /// JSON object mapping clip path to content hash.
    pub output_hashes: Option<String>,
}

impl JobItem {
    pub fn new(
        artifact_path: impl Into<String>,
        fingerprint: &ArtifactFingerprint,
        config_fingerprint: impl Into<String>,
        max_attempts: u32,
    ) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            artifact_path: artifact_path.into(),
            quick_fingerprint: fingerprint.quick.clone(),
            strong_fingerprint: fingerprint.strong.clone(),
            artifact_size: fingerprint.size as i64,
            config_fingerprint: config_fingerprint.into(),
            status: JobStatus::Pending,
            priority: 0,
            generation: 0,
            attempt_count: 0,
            max_attempts: max_attempts as i64,
            owner: None,
            created_at: now.clone(),
            updated_at: now,
            started_at: None,
            completed_at: None,
            last_heartbeat: None,
            last_error: None,
            output_paths: None,
            output_hashes: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// The stored fingerprint tiers as one value.
    pub fn stored_fingerprint(&self) -> ArtifactFingerprint {
        ArtifactFingerprint {
            quick: self.quick_fingerprint.clone(),
            strong: self.strong_fingerprint.clone(),
            size: self.artifact_size.max(0) as u64,
        }
    }

    /// Decode the JSON output path list, tolerating its absence.
    pub fn output_path_list(&self) -> Vec<String> {
        self.output_paths
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }
}

/// Audit log row: one observed state machine edge.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StateTransition {
    pub id: i64,
    pub job_id: String,
    /// None for the initial insert.
    pub from_status: Option<String>,
    pub to_status: String,
    pub timestamp: String,
    pub owner: Option<String>,
    /// Truncated error excerpt for failure edges.
    pub error_excerpt: Option<String>,
}

/// Per-status row counts for the whole manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dirty: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.running + self.succeeded + self.failed + self.dirty
    }

    /// Rows a drain loop still has to wait on.
    pub fn outstanding(&self) -> u64 {
        self.pending + self.running
    }

    pub fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Running => self.running,
            JobStatus::Succeeded => self.succeeded,
            JobStatus::Failed => self.failed,
            JobStatus::Dirty => self.dirty,
        }
    }

    pub fn set(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending = count,
            JobStatus::Running => self.running = count,
            JobStatus::Succeeded => self.succeeded = count,
            JobStatus::Failed => self.failed = count,
            JobStatus::Dirty => self.dirty = count,
        }
    }
}
