//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Which of the two encoder watchdogs fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Wall-clock ceiling for the whole invocation.
    Global,
    /// No progress telemetry for too long.
    Stall,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutKind::Global => write!(f, "global"),
            TimeoutKind::Stall => write!(f, "stall"),
        }
    }
}

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    /// The input itself is unusable; retrying cannot help.
    #[error("Permanent input error: {0}")]
    PermanentInput(String),

    /// The environment misbehaved; a later attempt may succeed.
    #[error("Transient execution error: {0}")]
    TransientExecution(String),

    #[error("Encoder timeout ({kind}): {detail}")]
    Timeout { kind: TimeoutKind, detail: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::PermanentInput(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientExecution(msg.into())
    }

    pub fn timeout(kind: TimeoutKind, detail: impl Into<String>) -> Self {
        Self::Timeout {
            kind,
            detail: detail.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether a failed job attempt carrying this error should be
    /// re-queued (up to its attempt budget) rather than parked as
    /// terminally failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::PermanentInput(_)
            | Error::Configuration(_)
            | Error::InvalidStateTransition { .. }
            | Error::NotFound { .. }
            | Error::Serialization(_) => false,
            Error::TransientExecution(_) | Error::Timeout { .. } | Error::Io(_) => true,
            // Manifest trouble is handled above the job boundary; if it
            // does surface here, err on the side of retrying.
            Error::DatabaseSqlx(_) | Error::Migration(_) | Error::Other(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_taxonomy() {
        assert!(!Error::permanent("bad container").is_retryable());
        assert!(!Error::config("bad preset").is_retryable());
        assert!(Error::transient("disk hiccup").is_retryable());
        assert!(Error::timeout(TimeoutKind::Stall, "no frames for 120s").is_retryable());
    }

    #[test]
    fn timeout_display_names_the_watchdog() {
        let err = Error::timeout(TimeoutKind::Global, "exceeded 1800s");
        assert!(err.to_string().contains("global"));
    }
}
