use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecoveryError {
    /// Storage was busy, locked, or the blocking task carrying the query
    /// was cancelled. Safe to retry; callers surface it as a server failure.
    #[error("Transient storage error: {0}")]
    TransientStorage(String),

    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cannot classify delinquency (primary={primary:?}, fallback={fallback:?})")]
    DataQualityGap {
        primary:  Option<i64>,
        fallback: Option<i64>,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Reconciliation of {bucket} {unit} failed: {reason}")]
    ReconciliationUnit {
        bucket: String,
        unit:   String,
        reason: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RecoveryError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStorage(_))
    }
}

impl From<rusqlite::Error> for RecoveryError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(f, _)
                if matches!(f.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                Self::TransientStorage(e.to_string())
            }
            _ => Self::Database(e),
        }
    }
}

/// A cancelled storage task may be retried. A panicked one may not.
impl From<tokio::task::JoinError> for RecoveryError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_panic() {
            Self::Other(anyhow::anyhow!("storage task panicked: {e}"))
        } else {
            Self::TransientStorage(format!("storage task cancelled: {e}"))
        }
    }
}

pub type RecoveryResult<T> = Result<T, RecoveryError>;
