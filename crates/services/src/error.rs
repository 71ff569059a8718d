//! Shared error types for the services crate.

use thiserror::Error;

use campus_core::model::PointsError;
use storage::repository::StorageError;

/// Errors emitted by `ProgressService`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProgressServiceError {
    #[error("lesson id must not be nil")]
    MissingLessonId,
    #[error("student id must not be nil")]
    MissingStudentId,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ProgressServiceError {
    /// True when conflict retries inside the service were exhausted.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_conflict())
    }

    /// True when the backend refused the write for this user.
    #[must_use]
    pub fn is_permission(&self) -> bool {
        matches!(self, Self::Storage(StorageError::PermissionDenied(_)))
    }
}

/// Errors emitted by `PointsLedger`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    #[error(transparent)]
    Points(#[from] PointsError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted by `WatchTracker`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TrackerError {
    #[error("user not authenticated")]
    NotAuthenticated,
    #[error(transparent)]
    Progress(#[from] ProgressServiceError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
