use async_trait::async_trait;
use campus_core::model::{
    LessonId, PointsHistoryEntry, ProgressPatch, ProgressRecord, StudentId,
    StudentPointsAggregate,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    /// Unique-violation or write-contention failure; the only retryable class.
    #[error("conflict")]
    Conflict,

    /// The logical event was already recorded under its idempotency key.
    /// Nothing was written; retrying cannot succeed.
    #[error("already recorded")]
    AlreadyExists,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// True for failures caused by concurrent writers racing on a key.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict)
    }
}

/// Repository contract for lesson watch state.
#[async_trait]
pub trait ProgressRepository: Send + Sync {
    /// Insert-or-update the record keyed on `(lesson_id, student_id)` and
    /// return the post-upsert row.
    ///
    /// The merge is monotonic: `completed` never reverts, `watch_time_seconds`
    /// never regresses, `completed_at` is kept from the first completion, and
    /// `last_watched_at` is refreshed on every write.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Conflict` for unique-violation/contention
    /// failures, or other storage errors.
    async fn upsert_progress(
        &self,
        lesson_id: LessonId,
        student_id: StudentId,
        patch: &ProgressPatch,
        now: DateTime<Utc>,
    ) -> Result<ProgressRecord, StorageError>;

    /// Fetch the record for a pair, if any.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the lookup fails.
    async fn get_progress(
        &self,
        lesson_id: LessonId,
        student_id: StudentId,
    ) -> Result<Option<ProgressRecord>, StorageError>;

    /// Completed lessons for a student, most recently watched first.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the query fails.
    async fn completed_for_student(
        &self,
        student_id: StudentId,
    ) -> Result<Vec<ProgressRecord>, StorageError>;
}

/// Repository contract for the gamification aggregate and its audit history.
#[async_trait]
pub trait PointsRepository: Send + Sync {
    /// Fetch the aggregate for a student, if one exists yet.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the lookup fails.
    async fn get_aggregate(
        &self,
        student_id: StudentId,
    ) -> Result<Option<StudentPointsAggregate>, StorageError>;

    /// Persist an award: append the history entry and upsert the aggregate as
    /// one atomic write. Returns the new history row id.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::AlreadyExists` when the entry's
    /// `(student_id, action_type, reference_id)` idempotency key was already
    /// recorded; the aggregate is left untouched in that case. Entries without
    /// a reference id are never deduplicated. Contention on the transaction
    /// itself surfaces as `StorageError::Conflict`.
    async fn record_award(
        &self,
        aggregate: &StudentPointsAggregate,
        entry: &PointsHistoryEntry,
    ) -> Result<i64, StorageError>;

    /// History entries for a student, newest first.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the query fails.
    async fn history_for_student(
        &self,
        student_id: StudentId,
    ) -> Result<Vec<PointsHistoryEntry>, StorageError>;
}

/// Simple in-memory repository implementation for testing and prototyping.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    progress: Arc<Mutex<HashMap<(LessonId, StudentId), ProgressRecord>>>,
    aggregates: Arc<Mutex<HashMap<StudentId, StudentPointsAggregate>>>,
    history: Arc<Mutex<Vec<PointsHistoryEntry>>>,
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressRepository for InMemoryRepository {
    async fn upsert_progress(
        &self,
        lesson_id: LessonId,
        student_id: StudentId,
        patch: &ProgressPatch,
        now: DateTime<Utc>,
    ) -> Result<ProgressRecord, StorageError> {
        let mut guard = self
            .progress
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        let record = guard
            .entry((lesson_id, student_id))
            .or_insert_with(|| ProgressRecord::new(lesson_id, student_id, now));
        record.apply(patch, now);
        Ok(record.clone())
    }

    async fn get_progress(
        &self,
        lesson_id: LessonId,
        student_id: StudentId,
    ) -> Result<Option<ProgressRecord>, StorageError> {
        let guard = self
            .progress
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(guard.get(&(lesson_id, student_id)).cloned())
    }

    async fn completed_for_student(
        &self,
        student_id: StudentId,
    ) -> Result<Vec<ProgressRecord>, StorageError> {
        let guard = self
            .progress
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        let mut records: Vec<ProgressRecord> = guard
            .values()
            .filter(|r| r.student_id() == student_id && r.completed())
            .cloned()
            .collect();
        records.sort_by_key(|r| std::cmp::Reverse(r.last_watched_at()));
        Ok(records)
    }
}

#[async_trait]
impl PointsRepository for InMemoryRepository {
    async fn get_aggregate(
        &self,
        student_id: StudentId,
    ) -> Result<Option<StudentPointsAggregate>, StorageError> {
        let guard = self
            .aggregates
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(guard.get(&student_id).cloned())
    }

    async fn record_award(
        &self,
        aggregate: &StudentPointsAggregate,
        entry: &PointsHistoryEntry,
    ) -> Result<i64, StorageError> {
        let mut history = self
            .history
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        // Idempotency key check mirrors the SQL partial unique index.
        if let Some(reference) = entry.reference_id.as_deref() {
            let duplicate = history.iter().any(|h| {
                h.student_id == entry.student_id
                    && h.action_type == entry.action_type
                    && h.reference_id.as_deref() == Some(reference)
            });
            if duplicate {
                return Err(StorageError::AlreadyExists);
            }
        }

        let mut aggregates = self
            .aggregates
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let id = i64::try_from(history.len() + 1)
            .map_err(|_| StorageError::Serialization("history id overflow".into()))?;
        let mut stored = entry.clone();
        stored.id = Some(id);
        history.push(stored);
        aggregates.insert(aggregate.student_id(), aggregate.clone());
        Ok(id)
    }

    async fn history_for_student(
        &self,
        student_id: StudentId,
    ) -> Result<Vec<PointsHistoryEntry>, StorageError> {
        let guard = self
            .history
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        let mut entries: Vec<PointsHistoryEntry> = guard
            .iter()
            .filter(|h| h.student_id == student_id)
            .cloned()
            .collect();
        entries.sort_by_key(|h| std::cmp::Reverse((h.earned_at, h.id)));
        Ok(entries)
    }
}

/// Aggregates the pipeline's repositories behind trait objects for easy
/// backend swapping.
#[derive(Clone)]
pub struct Storage {
    pub progress: Arc<dyn ProgressRepository>,
    pub points: Arc<dyn PointsRepository>,
}

impl Storage {
    #[must_use]
    pub fn in_memory() -> Self {
        let repo = InMemoryRepository::new();
        let progress: Arc<dyn ProgressRepository> = Arc::new(repo.clone());
        let points: Arc<dyn PointsRepository> = Arc::new(repo);
        Self { progress, points }
    }
}
