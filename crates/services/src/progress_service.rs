use std::sync::Arc;

use chrono::{DateTime, Utc};

use campus_core::Clock;
use campus_core::model::{LessonId, ProgressPatch, ProgressRecord, StudentId};
use storage::repository::ProgressRepository;

use crate::error::ProgressServiceError;
use crate::retry::RetryPolicy;

//
// ─── SERVICE ───────────────────────────────────────────────────────────────────
//

/// Durable accessor for lesson watch state.
///
/// Single source of truth for the `(lesson, student)` upsert and the only
/// layer that retries: conflict-class failures get exponential backoff with
/// jitter, everything else propagates on the first attempt.
#[derive(Clone)]
pub struct ProgressService {
    clock: Clock,
    policy: RetryPolicy,
    progress: Arc<dyn ProgressRepository>,
}

impl ProgressService {
    /// Create a service with the default retry policy and real-time clock.
    #[must_use]
    pub fn new(progress: Arc<dyn ProgressRepository>) -> Self {
        Self {
            clock: Clock::default(),
            policy: RetryPolicy::default(),
            progress,
        }
    }

    /// Override the clock (usually for deterministic testing).
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Override the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Current time according to the service's clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Upsert the record for `(lesson, student)`, retrying conflicts.
    ///
    /// Returns the post-upsert record. Monotonic semantics (completion never
    /// reverts, watch time never regresses, `completed_at` set once) are
    /// enforced by the repository's merge.
    ///
    /// # Errors
    ///
    /// - `MissingLessonId` / `MissingStudentId` for nil identifiers; these
    ///   are precondition failures and are never retried.
    /// - The last `StorageError` once conflict retries are exhausted.
    /// - Any non-conflict `StorageError` immediately.
    pub async fn update_progress(
        &self,
        student: StudentId,
        lesson: LessonId,
        patch: ProgressPatch,
    ) -> Result<ProgressRecord, ProgressServiceError> {
        if lesson.is_nil() {
            return Err(ProgressServiceError::MissingLessonId);
        }
        if student.is_nil() {
            return Err(ProgressServiceError::MissingStudentId);
        }

        let now = self.clock.now();
        let record = self
            .policy
            .run(|| {
                let repo = Arc::clone(&self.progress);
                async move { repo.upsert_progress(lesson, student, &patch, now).await }
            })
            .await?;
        Ok(record)
    }

    /// Fetch the record for a pair, if any.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the lookup.
    pub async fn progress_for(
        &self,
        student: StudentId,
        lesson: LessonId,
    ) -> Result<Option<ProgressRecord>, ProgressServiceError> {
        Ok(self.progress.get_progress(lesson, student).await?)
    }

    /// Completed lessons for a student, most recently watched first.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the query.
    pub async fn completed_lessons(
        &self,
        student: StudentId,
    ) -> Result<Vec<ProgressRecord>, ProgressServiceError> {
        Ok(self.progress.completed_for_student(student).await?)
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//
