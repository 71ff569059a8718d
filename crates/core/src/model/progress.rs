use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{LessonId, StudentId};

//
// ─── PROGRESS PATCH ────────────────────────────────────────────────────────────
//

/// Partial update carried by a single progress write.
///
/// Both fields are optional; an absent field leaves the stored value alone.
/// `completed` is only ever raised — carrying `Some(false)` is legal but can
/// never revert a stored completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressPatch {
    completed: Option<bool>,
    watch_time_seconds: Option<u32>,
}

impl ProgressPatch {
    /// A patch carrying only a watch-time reading.
    #[must_use]
    pub fn watch_time(seconds: u32) -> Self {
        Self {
            completed: None,
            watch_time_seconds: Some(seconds),
        }
    }

    /// A patch marking the lesson finished at the given position.
    #[must_use]
    pub fn completion(seconds: u32) -> Self {
        Self {
            completed: Some(true),
            watch_time_seconds: Some(seconds),
        }
    }

    #[must_use]
    pub fn with_completed(mut self, completed: bool) -> Self {
        self.completed = Some(completed);
        self
    }

    #[must_use]
    pub fn completed(&self) -> Option<bool> {
        self.completed
    }

    #[must_use]
    pub fn watch_time_seconds(&self) -> Option<u32> {
        self.watch_time_seconds
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.completed.is_none() && self.watch_time_seconds.is_none()
    }
}

//
// ─── PROGRESS RECORD ───────────────────────────────────────────────────────────
//

/// Durable watch state for one `(lesson, student)` pair.
///
/// The pair is the natural key; storage enforces it with a unique constraint.
/// Invariants held by `apply` and mirrored by the SQL upsert:
/// - `completed` is monotonic: once true it never reverts.
/// - `watch_time_seconds` never regresses.
/// - `completed_at` is set exactly once, on the false→true transition.
/// - `last_watched_at` is refreshed on every write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    lesson_id: LessonId,
    student_id: StudentId,
    completed: bool,
    watch_time_seconds: u32,
    completed_at: Option<DateTime<Utc>>,
    last_watched_at: DateTime<Utc>,
}

impl ProgressRecord {
    /// A fresh, unwatched record, as created by the first upsert for a pair.
    #[must_use]
    pub fn new(lesson_id: LessonId, student_id: StudentId, now: DateTime<Utc>) -> Self {
        Self {
            lesson_id,
            student_id,
            completed: false,
            watch_time_seconds: 0,
            completed_at: None,
            last_watched_at: now,
        }
    }

    /// Rebuild a record from its stored representation.
    #[must_use]
    pub fn from_persisted(
        lesson_id: LessonId,
        student_id: StudentId,
        completed: bool,
        watch_time_seconds: u32,
        completed_at: Option<DateTime<Utc>>,
        last_watched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            lesson_id,
            student_id,
            completed,
            watch_time_seconds,
            completed_at,
            last_watched_at,
        }
    }

    #[must_use]
    pub fn lesson_id(&self) -> LessonId {
        self.lesson_id
    }

    #[must_use]
    pub fn student_id(&self) -> StudentId {
        self.student_id
    }

    #[must_use]
    pub fn completed(&self) -> bool {
        self.completed
    }

    #[must_use]
    pub fn watch_time_seconds(&self) -> u32 {
        self.watch_time_seconds
    }

    #[must_use]
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    #[must_use]
    pub fn last_watched_at(&self) -> DateTime<Utc> {
        self.last_watched_at
    }

    /// Merge a partial update into this record.
    ///
    /// Returns true when this call completed the lesson (false→true
    /// transition); repeated completions return false and leave
    /// `completed_at` untouched.
    pub fn apply(&mut self, patch: &ProgressPatch, now: DateTime<Utc>) -> bool {
        self.last_watched_at = now;

        if let Some(watch) = patch.watch_time_seconds() {
            if watch > self.watch_time_seconds {
                self.watch_time_seconds = watch;
            }
        }

        let newly_completed = patch.completed() == Some(true) && !self.completed;
        if newly_completed {
            self.completed = true;
            self.completed_at = Some(now);
        }
        newly_completed
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//
