use chrono::{DateTime, Utc};

use campus_core::model::{LessonId, ProgressPatch, ProgressRecord, StudentId};

use super::{SqliteRepository, mapping::map_progress_row, mapping::map_sqlx_err};
use crate::repository::{ProgressRepository, StorageError};

#[async_trait::async_trait]
impl ProgressRepository for SqliteRepository {
    async fn upsert_progress(
        &self,
        lesson_id: LessonId,
        student_id: StudentId,
        patch: &ProgressPatch,
        now: DateTime<Utc>,
    ) -> Result<ProgressRecord, StorageError> {
        let completed = patch.completed().unwrap_or(false);
        let watch_time = patch.watch_time_seconds().unwrap_or(0);
        // Only a completing write proposes a completed_at; COALESCE below
        // keeps the value from the first completion.
        let completed_at: Option<DateTime<Utc>> = completed.then_some(now);

        let row = sqlx::query(
            r"
            INSERT INTO lesson_progress (
                lesson_id, student_id, completed, watch_time_seconds,
                completed_at, last_watched_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(lesson_id, student_id) DO UPDATE SET
                -- monotonic merge: completion never reverts, watch time never regresses
                completed = lesson_progress.completed OR excluded.completed,
                completed_at = COALESCE(lesson_progress.completed_at, excluded.completed_at),
                watch_time_seconds = MAX(lesson_progress.watch_time_seconds, excluded.watch_time_seconds),
                last_watched_at = excluded.last_watched_at
            RETURNING lesson_id, student_id, completed, watch_time_seconds,
                      completed_at, last_watched_at
            ",
        )
        .bind(lesson_id.value().to_string())
        .bind(student_id.value().to_string())
        .bind(completed)
        .bind(i64::from(watch_time))
        .bind(completed_at)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        map_progress_row(&row)
    }

    async fn get_progress(
        &self,
        lesson_id: LessonId,
        student_id: StudentId,
    ) -> Result<Option<ProgressRecord>, StorageError> {
        let row = sqlx::query(
            r"
            SELECT lesson_id, student_id, completed, watch_time_seconds,
                   completed_at, last_watched_at
            FROM lesson_progress
            WHERE lesson_id = ?1 AND student_id = ?2
            ",
        )
        .bind(lesson_id.value().to_string())
        .bind(student_id.value().to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        row.as_ref().map(map_progress_row).transpose()
    }

    async fn completed_for_student(
        &self,
        student_id: StudentId,
    ) -> Result<Vec<ProgressRecord>, StorageError> {
        let rows = sqlx::query(
            r"
            SELECT lesson_id, student_id, completed, watch_time_seconds,
                   completed_at, last_watched_at
            FROM lesson_progress
            WHERE student_id = ?1 AND completed = 1
            ORDER BY last_watched_at DESC
            ",
        )
        .bind(student_id.value().to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(map_progress_row(row)?);
        }
        Ok(records)
    }
}
