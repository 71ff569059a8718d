use campus_core::model::{PointsHistoryEntry, StudentId, StudentPointsAggregate};

use super::{
    SqliteRepository,
    mapping::{map_aggregate_row, map_award_insert_err, map_history_row, map_sqlx_err},
};
use crate::repository::{PointsRepository, StorageError};

#[async_trait::async_trait]
impl PointsRepository for SqliteRepository {
    async fn get_aggregate(
        &self,
        student_id: StudentId,
    ) -> Result<Option<StudentPointsAggregate>, StorageError> {
        let row = sqlx::query(
            r"
            SELECT student_id, points, total_points, level, streak_days, last_activity_date
            FROM student_points
            WHERE student_id = ?1
            ",
        )
        .bind(student_id.value().to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        row.as_ref().map(map_aggregate_row).transpose()
    }

    async fn record_award(
        &self,
        aggregate: &StudentPointsAggregate,
        entry: &PointsHistoryEntry,
    ) -> Result<i64, StorageError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        // History first: its idempotency index is what detects a duplicate
        // award, and the rollback keeps the aggregate untouched in that case.
        let inserted = sqlx::query(
            r"
            INSERT INTO points_history (
                student_id, points, action_type, description, reference_id, earned_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
        )
        .bind(entry.student_id.value().to_string())
        .bind(i64::from(entry.points))
        .bind(entry.action_type.as_str())
        .bind(entry.description.as_deref())
        .bind(entry.reference_id.as_deref())
        .bind(entry.earned_at)
        .execute(&mut *tx)
        .await
        .map_err(map_award_insert_err)?;
        let id = inserted.last_insert_rowid();

        sqlx::query(
            r"
            INSERT INTO student_points (
                student_id, points, total_points, level, streak_days, last_activity_date
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(student_id) DO UPDATE SET
                points = excluded.points,
                total_points = excluded.total_points,
                level = excluded.level,
                streak_days = excluded.streak_days,
                last_activity_date = excluded.last_activity_date
            ",
        )
        .bind(aggregate.student_id().value().to_string())
        .bind(i64::from(aggregate.points()))
        .bind(i64::from(aggregate.total_points()))
        .bind(i64::from(aggregate.level()))
        .bind(i64::from(aggregate.streak_days()))
        .bind(aggregate.last_activity_date())
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(id)
    }

    async fn history_for_student(
        &self,
        student_id: StudentId,
    ) -> Result<Vec<PointsHistoryEntry>, StorageError> {
        let rows = sqlx::query(
            r"
            SELECT id, student_id, points, action_type, description, reference_id, earned_at
            FROM points_history
            WHERE student_id = ?1
            ORDER BY earned_at DESC, id DESC
            ",
        )
        .bind(student_id.value().to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            entries.push(map_history_row(row)?);
        }
        Ok(entries)
    }
}
