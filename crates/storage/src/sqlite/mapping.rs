use campus_core::model::{
    ActionType, LessonId, PointsHistoryEntry, ProgressRecord, StudentId, StudentPointsAggregate,
};
use sqlx::Row;

use crate::repository::StorageError;

fn ser<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Serialization(e.to_string())
}

/// Classifies sqlx failures into the pipeline's error taxonomy.
///
/// Unique violations and SQLite's busy/locked family are conflict-class (the
/// analog of HTTP 409): concurrent writers racing on a key, recoverable by
/// retrying. Everything else is a connection-level failure.
pub(crate) fn map_sqlx_err(e: sqlx::Error) -> StorageError {
    match &e {
        sqlx::Error::Database(db) => {
            if db.is_unique_violation() {
                return StorageError::Conflict;
            }
            // SQLITE_BUSY (5), SQLITE_LOCKED (6) and their extended codes.
            if matches!(db.code().as_deref(), Some("5" | "6" | "262" | "517")) {
                return StorageError::Conflict;
            }
            StorageError::Connection(e.to_string())
        }
        sqlx::Error::RowNotFound => StorageError::NotFound,
        _ => StorageError::Connection(e.to_string()),
    }
}

/// Error mapping for the points-history insert.
///
/// The only unique constraint reachable from that statement is the award
/// idempotency index, so a unique violation there means the logical event was
/// already recorded, not that writers raced. Busy/locked failures still fall
/// through to the conflict class via `map_sqlx_err`.
pub(crate) fn map_award_insert_err(e: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return StorageError::AlreadyExists;
        }
    }
    map_sqlx_err(e)
}

pub(crate) fn lesson_id_from_text(s: &str) -> Result<LessonId, StorageError> {
    s.parse()
        .map_err(|_| StorageError::Serialization(format!("invalid lesson_id: {s}")))
}

pub(crate) fn student_id_from_text(s: &str) -> Result<StudentId, StorageError> {
    s.parse()
        .map_err(|_| StorageError::Serialization(format!("invalid student_id: {s}")))
}

pub(crate) fn parse_action_type(s: &str) -> Result<ActionType, StorageError> {
    match s {
        "lesson_completed" => Ok(ActionType::LessonCompleted),
        "course_completed" => Ok(ActionType::CourseCompleted),
        "quiz_passed" => Ok(ActionType::QuizPassed),
        "community_contribution" => Ok(ActionType::CommunityContribution),
        _ => Err(StorageError::Serialization(format!(
            "invalid action_type: {s}"
        ))),
    }
}

fn u32_column(row: &sqlx::sqlite::SqliteRow, field: &'static str) -> Result<u32, StorageError> {
    let value: i64 = row.try_get(field).map_err(ser)?;
    u32::try_from(value).map_err(|_| StorageError::Serialization(format!("invalid {field}: {value}")))
}

pub(crate) fn map_progress_row(
    row: &sqlx::sqlite::SqliteRow,
) -> Result<ProgressRecord, StorageError> {
    let lesson_id = lesson_id_from_text(row.try_get::<String, _>("lesson_id").map_err(ser)?.as_str())?;
    let student_id =
        student_id_from_text(row.try_get::<String, _>("student_id").map_err(ser)?.as_str())?;

    Ok(ProgressRecord::from_persisted(
        lesson_id,
        student_id,
        row.try_get::<bool, _>("completed").map_err(ser)?,
        u32_column(row, "watch_time_seconds")?,
        row.try_get("completed_at").map_err(ser)?,
        row.try_get("last_watched_at").map_err(ser)?,
    ))
}

pub(crate) fn map_aggregate_row(
    row: &sqlx::sqlite::SqliteRow,
) -> Result<StudentPointsAggregate, StorageError> {
    let student_id =
        student_id_from_text(row.try_get::<String, _>("student_id").map_err(ser)?.as_str())?;

    Ok(StudentPointsAggregate::from_persisted(
        student_id,
        u32_column(row, "points")?,
        u32_column(row, "total_points")?,
        u32_column(row, "level")?,
        u32_column(row, "streak_days")?,
        row.try_get("last_activity_date").map_err(ser)?,
    ))
}

pub(crate) fn map_history_row(
    row: &sqlx::sqlite::SqliteRow,
) -> Result<PointsHistoryEntry, StorageError> {
    let student_id =
        student_id_from_text(row.try_get::<String, _>("student_id").map_err(ser)?.as_str())?;
    let action_str: String = row.try_get("action_type").map_err(ser)?;

    Ok(PointsHistoryEntry {
        id: Some(row.try_get("id").map_err(ser)?),
        student_id,
        points: u32_column(row, "points")?,
        action_type: parse_action_type(action_str.as_str())?,
        description: row.try_get("description").map_err(ser)?,
        reference_id: row.try_get("reference_id").map_err(ser)?,
        earned_at: row.try_get("earned_at").map_err(ser)?,
    })
}
