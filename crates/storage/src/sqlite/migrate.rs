use chrono::Utc;
use sqlx::SqlitePool;

use super::SqliteInitError;

/// Runs a single, consolidated migration for the current schema.
///
/// Creates the full schema (lesson progress, points aggregates, append-only
/// points history, and indexes).
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), SqliteInitError> {
    async fn is_applied(pool: &SqlitePool, version: i64) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 FROM schema_migrations WHERE version = ?1")
            .bind(version)
            .fetch_optional(pool)
            .await?;
        Ok(row.is_some())
    }

    sqlx::query(
        r"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );
            ",
    )
    .execute(pool)
    .await?;

    // Version 1: full schema.
    if !is_applied(pool, 1).await? {
        tracing::debug!("applying schema migration v1");
        let mut tx = pool.begin().await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS lesson_progress (
                    lesson_id TEXT NOT NULL,
                    student_id TEXT NOT NULL,
                    completed INTEGER NOT NULL DEFAULT 0 CHECK (completed IN (0, 1)),
                    watch_time_seconds INTEGER NOT NULL DEFAULT 0 CHECK (watch_time_seconds >= 0),
                    completed_at TEXT,
                    last_watched_at TEXT NOT NULL,
                    PRIMARY KEY (lesson_id, student_id)
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS student_points (
                    student_id TEXT PRIMARY KEY,
                    points INTEGER NOT NULL CHECK (points >= 0),
                    total_points INTEGER NOT NULL CHECK (total_points >= 0),
                    level INTEGER NOT NULL CHECK (level >= 1),
                    streak_days INTEGER NOT NULL CHECK (streak_days >= 0),
                    last_activity_date TEXT
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS points_history (
                    id INTEGER PRIMARY KEY,
                    student_id TEXT NOT NULL,
                    points INTEGER NOT NULL CHECK (points > 0),
                    action_type TEXT NOT NULL,
                    description TEXT,
                    reference_id TEXT,
                    earned_at TEXT NOT NULL
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        // Idempotency key for awards that carry a reference; NULL references
        // stay exempt because the index is partial.
        sqlx::query(
            r"
                CREATE UNIQUE INDEX IF NOT EXISTS idx_points_history_idempotency
                    ON points_history (student_id, action_type, reference_id)
                    WHERE reference_id IS NOT NULL;
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_points_history_student_earned
                    ON points_history (student_id, earned_at);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_lesson_progress_student_completed
                    ON lesson_progress (student_id, completed, last_watched_at);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                INSERT INTO schema_migrations (version, applied_at)
                VALUES (?1, ?2)
                ON CONFLICT(version) DO NOTHING
            ",
        )
        .bind(1_i64)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
    }

    Ok(())
}
