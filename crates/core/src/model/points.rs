use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::StudentId;

/// Points required to advance one level.
pub const POINTS_PER_LEVEL: u32 = 100;

/// Level derived from lifetime points: `total_points / 100 + 1`.
#[must_use]
pub fn level_for(total_points: u32) -> u32 {
    total_points / POINTS_PER_LEVEL + 1
}

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

/// Errors that can occur when building point awards.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PointsError {
    #[error("points delta must be positive")]
    ZeroDelta,
}

//
// ─── ACTION TYPE ───────────────────────────────────────────────────────────────
//

/// Classification tag for a qualifying gamification event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    /// A student finished watching a lesson.
    LessonCompleted,
    /// A student finished every lesson of a course.
    CourseCompleted,
    /// A student passed a course quiz.
    QuizPassed,
    /// A student contributed to a community thread.
    CommunityContribution,
}

impl ActionType {
    /// Storage encoding; must stay consistent with the parser in storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::LessonCompleted => "lesson_completed",
            ActionType::CourseCompleted => "course_completed",
            ActionType::QuizPassed => "quiz_passed",
            ActionType::CommunityContribution => "community_contribution",
        }
    }
}

//
// ─── POINTS AWARD ──────────────────────────────────────────────────────────────
//

/// A validated request to grant a points delta for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointsAward {
    student_id: StudentId,
    points: u32,
    action_type: ActionType,
    description: Option<String>,
    reference_id: Option<String>,
}

impl PointsAward {
    /// Build an award for a positive delta.
    ///
    /// # Errors
    ///
    /// Returns `PointsError::ZeroDelta` when `points` is zero.
    pub fn new(
        student_id: StudentId,
        points: u32,
        action_type: ActionType,
    ) -> Result<Self, PointsError> {
        if points == 0 {
            return Err(PointsError::ZeroDelta);
        }
        Ok(Self {
            student_id,
            points,
            action_type,
            description: None,
            reference_id: None,
        })
    }

    #[must_use]
    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    /// Attach the idempotency reference for this logical event (e.g. the
    /// lesson id for a completion). Awards without a reference are never
    /// deduplicated.
    #[must_use]
    pub fn with_reference(mut self, reference_id: Option<String>) -> Self {
        self.reference_id = reference_id;
        self
    }

    #[must_use]
    pub fn student_id(&self) -> StudentId {
        self.student_id
    }

    #[must_use]
    pub fn points(&self) -> u32 {
        self.points
    }

    #[must_use]
    pub fn action_type(&self) -> ActionType {
        self.action_type
    }

    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    #[must_use]
    pub fn reference_id(&self) -> Option<&str> {
        self.reference_id.as_deref()
    }
}

//
// ─── HISTORY ENTRY ─────────────────────────────────────────────────────────────
//

/// One immutable audit row per award event.
///
/// Holds the raw delta, never a cumulative value; the aggregate is canonical
/// for totals and level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointsHistoryEntry {
    pub id: Option<i64>,
    pub student_id: StudentId,
    pub points: u32,
    pub action_type: ActionType,
    pub description: Option<String>,
    pub reference_id: Option<String>,
    pub earned_at: DateTime<Utc>,
}

impl PointsHistoryEntry {
    #[must_use]
    pub fn from_award(award: &PointsAward, earned_at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            student_id: award.student_id(),
            points: award.points(),
            action_type: award.action_type(),
            description: award.description().map(str::to_owned),
            reference_id: award.reference_id().map(str::to_owned),
            earned_at,
        }
    }
}

//
// ─── AGGREGATE ─────────────────────────────────────────────────────────────────
//

/// The single canonical points/level summary per student.
///
/// Invariant: `level == total_points / 100 + 1` after every award.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentPointsAggregate {
    student_id: StudentId,
    points: u32,
    total_points: u32,
    level: u32,
    streak_days: u32,
    last_activity_date: Option<NaiveDate>,
}

impl StudentPointsAggregate {
    /// Zero-valued aggregate for a student with no awards yet.
    #[must_use]
    pub fn empty(student_id: StudentId) -> Self {
        Self {
            student_id,
            points: 0,
            total_points: 0,
            level: level_for(0),
            streak_days: 0,
            last_activity_date: None,
        }
    }

    /// Rebuild an aggregate from its stored representation.
    #[must_use]
    pub fn from_persisted(
        student_id: StudentId,
        points: u32,
        total_points: u32,
        level: u32,
        streak_days: u32,
        last_activity_date: Option<NaiveDate>,
    ) -> Self {
        Self {
            student_id,
            points,
            total_points,
            level,
            streak_days,
            last_activity_date,
        }
    }

    #[must_use]
    pub fn student_id(&self) -> StudentId {
        self.student_id
    }

    /// Current-cycle points.
    #[must_use]
    pub fn points(&self) -> u32 {
        self.points
    }

    /// Lifetime points; the input to level derivation.
    #[must_use]
    pub fn total_points(&self) -> u32 {
        self.total_points
    }

    #[must_use]
    pub fn level(&self) -> u32 {
        self.level
    }

    #[must_use]
    pub fn streak_days(&self) -> u32 {
        self.streak_days
    }

    #[must_use]
    pub fn last_activity_date(&self) -> Option<NaiveDate> {
        self.last_activity_date
    }

    /// The aggregate after granting `delta` points on `today`.
    ///
    /// Streaks count consecutive active days: a second award on the same day
    /// leaves the streak alone, an award on the following day extends it, and
    /// any gap restarts it at one.
    #[must_use]
    pub fn apply_award(&self, delta: u32, today: NaiveDate) -> Self {
        let total_points = self.total_points + delta;
        let streak_days = match self.last_activity_date {
            Some(last) if last == today => self.streak_days,
            Some(last) if last.succ_opt() == Some(today) => self.streak_days + 1,
            _ => 1,
        };

        Self {
            student_id: self.student_id,
            points: self.points + delta,
            total_points,
            level: level_for(total_points),
            streak_days,
            last_activity_date: Some(today),
        }
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//

#[cfg(test)]
mod tests {
    use super::*;

    fn day(n: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, n).unwrap()
    }

    #[test]
    fn level_derivation_holds_at_boundaries() {
        assert_eq!(level_for(0), 1);
        assert_eq!(level_for(99), 1);
        assert_eq!(level_for(100), 2);
        assert_eq!(level_for(249), 3);
    }

    #[test]
    fn award_updates_points_total_and_level() {
        let student = StudentId::random();
        let aggregate = StudentPointsAggregate::empty(student);

        let after = aggregate.apply_award(95, day(1)).apply_award(10, day(1));
        assert_eq!(after.points(), 105);
        assert_eq!(after.total_points(), 105);
        assert_eq!(after.level(), 2);
        assert_eq!(after.student_id(), student);
    }

    #[test]
    fn streak_extends_on_consecutive_days_and_resets_after_gap() {
        let aggregate = StudentPointsAggregate::empty(StudentId::random());

        let d1 = aggregate.apply_award(10, day(1));
        assert_eq!(d1.streak_days(), 1);

        // Same day: unchanged.
        let d1_again = d1.apply_award(10, day(1));
        assert_eq!(d1_again.streak_days(), 1);

        // Next day: extended.
        let d2 = d1_again.apply_award(10, day(2));
        assert_eq!(d2.streak_days(), 2);

        // Gap: restarted.
        let d5 = d2.apply_award(10, day(5));
        assert_eq!(d5.streak_days(), 1);
    }

    #[test]
    fn zero_delta_award_is_rejected() {
        let err = PointsAward::new(StudentId::random(), 0, ActionType::LessonCompleted).unwrap_err();
        assert_eq!(err, PointsError::ZeroDelta);
    }

    #[test]
    fn history_entry_carries_raw_delta() {
        let award = PointsAward::new(StudentId::random(), 15, ActionType::QuizPassed)
            .unwrap()
            .with_reference(Some("quiz-7".into()));
        let entry = PointsHistoryEntry::from_award(&award, crate::time::fixed_now());

        assert_eq!(entry.points, 15);
        assert_eq!(entry.action_type, ActionType::QuizPassed);
        assert_eq!(entry.reference_id.as_deref(), Some("quiz-7"));
        assert_eq!(entry.id, None);
    }
}
