use std::sync::Arc;

use campus_core::Clock;
use campus_core::model::{
    ActionType, PointsAward, PointsHistoryEntry, StudentId, StudentPointsAggregate,
};
use storage::repository::{PointsRepository, StorageError};

use crate::error::LedgerError;

/// Outcome of an award attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwardReceipt {
    pub aggregate: StudentPointsAggregate,
    /// False when the idempotency key showed this award was already recorded;
    /// the returned aggregate is then the stored one, unchanged.
    pub newly_awarded: bool,
}

/// Converts qualifying events into point awards.
///
/// The aggregate is canonical for the points/level a student sees; history is
/// the audit trail. Both are written as one storage transaction, so a crash
/// can no longer leave an award without its history row.
#[derive(Clone)]
pub struct PointsLedger {
    clock: Clock,
    points: Arc<dyn PointsRepository>,
}

impl PointsLedger {
    /// Create a ledger with a real-time clock.
    #[must_use]
    pub fn new(points: Arc<dyn PointsRepository>) -> Self {
        Self {
            clock: Clock::default(),
            points,
        }
    }

    /// Override the clock (usually for deterministic testing).
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Award `points` to `student` for `action`.
    ///
    /// Reads the current aggregate (zero-valued when absent), derives the new
    /// points/total/level/streak, and persists aggregate + history entry
    /// atomically. A duplicate `(student, action, reference)` is detected by
    /// the history idempotency key and reported as `newly_awarded: false`.
    ///
    /// # Errors
    ///
    /// - `PointsError::ZeroDelta` for a zero delta.
    /// - Storage errors from reading or writing, contention included; only
    ///   the idempotency hit is downgraded to a no-op, since nothing else
    ///   guarantees the award actually landed.
    pub async fn award_points(
        &self,
        student: StudentId,
        points: u32,
        action: ActionType,
        description: Option<String>,
        reference: Option<String>,
    ) -> Result<AwardReceipt, LedgerError> {
        let award = PointsAward::new(student, points, action)?
            .with_description(description)
            .with_reference(reference);

        let now = self.clock.now();
        let current = self
            .points
            .get_aggregate(student)
            .await?
            .unwrap_or_else(|| StudentPointsAggregate::empty(student));
        let updated = current.apply_award(award.points(), now.date_naive());
        let entry = PointsHistoryEntry::from_award(&award, now);

        match self.points.record_award(&updated, &entry).await {
            Ok(_id) => Ok(AwardReceipt {
                aggregate: updated,
                newly_awarded: true,
            }),
            Err(StorageError::AlreadyExists) => {
                tracing::debug!(
                    %student,
                    action = entry.action_type.as_str(),
                    reference = entry.reference_id.as_deref(),
                    "duplicate award ignored"
                );
                Ok(AwardReceipt {
                    aggregate: current,
                    newly_awarded: false,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// The aggregate for a student, zero-valued when none exists yet.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the lookup.
    pub async fn aggregate_for(
        &self,
        student: StudentId,
    ) -> Result<StudentPointsAggregate, LedgerError> {
        Ok(self
            .points
            .get_aggregate(student)
            .await?
            .unwrap_or_else(|| StudentPointsAggregate::empty(student)))
    }

    /// Award history for a student, newest first.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the query.
    pub async fn history_for(
        &self,
        student: StudentId,
    ) -> Result<Vec<PointsHistoryEntry>, LedgerError> {
        Ok(self.points.history_for_student(student).await?)
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//

#[cfg(test)]
mod tests {
    use super::*;
    use campus_core::model::PointsError;
    use campus_core::time::fixed_clock;
    use storage::repository::InMemoryRepository;

    fn ledger() -> PointsLedger {
        PointsLedger::new(Arc::new(InMemoryRepository::new())).with_clock(fixed_clock())
    }

    #[tokio::test]
    async fn award_maintains_level_derivation() {
        let ledger = ledger();
        let student = StudentId::random();

        let first = ledger
            .award_points(student, 99, ActionType::QuizPassed, None, None)
            .await
            .unwrap();
        assert_eq!(first.aggregate.total_points(), 99);
        assert_eq!(first.aggregate.level(), 1);

        let second = ledger
            .award_points(student, 1, ActionType::QuizPassed, None, None)
            .await
            .unwrap();
        assert_eq!(second.aggregate.total_points(), 100);
        assert_eq!(second.aggregate.level(), 2);

        let third = ledger
            .award_points(student, 149, ActionType::QuizPassed, None, None)
            .await
            .unwrap();
        assert_eq!(third.aggregate.total_points(), 249);
        assert_eq!(third.aggregate.level(), 3);
    }

    #[tokio::test]
    async fn history_keeps_raw_deltas_while_aggregate_sums() {
        let ledger = ledger();
        let student = StudentId::random();

        ledger
            .award_points(student, 10, ActionType::LessonCompleted, None, Some("a".into()))
            .await
            .unwrap();
        let receipt = ledger
            .award_points(student, 15, ActionType::LessonCompleted, None, Some("b".into()))
            .await
            .unwrap();

        assert_eq!(receipt.aggregate.total_points(), 25);
        assert_eq!(receipt.aggregate.points(), 25);

        let mut deltas: Vec<u32> = ledger
            .history_for(student)
            .await
            .unwrap()
            .iter()
            .map(|h| h.points)
            .collect();
        deltas.sort_unstable();
        assert_eq!(deltas, vec![10, 15]);
    }

    #[tokio::test]
    async fn duplicate_reference_is_a_detected_no_op() {
        let ledger = ledger();
        let student = StudentId::random();

        let first = ledger
            .award_points(
                student,
                10,
                ActionType::LessonCompleted,
                None,
                Some("lesson-1".into()),
            )
            .await
            .unwrap();
        assert!(first.newly_awarded);

        let second = ledger
            .award_points(
                student,
                10,
                ActionType::LessonCompleted,
                None,
                Some("lesson-1".into()),
            )
            .await
            .unwrap();
        assert!(!second.newly_awarded);
        assert_eq!(second.aggregate.total_points(), 10);

        assert_eq!(ledger.history_for(student).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn contention_on_the_award_write_is_an_error_not_a_duplicate() {
        use async_trait::async_trait;

        /// Repository whose award transaction always loses the database lock.
        struct BusyPointsRepo;

        #[async_trait]
        impl PointsRepository for BusyPointsRepo {
            async fn get_aggregate(
                &self,
                _student_id: StudentId,
            ) -> Result<Option<StudentPointsAggregate>, StorageError> {
                Ok(None)
            }

            async fn record_award(
                &self,
                _aggregate: &StudentPointsAggregate,
                _entry: &PointsHistoryEntry,
            ) -> Result<i64, StorageError> {
                Err(StorageError::Conflict)
            }

            async fn history_for_student(
                &self,
                _student_id: StudentId,
            ) -> Result<Vec<PointsHistoryEntry>, StorageError> {
                Ok(Vec::new())
            }
        }

        let ledger = PointsLedger::new(Arc::new(BusyPointsRepo)).with_clock(fixed_clock());
        let err = ledger
            .award_points(
                StudentId::random(),
                10,
                ActionType::LessonCompleted,
                None,
                Some("lesson-1".into()),
            )
            .await
            .unwrap_err();

        // A lost write must surface, not be reported as an earlier award.
        assert!(matches!(err, LedgerError::Storage(StorageError::Conflict)));
    }

    #[tokio::test]
    async fn zero_delta_is_rejected() {
        let ledger = ledger();
        let err = ledger
            .award_points(StudentId::random(), 0, ActionType::LessonCompleted, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Points(PointsError::ZeroDelta)));
    }

    #[tokio::test]
    async fn aggregate_for_defaults_to_zero_valued() {
        let ledger = ledger();
        let aggregate = ledger.aggregate_for(StudentId::random()).await.unwrap();
        assert_eq!(aggregate.total_points(), 0);
        assert_eq!(aggregate.level(), 1);
        assert_eq!(aggregate.streak_days(), 0);
    }
}
