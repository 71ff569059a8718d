//! End-to-end pipeline flow: player events through debounce, durable upsert,
//! points award, and user notification.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use campus_core::model::{LessonId, ProgressPatch, ProgressRecord, StudentId};
use campus_core::time::fixed_clock;
use services::{
    AuthContext, CacheInvalidator, Notice, Notifier, PlaybackEvent, PointsLedger, ProgressService,
    QueryScope, RetryPolicy, TrackerError, WatchTracker,
};
use storage::repository::{
    InMemoryRepository, PointsRepository, ProgressRepository, StorageError,
};

//
// ─── TEST DOUBLES ──────────────────────────────────────────────────────────────
//

#[derive(Default)]
struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        self.notices.lock().unwrap().push(notice);
    }
}

impl RecordingNotifier {
    fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }
}

#[derive(Default)]
struct RecordingInvalidator {
    batches: Mutex<Vec<Vec<QueryScope>>>,
}

impl CacheInvalidator for RecordingInvalidator {
    fn invalidate(&self, scopes: &[QueryScope]) {
        self.batches.lock().unwrap().push(scopes.to_vec());
    }
}

impl RecordingInvalidator {
    fn batches(&self) -> Vec<Vec<QueryScope>> {
        self.batches.lock().unwrap().clone()
    }
}

/// Delegates to the in-memory repository while counting upserts.
struct CountingProgressRepo {
    inner: InMemoryRepository,
    upserts: AtomicUsize,
}

impl CountingProgressRepo {
    fn new() -> Self {
        Self {
            inner: InMemoryRepository::new(),
            upserts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ProgressRepository for CountingProgressRepo {
    async fn upsert_progress(
        &self,
        lesson_id: LessonId,
        student_id: StudentId,
        patch: &ProgressPatch,
        now: DateTime<Utc>,
    ) -> Result<ProgressRecord, StorageError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.inner.upsert_progress(lesson_id, student_id, patch, now).await
    }

    async fn get_progress(
        &self,
        lesson_id: LessonId,
        student_id: StudentId,
    ) -> Result<Option<ProgressRecord>, StorageError> {
        self.inner.get_progress(lesson_id, student_id).await
    }

    async fn completed_for_student(
        &self,
        student_id: StudentId,
    ) -> Result<Vec<ProgressRecord>, StorageError> {
        self.inner.completed_for_student(student_id).await
    }
}

/// Progress repository that fails every write with the given error.
struct FailingProgressRepo {
    make_error: fn() -> StorageError,
    attempts: AtomicUsize,
}

impl FailingProgressRepo {
    fn new(make_error: fn() -> StorageError) -> Self {
        Self {
            make_error,
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ProgressRepository for FailingProgressRepo {
    async fn upsert_progress(
        &self,
        _lesson_id: LessonId,
        _student_id: StudentId,
        _patch: &ProgressPatch,
        _now: DateTime<Utc>,
    ) -> Result<ProgressRecord, StorageError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err((self.make_error)())
    }

    async fn get_progress(
        &self,
        _lesson_id: LessonId,
        _student_id: StudentId,
    ) -> Result<Option<ProgressRecord>, StorageError> {
        Ok(None)
    }

    async fn completed_for_student(
        &self,
        _student_id: StudentId,
    ) -> Result<Vec<ProgressRecord>, StorageError> {
        Ok(Vec::new())
    }
}

/// Points repository that drops its first award on the floor, then delegates.
struct FlakyPointsRepo {
    inner: InMemoryRepository,
    failed_once: AtomicBool,
}

impl FlakyPointsRepo {
    fn new() -> Self {
        Self {
            inner: InMemoryRepository::new(),
            failed_once: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PointsRepository for FlakyPointsRepo {
    async fn get_aggregate(
        &self,
        student_id: StudentId,
    ) -> Result<Option<campus_core::model::StudentPointsAggregate>, StorageError> {
        self.inner.get_aggregate(student_id).await
    }

    async fn record_award(
        &self,
        aggregate: &campus_core::model::StudentPointsAggregate,
        entry: &campus_core::model::PointsHistoryEntry,
    ) -> Result<i64, StorageError> {
        if !self.failed_once.swap(true, Ordering::SeqCst) {
            return Err(StorageError::Connection("socket reset".into()));
        }
        self.inner.record_award(aggregate, entry).await
    }

    async fn history_for_student(
        &self,
        student_id: StudentId,
    ) -> Result<Vec<campus_core::model::PointsHistoryEntry>, StorageError> {
        self.inner.history_for_student(student_id).await
    }
}

struct Harness {
    tracker: WatchTracker,
    student: StudentId,
    notifier: Arc<RecordingNotifier>,
    invalidator: Arc<RecordingInvalidator>,
    points: Arc<InMemoryRepository>,
}

fn harness_with(progress: Arc<dyn ProgressRepository>, policy: RetryPolicy) -> Harness {
    let student = StudentId::random();
    let points = Arc::new(InMemoryRepository::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let invalidator = Arc::new(RecordingInvalidator::default());

    let service = ProgressService::new(progress)
        .with_clock(fixed_clock())
        .with_retry_policy(policy);
    let ledger = PointsLedger::new(points.clone() as Arc<dyn PointsRepository>)
        .with_clock(fixed_clock());

    let tracker = WatchTracker::new(
        &AuthContext::authenticated(student),
        service,
        ledger,
        notifier.clone(),
        invalidator.clone(),
    )
    .unwrap();

    Harness {
        tracker,
        student,
        notifier,
        invalidator,
        points,
    }
}

fn harness() -> Harness {
    harness_with(Arc::new(InMemoryRepository::new()), RetryPolicy::immediate(3))
}

//
// ─── SCENARIOS ─────────────────────────────────────────────────────────────────
//

#[tokio::test]
async fn ended_event_flushes_completion_and_awards_points() {
    let mut h = harness();
    let lesson = LessonId::random();

    let outcome = h
        .tracker
        .handle_event(lesson, PlaybackEvent::Ended { duration_seconds: 300 })
        .await
        .unwrap()
        .expect("ended must flush immediately");

    assert!(outcome.record.completed());
    assert_eq!(outcome.record.watch_time_seconds(), 300);
    assert_eq!(outcome.awarded_points, Some(10));

    let aggregate = h
        .points
        .get_aggregate(h.student)
        .await
        .unwrap()
        .expect("aggregate created by the award");
    assert_eq!(aggregate.total_points(), 10);
    assert_eq!(aggregate.level(), 1);
    assert_eq!(aggregate.streak_days(), 1);

    let history = h.points.history_for_student(h.student).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].points, 10);

    assert_eq!(
        h.notifier.notices(),
        vec![Notice::LessonCompleted { lesson, points: 10 }]
    );

    let batches = h.invalidator.batches();
    assert_eq!(batches.len(), 1);
    assert!(batches[0].contains(&QueryScope::CourseCatalog));
    assert!(batches[0].contains(&QueryScope::LessonProgress(lesson)));
    assert!(batches[0].contains(&QueryScope::StudentPoints(h.student)));
    assert!(batches[0].contains(&QueryScope::PointsHistory(h.student)));
}

#[tokio::test]
async fn rewatching_never_awards_or_notifies_twice() {
    let mut h = harness();
    let lesson = LessonId::random();

    h.tracker
        .handle_event(lesson, PlaybackEvent::Ended { duration_seconds: 300 })
        .await
        .unwrap();

    // Same session: the notified set short-circuits before the ledger.
    let again = h
        .tracker
        .handle_event(lesson, PlaybackEvent::Ended { duration_seconds: 300 })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.awarded_points, None);

    // New session for the same lesson: the ledger's idempotency key catches it.
    h.tracker.teardown(lesson);
    let fresh = h
        .tracker
        .handle_event(lesson, PlaybackEvent::Ended { duration_seconds: 310 })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fresh.awarded_points, None);

    assert_eq!(h.points.history_for_student(h.student).await.unwrap().len(), 1);
    assert_eq!(h.notifier.notices().len(), 1);
}

#[tokio::test]
async fn time_update_burst_coalesces_into_one_write() {
    let repo = Arc::new(CountingProgressRepo::new());
    let mut h = harness_with(repo.clone(), RetryPolicy::immediate(3));
    // Zero window so the fixed clock is already past the deadline.
    h.tracker = h.tracker.with_debounce_window(Duration::zero());
    let lesson = LessonId::random();

    for position in [10, 12, 14] {
        let outcome = h
            .tracker
            .handle_event(lesson, PlaybackEvent::TimeUpdate { position_seconds: position })
            .await
            .unwrap();
        assert!(outcome.is_none());
    }
    assert_eq!(repo.upserts.load(Ordering::SeqCst), 0);

    let outcomes = h.tracker.tick().await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].record.watch_time_seconds(), 14);
    assert!(!outcomes[0].record.completed());
    assert_eq!(outcomes[0].awarded_points, None);
    assert_eq!(repo.upserts.load(Ordering::SeqCst), 1);

    // Drained slot: a later tick writes nothing.
    assert!(h.tracker.tick().await.unwrap().is_empty());
    assert_eq!(repo.upserts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn permission_failure_notifies_and_propagates() {
    let repo = Arc::new(FailingProgressRepo::new(|| {
        StorageError::PermissionDenied("row-level policy".into())
    }));
    let mut h = harness_with(repo, RetryPolicy::immediate(3));
    let lesson = LessonId::random();

    let err = h
        .tracker
        .handle_event(lesson, PlaybackEvent::Ended { duration_seconds: 60 })
        .await
        .unwrap_err();
    assert!(matches!(err, TrackerError::Progress(_)));

    let notices = h.notifier.notices();
    assert_eq!(notices.len(), 1);
    assert!(matches!(notices[0], Notice::PermissionDenied { .. }));

    // Failed write never awards points or touches caches.
    assert!(h.points.history_for_student(h.student).await.unwrap().is_empty());
    assert!(h.invalidator.batches().is_empty());
}

#[tokio::test]
async fn exhausted_conflict_is_suppressed_from_the_user() {
    let repo = Arc::new(FailingProgressRepo::new(|| StorageError::Conflict));
    let mut h = harness_with(repo, RetryPolicy::immediate(3));
    let lesson = LessonId::random();

    let outcome = h
        .tracker
        .handle_event(lesson, PlaybackEvent::Ended { duration_seconds: 60 })
        .await
        .unwrap();

    assert!(outcome.is_none());
    assert!(h.notifier.notices().is_empty());
    assert!(h.points.history_for_student(h.student).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_tick_keeps_unattempted_flushes_pending() {
    let repo = Arc::new(FailingProgressRepo::new(|| {
        StorageError::PermissionDenied("row-level policy".into())
    }));
    let mut h = harness_with(repo.clone(), RetryPolicy::immediate(3));
    h.tracker = h.tracker.with_debounce_window(Duration::zero());

    h.tracker
        .handle_event(LessonId::random(), PlaybackEvent::TimeUpdate { position_seconds: 10 })
        .await
        .unwrap();
    h.tracker
        .handle_event(LessonId::random(), PlaybackEvent::TimeUpdate { position_seconds: 20 })
        .await
        .unwrap();

    // First tick fails on its first write; the other lesson's flush must
    // survive for a later attempt instead of vanishing.
    h.tracker.tick().await.unwrap_err();
    assert_eq!(repo.attempts.load(Ordering::SeqCst), 1);
    assert!(h.tracker.has_pending());

    h.tracker.tick().await.unwrap_err();
    assert_eq!(repo.attempts.load(Ordering::SeqCst), 2);
    assert!(!h.tracker.has_pending());
}

#[tokio::test]
async fn transient_ledger_failure_leaves_the_award_retryable() {
    let student = StudentId::random();
    let points = Arc::new(FlakyPointsRepo::new());
    let notifier = Arc::new(RecordingNotifier::default());

    let service =
        ProgressService::new(Arc::new(InMemoryRepository::new())).with_clock(fixed_clock());
    let ledger =
        PointsLedger::new(points.clone() as Arc<dyn PointsRepository>).with_clock(fixed_clock());
    let mut tracker = WatchTracker::new(
        &AuthContext::authenticated(student),
        service,
        ledger,
        notifier.clone(),
        Arc::new(RecordingInvalidator::default()),
    )
    .unwrap();
    let lesson = LessonId::random();

    let err = tracker
        .handle_event(lesson, PlaybackEvent::Ended { duration_seconds: 300 })
        .await
        .unwrap_err();
    assert!(matches!(err, TrackerError::Ledger(_)));
    assert!(notifier.notices().is_empty());

    // The at-most-once guard was not consumed by the failure, so finishing
    // the lesson again retries the award and it lands exactly once.
    let outcome = tracker
        .handle_event(lesson, PlaybackEvent::Ended { duration_seconds: 300 })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.awarded_points, Some(10));

    assert_eq!(points.inner.history_for_student(student).await.unwrap().len(), 1);
    assert_eq!(
        notifier.notices(),
        vec![Notice::LessonCompleted { lesson, points: 10 }]
    );
}

#[tokio::test]
async fn anonymous_context_cannot_build_a_tracker() {
    let storage = Arc::new(InMemoryRepository::new());
    let err = WatchTracker::new(
        &AuthContext::anonymous(),
        ProgressService::new(storage.clone()),
        PointsLedger::new(storage),
        Arc::new(RecordingNotifier::default()),
        Arc::new(RecordingInvalidator::default()),
    )
    .unwrap_err();
    assert!(matches!(err, TrackerError::NotAuthenticated));
}
