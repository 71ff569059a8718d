use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use campus_core::model::{ActionType, LessonId, ProgressPatch, ProgressRecord, StudentId};

use crate::auth::AuthContext;
use crate::error::TrackerError;
use crate::gamification::PointsLedger;
use crate::invalidate::{CacheInvalidator, QueryScope};
use crate::notify::{Notice, Notifier};
use crate::progress_service::ProgressService;

/// Quiet period after the last playback event before a burst is flushed.
const DEBOUNCE_WINDOW_SECS: i64 = 4;

/// Points granted for finishing a lesson.
pub const LESSON_COMPLETION_POINTS: u32 = 10;

//
// ─── EVENTS & PENDING STATE ────────────────────────────────────────────────────
//

/// Player-side signals feeding the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// Periodic position report while the lesson plays.
    TimeUpdate { position_seconds: u32 },
    /// The player reached the end of the lesson.
    Ended { duration_seconds: u32 },
}

/// The latest values for one lesson, waiting out the quiet period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingFlush {
    pub watch_time_seconds: u32,
    pub completed: bool,
}

impl PendingFlush {
    fn patch(self) -> ProgressPatch {
        // Never writes `completed = false`; an ordinary time update simply
        // leaves the stored flag alone.
        if self.completed {
            ProgressPatch::completion(self.watch_time_seconds)
        } else {
            ProgressPatch::watch_time(self.watch_time_seconds)
        }
    }
}

//
// ─── DEBOUNCER ─────────────────────────────────────────────────────────────────
//

/// Trailing debounce for one `(student, lesson)` playback session.
///
/// A single-slot mailbox: only the latest values survive a burst, and each
/// new event restarts the quiet period. The completion flag is sticky inside
/// the slot so coalescing can never drop a queued completion. `Ended` events
/// bypass the mailbox entirely and flush at once.
#[derive(Debug, Clone)]
pub struct WatchDebouncer {
    window: Duration,
    pending: Option<PendingFlush>,
    deadline: Option<DateTime<Utc>>,
}

impl WatchDebouncer {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
            deadline: None,
        }
    }

    /// Record a playback event.
    ///
    /// Returns a flush to perform immediately for events that bypass the
    /// debounce (`Ended`); otherwise the event is coalesced into the pending
    /// slot and the quiet period restarts.
    pub fn on_event(&mut self, event: PlaybackEvent, now: DateTime<Utc>) -> Option<PendingFlush> {
        match event {
            PlaybackEvent::Ended { duration_seconds } => {
                // Completion outranks whatever is still pending; carry the
                // larger position forward and clear the slot.
                let watch_time = self
                    .pending
                    .take()
                    .map_or(duration_seconds, |p| p.watch_time_seconds.max(duration_seconds));
                self.deadline = None;
                Some(PendingFlush {
                    watch_time_seconds: watch_time,
                    completed: true,
                })
            }
            PlaybackEvent::TimeUpdate { position_seconds } => {
                let completed = self.pending.is_some_and(|p| p.completed);
                self.pending = Some(PendingFlush {
                    watch_time_seconds: position_seconds,
                    completed,
                });
                self.deadline = Some(now + self.window);
                None
            }
        }
    }

    /// Take the pending flush if the quiet period has elapsed at `now`.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Option<PendingFlush> {
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }
        self.deadline = None;
        self.pending.take()
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Put back a flush that was polled but never attempted.
    ///
    /// The slot is merged with anything recorded since and stays due, so the
    /// next poll hands it out again.
    fn requeue(&mut self, flush: PendingFlush, now: DateTime<Utc>) {
        let merged = match self.pending.take() {
            Some(newer) => PendingFlush {
                watch_time_seconds: newer.watch_time_seconds.max(flush.watch_time_seconds),
                completed: newer.completed || flush.completed,
            },
            None => flush,
        };
        self.pending = Some(merged);
        self.deadline = Some(self.deadline.unwrap_or(now).min(now));
    }
}

//
// ─── TRACKER ───────────────────────────────────────────────────────────────────
//

/// Outcome of a flushed write, for the caller's UI refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushOutcome {
    pub lesson: LessonId,
    pub record: ProgressRecord,
    /// Set when this flush completed the lesson and points were granted.
    pub awarded_points: Option<u32>,
}

/// Session-scoped orchestrator between the player and the progress store.
///
/// Owns one debouncer per lesson, the at-most-once completion notice set, and
/// the award trigger. Created per authenticated student and torn down with
/// the player; per pair there is at most one in-flight upsert because flushes
/// are awaited inline.
pub struct WatchTracker {
    student: StudentId,
    window: Duration,
    completion_points: u32,
    progress: ProgressService,
    ledger: PointsLedger,
    notifier: Arc<dyn Notifier>,
    invalidator: Arc<dyn CacheInvalidator>,
    sessions: HashMap<LessonId, WatchDebouncer>,
    notified: HashSet<LessonId>,
}

impl std::fmt::Debug for WatchTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchTracker")
            .field("student", &self.student)
            .field("window", &self.window)
            .field("completion_points", &self.completion_points)
            .finish_non_exhaustive()
    }
}

impl WatchTracker {
    /// Build a tracker for the authenticated student in `auth`.
    ///
    /// # Errors
    ///
    /// Returns `TrackerError::NotAuthenticated` when the context carries no
    /// student; this precondition is checked once, up front.
    pub fn new(
        auth: &AuthContext,
        progress: ProgressService,
        ledger: PointsLedger,
        notifier: Arc<dyn Notifier>,
        invalidator: Arc<dyn CacheInvalidator>,
    ) -> Result<Self, TrackerError> {
        Ok(Self {
            student: auth.current_student()?,
            window: Duration::seconds(DEBOUNCE_WINDOW_SECS),
            completion_points: LESSON_COMPLETION_POINTS,
            progress,
            ledger,
            notifier,
            invalidator,
            sessions: HashMap::new(),
            notified: HashSet::new(),
        })
    }

    /// Override the debounce window (tests, slow connections).
    #[must_use]
    pub fn with_debounce_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Override the points granted per completed lesson.
    #[must_use]
    pub fn with_completion_points(mut self, points: u32) -> Self {
        self.completion_points = points;
        self
    }

    #[must_use]
    pub fn student(&self) -> StudentId {
        self.student
    }

    /// Feed a playback event for `lesson`.
    ///
    /// `TimeUpdate` events are coalesced and return `None`; `Ended` flushes
    /// immediately and returns the outcome.
    ///
    /// # Errors
    ///
    /// Propagates flush failures per the tracker's error-surface policy (see
    /// `flush`).
    pub async fn handle_event(
        &mut self,
        lesson: LessonId,
        event: PlaybackEvent,
    ) -> Result<Option<FlushOutcome>, TrackerError> {
        let now = self.progress.now();
        let window = self.window;
        let debouncer = self
            .sessions
            .entry(lesson)
            .or_insert_with(|| WatchDebouncer::new(window));

        match debouncer.on_event(event, now) {
            Some(flush) => self.flush(lesson, flush).await,
            None => Ok(None),
        }
    }

    /// Flush every lesson whose quiet period has elapsed.
    ///
    /// # Errors
    ///
    /// Propagates the first flush failure. Lessons already flushed keep their
    /// outcome; flushes this call never attempted are requeued into their
    /// debouncers, still due, so the next tick retries them.
    pub async fn tick(&mut self) -> Result<Vec<FlushOutcome>, TrackerError> {
        let now = self.progress.now();
        let due: Vec<(LessonId, PendingFlush)> = self
            .sessions
            .iter_mut()
            .filter_map(|(lesson, debouncer)| debouncer.poll(now).map(|flush| (*lesson, flush)))
            .collect();

        let mut outcomes = Vec::with_capacity(due.len());
        for idx in 0..due.len() {
            let (lesson, flush) = due[idx];
            match self.flush(lesson, flush).await {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => {}
                Err(err) => {
                    for &(lesson, flush) in &due[idx + 1..] {
                        if let Some(debouncer) = self.sessions.get_mut(&lesson) {
                            debouncer.requeue(flush, now);
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(outcomes)
    }

    /// True while any lesson still holds an unflushed slot.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.sessions.values().any(WatchDebouncer::is_pending)
    }

    /// Drop pending state for `lesson` and allow its completion notice again.
    ///
    /// Called when the player is torn down or navigates to another lesson.
    /// An unflushed slot is discarded, not flushed.
    pub fn teardown(&mut self, lesson: LessonId) {
        self.sessions.remove(&lesson);
        self.notified.remove(&lesson);
    }

    async fn flush(
        &mut self,
        lesson: LessonId,
        flush: PendingFlush,
    ) -> Result<Option<FlushOutcome>, TrackerError> {
        let record = match self
            .progress
            .update_progress(self.student, lesson, flush.patch())
            .await
        {
            Ok(record) => record,
            Err(err) if err.is_conflict() => {
                // Expected under sustained contention once retries are spent.
                // Users are not alarmed; operators can still see it.
                tracing::warn!(
                    %lesson,
                    student = %self.student,
                    "progress write lost to contention"
                );
                return Ok(None);
            }
            Err(err) if err.is_permission() => {
                self.notifier.notify(Notice::PermissionDenied {
                    message: "You do not have access to this lesson".into(),
                });
                return Err(err.into());
            }
            Err(err) => {
                self.notifier.notify(Notice::UpdateFailed {
                    message: err.to_string(),
                });
                return Err(err.into());
            }
        };

        let awarded_points = if flush.completed && !self.notified.contains(&lesson) {
            // Guard set only once the ledger answered; a transient award
            // failure leaves it clear so a later flush can retry, and the
            // idempotency key keeps that retry safe.
            let points = self.award_completion(lesson).await?;
            self.notified.insert(lesson);
            points
        } else {
            None
        };

        let mut scopes = vec![
            QueryScope::CourseCatalog,
            QueryScope::LessonProgress(lesson),
        ];
        if awarded_points.is_some() {
            scopes.push(QueryScope::StudentPoints(self.student));
            scopes.push(QueryScope::PointsHistory(self.student));
        }
        self.invalidator.invalidate(&scopes);

        Ok(Some(FlushOutcome {
            lesson,
            record,
            awarded_points,
        }))
    }

    /// Grant completion points at most once per logical completion.
    ///
    /// The session `notified` set is the first guard; the ledger's
    /// idempotency key (reference = lesson id) catches re-watches across
    /// sessions and turns them into no-ops.
    async fn award_completion(&mut self, lesson: LessonId) -> Result<Option<u32>, TrackerError> {
        let receipt = self
            .ledger
            .award_points(
                self.student,
                self.completion_points,
                ActionType::LessonCompleted,
                Some("Lesson completed".into()),
                Some(lesson.to_string()),
            )
            .await?;

        if receipt.newly_awarded {
            self.notifier.notify(Notice::LessonCompleted {
                lesson,
                points: self.completion_points,
            });
            return Ok(Some(self.completion_points));
        }
        Ok(None)
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//
