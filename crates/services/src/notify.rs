use campus_core::model::LessonId;

/// User-facing notices emitted by the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Celebration for a newly completed lesson.
    LessonCompleted { lesson: LessonId, points: u32 },
    /// The backend refused the write for this user.
    PermissionDenied { message: String },
    /// Any other failure worth telling the user about.
    UpdateFailed { message: String },
}

/// Best-effort, fire-and-forget notification channel (toasts, banners).
///
/// The signature is infallible on purpose: delivery failures must never be
/// able to affect data correctness, so implementations swallow them.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Discards every notice.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _notice: Notice) {}
}
