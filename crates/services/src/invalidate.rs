use campus_core::model::{LessonId, StudentId};

/// Read-side caches that go stale after a successful write.
///
/// Refreshing them is an observable side effect, not a correctness
/// requirement of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryScope {
    /// Course listing/detail views showing per-lesson completion.
    CourseCatalog,
    LessonProgress(LessonId),
    StudentPoints(StudentId),
    PointsHistory(StudentId),
}

/// Invalidation hook for the host application's query cache.
pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, scopes: &[QueryScope]);
}

/// Ignores every invalidation request.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullInvalidator;

impl CacheInvalidator for NullInvalidator {
    fn invalidate(&self, _scopes: &[QueryScope]) {}
}
