use campus_core::model::StudentId;

use crate::error::TrackerError;

/// Identity resolved by the host application's auth layer.
///
/// The pipeline never authenticates anyone itself; it only refuses to run
/// without a resolved student.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuthContext {
    student: Option<StudentId>,
}

impl AuthContext {
    #[must_use]
    pub fn authenticated(student: StudentId) -> Self {
        Self {
            student: Some(student),
        }
    }

    #[must_use]
    pub fn anonymous() -> Self {
        Self { student: None }
    }

    /// The authenticated student.
    ///
    /// # Errors
    ///
    /// Returns `TrackerError::NotAuthenticated` when no student is resolved.
    /// This is a precondition failure and is never retried.
    pub fn current_student(&self) -> Result<StudentId, TrackerError> {
        self.student.ok_or(TrackerError::NotAuthenticated)
    }
}
