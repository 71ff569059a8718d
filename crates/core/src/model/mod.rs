mod ids;
mod points;
mod progress;

pub use ids::{LessonId, ParseIdError, StudentId};
pub use points::{
    ActionType, POINTS_PER_LEVEL, PointsAward, PointsError, PointsHistoryEntry,
    StudentPointsAggregate, level_for,
};
pub use progress::{ProgressPatch, ProgressRecord};
