use thiserror::Error;

use crate::model::{ParseIdError, PointsError};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Points(#[from] PointsError),
    #[error(transparent)]
    ParseId(#[from] ParseIdError),
}
