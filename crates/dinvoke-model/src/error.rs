use thiserror::Error;

use crate::CorrelationId;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("object is not a frame: {0}")]
    NotAFrame(String),

    #[error("frame {id} carries an unknown payload: {reason}")]
    UnknownPayload { id: CorrelationId, reason: String },

    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),
}
