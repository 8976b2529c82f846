use dinvoke_core::InvokeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("unknown task kind: {0}")]
    UnknownKind(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("task failed: {0}")]
    Failed(String),
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Invoke(#[from] InvokeError),
}

impl ExecError {
    /// Convenience constructor for handler bodies.
    pub fn failed(msg: impl std::fmt::Display) -> Self {
        ExecError::Failed(msg.to_string())
    }
}

impl From<std::io::Error> for ExecError {
    fn from(e: std::io::Error) -> Self {
        ExecError::Invoke(InvokeError::Io(e))
    }
}

pub type ExecResult<T> = Result<T, ExecError>;
