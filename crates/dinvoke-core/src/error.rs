use thiserror::Error;

use dinvoke_model::ModelError;

/// Errors surfaced by the controller side of the fabric.
#[derive(Error, Debug)]
pub enum InvokeError {
    /// The machine cannot host a task of this weight right now. Nothing was reserved.
    #[error("not enough executors on {machine}: requested {requested}, available {available}")]
    NotEnoughExecutors {
        machine: String,
        requested: u32,
        available: u32,
    },
    /// The caller's cancellation token fired while the operation was blocked.
    #[error("interrupted")]
    Interrupted,
    /// The peer sent something this side cannot decode.
    #[error("classpath out of sync: {0}")]
    ClasspathOutOfSync(String),
    /// A decodable object arrived that is not a frame, or not one this side expects.
    #[error("unexpected result: {0}")]
    UnexpectedResult(String),
    /// Programmer error: double set, double close and friends.
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("invalid port: {0} (expected 1..=65535)")]
    InvalidPort(i32),
    #[error("invalid machine spec: {0}")]
    InvalidSpec(String),
    /// The channel was closed locally.
    #[error("channel closed")]
    Closed,
    /// The machine's reader task exited; the machine can no longer be used.
    #[error("machine {0} is dead")]
    MachineDead(String),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl InvokeError {
    /// Stable snake_case label, for logs and metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            InvokeError::NotEnoughExecutors { .. } => "not_enough_executors",
            InvokeError::Interrupted => "interrupted",
            InvokeError::ClasspathOutOfSync(_) => "classpath_out_of_sync",
            InvokeError::UnexpectedResult(_) => "unexpected_result",
            InvokeError::IllegalState(_) => "illegal_state",
            InvokeError::InvalidPort(_) => "invalid_port",
            InvokeError::InvalidSpec(_) => "invalid_spec",
            InvokeError::Closed => "closed",
            InvokeError::MachineDead(_) => "machine_dead",
            InvokeError::Encode(_) => "encode",
            InvokeError::Io(_) => "io",
        }
    }

    /// Returns `true` for protocol hiccups a reader loop should log and survive.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            InvokeError::ClasspathOutOfSync(_) | InvokeError::UnexpectedResult(_)
        )
    }
}

impl From<ModelError> for InvokeError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::NotAFrame(reason) => InvokeError::UnexpectedResult(reason),
            ModelError::UnknownPayload { id, reason } => {
                InvokeError::ClasspathOutOfSync(format!("frame {id}: {reason}"))
            }
            other => InvokeError::UnexpectedResult(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_stable() {
        let e = InvokeError::NotEnoughExecutors {
            machine: "m".into(),
            requested: 10,
            available: 1,
        };
        assert_eq!(e.as_label(), "not_enough_executors");
        assert_eq!(
            e.to_string(),
            "not enough executors on m: requested 10, available 1"
        );
        assert_eq!(InvokeError::Interrupted.as_label(), "interrupted");
    }

    #[test]
    fn model_errors_map_to_protocol_errors() {
        let e: InvokeError = ModelError::NotAFrame("x".into()).into();
        assert!(matches!(e, InvokeError::UnexpectedResult(_)));
        assert!(e.is_recoverable());

        let e: InvokeError = ModelError::UnknownPayload {
            id: "a".into(),
            reason: "r".into(),
        }
        .into();
        assert!(matches!(e, InvokeError::ClasspathOutOfSync(_)));
        assert!(!InvokeError::Closed.is_recoverable());
    }
}
