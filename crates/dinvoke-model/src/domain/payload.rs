use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{ModelError, TaskCall};

/// Everything that can travel inside a [`crate::Frame`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Payload {
    /// Controller → worker: run this task.
    Call(TaskCall),
    /// Worker → controller: the task finished.
    Result(Outcome),
    /// Frame-level error, either direction.
    Error(TransportError),
}

impl Payload {
    /// Returns a short symbolic name of the variant, for logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::Call(_) => "call",
            Payload::Result(_) => "result",
            Payload::Error(_) => "error",
        }
    }
}

/// Result of a task as reported by the worker.
///
/// Keeps "the task returned null" (`Ok(Value::Null)`) apart from "the task failed".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    Ok(Value),
    Err(String),
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }

    /// Returns the produced value, if any.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Outcome::Ok(v) => Some(v),
            Outcome::Err(_) => None,
        }
    }

    /// Returns the failure message, if any.
    pub fn error(&self) -> Option<&str> {
        match self {
            Outcome::Ok(_) => None,
            Outcome::Err(msg) => Some(msg),
        }
    }

    pub fn into_result(self) -> Result<Value, String> {
        match self {
            Outcome::Ok(v) => Ok(v),
            Outcome::Err(msg) => Err(msg),
        }
    }

    /// Deserialize the produced value into `T`.
    ///
    /// A failed outcome maps to [`ModelError::TaskFailed`].
    pub fn decode<T: DeserializeOwned>(self) -> Result<T, ModelError> {
        match self {
            Outcome::Ok(v) => {
                serde_json::from_value(v).map_err(|e| ModelError::InvalidValue(e.to_string()))
            }
            Outcome::Err(msg) => Err(ModelError::TaskFailed(msg)),
        }
    }
}

/// Human-readable frame-level error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
