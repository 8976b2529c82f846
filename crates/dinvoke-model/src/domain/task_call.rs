use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::ModelError;

/// A task invocation: which registered handler to run and with what parameters.
///
/// `kind` is the stable tag the worker dispatches on; `params` is an arbitrary JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCall {
    pub kind: String,
    #[serde(default)]
    pub params: Value,
}

impl TaskCall {
    pub fn new(kind: impl Into<String>, params: Value) -> Self {
        Self {
            kind: kind.into(),
            params,
        }
    }

    /// Build a call from any serializable parameter type.
    pub fn with_params<T: Serialize>(kind: impl Into<String>, params: &T) -> Result<Self, ModelError> {
        let params =
            serde_json::to_value(params).map_err(|e| ModelError::InvalidValue(e.to_string()))?;
        Ok(Self::new(kind, params))
    }

    /// Deserialize the parameters into `T`.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, ModelError> {
        serde_json::from_value(self.params.clone())
            .map_err(|e| ModelError::InvalidValue(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sleep {
        millis: u64,
    }

    #[test]
    fn typed_params() {
        let call = TaskCall::with_params("sleep", &Sleep { millis: 100 }).unwrap();
        assert_eq!(call.params, json!({ "millis": 100 }));
        assert_eq!(call.params_as::<Sleep>().unwrap(), Sleep { millis: 100 });
    }

    #[test]
    fn missing_params_default_to_null() {
        let call: TaskCall = serde_json::from_value(json!({ "kind": "ping" })).unwrap();
        assert_eq!(call.kind, "ping");
        assert_eq!(call.params, Value::Null);
    }
}
