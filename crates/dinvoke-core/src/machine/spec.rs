use serde::{Deserialize, Serialize};

use crate::InvokeError;

/// Static description of a worker machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSpec {
    /// Unique name, used in logs and metrics.
    pub name: String,
    pub address: String,
    /// Kept signed so out-of-range input is reported rather than silently wrapped.
    pub port: i32,
    /// Declared number of executor slots.
    pub executors: u32,
    /// Label expression source, see [`dinvoke_model::LabelExpr`].
    #[serde(default)]
    pub labels: String,
}

impl MachineSpec {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: i32, executors: u32) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
            executors,
            labels: String::new(),
        }
    }

    pub fn with_labels(mut self, labels: impl Into<String>) -> Self {
        self.labels = labels.into();
        self
    }

    /// Check the fields and return the port as a `u16`.
    pub fn validate(&self) -> Result<u16, InvokeError> {
        if self.name.trim().is_empty() {
            return Err(InvokeError::InvalidSpec("machine name must not be empty".into()));
        }
        if self.address.trim().is_empty() {
            return Err(InvokeError::InvalidSpec(format!(
                "machine {} has an empty address",
                self.name
            )));
        }
        match u16::try_from(self.port) {
            Ok(port) if port != 0 => Ok(port),
            _ => Err(InvokeError::InvalidPort(self.port)),
        }
    }
}
