use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::{TaskCall, Weight};

/// Clamp a caller-supplied weight to the valid range: anything `<= 0` becomes `1`.
pub fn normalize_weight(weight: i32) -> Weight {
    if weight <= 0 { 1 } else { weight as Weight }
}

/// A task waiting in the controller-side queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub id: Uuid,
    pub call: TaskCall,
    /// Executor slots required on the chosen worker. Always `>= 1`.
    #[serde(deserialize_with = "at_least_one")]
    weight: Weight,
    /// Optional label token a worker must match to be eligible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl QueuedTask {
    pub fn new(call: TaskCall) -> Self {
        Self {
            id: Uuid::new_v4(),
            call,
            weight: 1,
            label: None,
        }
    }

    /// Executor slots this task needs; never zero.
    #[inline]
    pub fn weight(&self) -> Weight {
        self.weight
    }

    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = normalize_weight(weight);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

fn at_least_one<'de, D: Deserializer<'de>>(d: D) -> Result<Weight, D::Error> {
    Ok(Weight::deserialize(d)?.max(1))
}
