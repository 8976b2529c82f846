mod correlation_id;
pub use correlation_id::CorrelationId;

mod frame;
pub use frame::Frame;

mod payload;
pub use payload::{Outcome, Payload, TransportError};

mod task_call;
pub use task_call::TaskCall;

mod queued_task;
pub use queued_task::{QueuedTask, normalize_weight};

/// Number of executor slots a task occupies on the worker while it runs.
pub type Weight = u32;
