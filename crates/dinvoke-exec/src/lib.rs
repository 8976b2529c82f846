//! Worker side of the fabric: accept a controller, run registered task handlers, reply.

mod error;
pub use error::{ExecError, ExecResult};

pub mod registry;
pub use registry::{FnHandler, TaskHandler, TaskRegistry, handler_fn, typed};

pub mod channel;
pub use channel::{Accept, WorkerChannel};

pub mod listener;
pub use listener::{ListenerConfig, WorkerListener, start_worker_listener};

pub mod prelude {
    pub use crate::error::{ExecError, ExecResult};
    pub use crate::{ListenerConfig, TaskRegistry, WorkerListener, handler_fn, typed};
}
