pub mod error;
pub use error::InvokeError;

pub mod config;
pub use config::{ChannelConfig, QueueConfig, RejectionPolicy};

pub mod context;
pub use context::RuntimeContext;

pub mod metrics;
pub use metrics::{MetricsBackend, MetricsHandle, NoopMetrics};

pub mod handle;
pub use handle::ResultHandle;

pub mod channel;
pub use channel::{AutoReconnectingChannel, ControllerChannel, Dial, Reconnect};

pub mod machine;
pub use machine::{Machine, MachineSpec, RemoteMachine, connect_to_machine};

pub mod queue;
pub use queue::{
    AdmissionRule, AllOf, CapacityRule, DispatchReport, DispatchRule, LabelRule, TaskQueue,
    TaskQueueBuilder,
};

pub mod shutdown;
pub use shutdown::install_shutdown_handler;
