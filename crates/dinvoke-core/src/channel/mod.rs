mod auto;
pub use auto::{AutoReconnectingChannel, Reconnect};

mod controller;
pub use controller::{ControllerChannel, Dial};
