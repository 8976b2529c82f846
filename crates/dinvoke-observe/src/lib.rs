//! Logging setup shared by worker and controller binaries.

mod logger;
pub use logger::*;
