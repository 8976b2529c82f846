//! Wire and domain types shared by the controller and worker sides.
//!
//! Everything here is plain data: frames travelling over the channel, task invocations, their
//! outcomes, queued work units and label expressions.

mod domain;
pub use domain::*;

mod label;
pub use label::LabelExpr;

mod error;
pub use error::ModelError;
