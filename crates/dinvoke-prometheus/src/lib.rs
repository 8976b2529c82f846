//! Prometheus metrics backend for the dinvoke fabric.
//!
//! [`PrometheusMetrics`] implements [`dinvoke_core::MetricsBackend`]; inject it through
//! [`dinvoke_core::RuntimeContext`] on both the controller and the worker.
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use dinvoke_core::RuntimeContext;
//! use dinvoke_prometheus::PrometheusMetrics;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let metrics = PrometheusMetrics::new()?;
//! let ctx = RuntimeContext::default().with_metrics(Arc::new(metrics.clone()));
//!
//! // Later, from whatever serves `/metrics`:
//! let body = metrics.encode_text()?;
//! # let _ = (ctx, body);
//! # Ok(())
//! # }
//! ```
//!
//! ## Metrics
//! - `dinvoke_invocations_started_total{machine}` - Counter
//! - `dinvoke_invocations_completed_total{machine, outcome}` - Counter
//! - `dinvoke_invocations_rejected_total{machine}` - Counter
//! - `dinvoke_executors_busy{machine}` - Gauge
//! - `dinvoke_executors_total{machine}` - Gauge
//! - `dinvoke_reconnects_total{peer}` - Counter
//! - `dinvoke_queue_depth` - Gauge
//! - `dinvoke_tasks_dispatched_total{machine}` - Counter
//! - `dinvoke_tasks_executed_total{kind, outcome}` - Counter
//! - `dinvoke_task_duration_seconds{kind}` - Histogram
//!
//! ## HTTP Server
//! This crate does NOT serve `/metrics`; expose [`PrometheusMetrics::gather`] or
//! [`PrometheusMetrics::encode_text`] from the application's own HTTP stack.

mod backend;
pub use backend::{MetricsError, PrometheusMetrics};

pub use prometheus::{Encoder, Registry, TextEncoder};
