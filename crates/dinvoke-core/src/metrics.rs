//! Metrics seam.
//!
//! Core code reports through [`MetricsBackend`]; every method has a no-op default so a backend
//! only overrides what it exports. The concrete Prometheus backend lives in `dinvoke-prometheus`.

use std::sync::Arc;
use std::time::Duration;

/// Sink for fabric metrics. Implementations must be cheap and non-blocking.
pub trait MetricsBackend: Send + Sync + 'static {
    /// A request was admitted and is about to be written to `machine`.
    fn invocation_started(&self, _machine: &str, _weight: u32) {}

    /// The result handle of a request to `machine` was completed.
    fn invocation_completed(&self, _machine: &str, _ok: bool) {}

    /// `machine` refused a request for lack of executors.
    fn invocation_rejected(&self, _machine: &str) {}

    fn capacity_changed(&self, _machine: &str, _busy: u32, _total: u32) {}

    /// A channel obtained a fresh socket to `peer`.
    fn reconnected(&self, _peer: &str) {}

    fn queue_depth(&self, _depth: usize) {}

    fn task_dispatched(&self, _machine: &str) {}

    /// Worker side: a handler for `kind` finished.
    fn task_executed(&self, _kind: &str, _ok: bool, _duration: Duration) {}
}

pub type MetricsHandle = Arc<dyn MetricsBackend>;

/// Backend that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsBackend for NoopMetrics {}

/// Returns a shared no-op backend.
pub fn noop() -> MetricsHandle {
    Arc::new(NoopMetrics)
}
