use std::time::Duration;

use dinvoke_core::MetricsBackend;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder, proto::MetricFamily,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus: {0}")]
    Prometheus(#[from] prometheus::Error),
    #[error("metrics text is not utf-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// Prometheus-backed [`MetricsBackend`]. Clones share the same collectors and registry.
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    invocations_started: IntCounterVec,
    invocations_completed: IntCounterVec,
    invocations_rejected: IntCounterVec,
    executors_busy: IntGaugeVec,
    executors_total: IntGaugeVec,
    reconnects: IntCounterVec,
    queue_depth: IntGauge,
    tasks_dispatched: IntCounterVec,
    tasks_executed: IntCounterVec,
    task_duration: HistogramVec,
}

impl PrometheusMetrics {
    /// Create the collectors in a fresh registry.
    pub fn new() -> Result<Self, MetricsError> {
        Self::with_registry(Registry::new())
    }

    /// Create the collectors in `registry`, e.g. one shared with other application metrics.
    pub fn with_registry(registry: Registry) -> Result<Self, MetricsError> {
        let invocations_started = IntCounterVec::new(
            Opts::new("dinvoke_invocations_started_total", "Requests admitted and sent to a machine"),
            &["machine"],
        )?;
        let invocations_completed = IntCounterVec::new(
            Opts::new("dinvoke_invocations_completed_total", "Requests whose result handle completed"),
            &["machine", "outcome"],
        )?;
        let invocations_rejected = IntCounterVec::new(
            Opts::new("dinvoke_invocations_rejected_total", "Requests refused for lack of executors"),
            &["machine"],
        )?;
        let executors_busy = IntGaugeVec::new(
            Opts::new("dinvoke_executors_busy", "Executor slots currently reserved"),
            &["machine"],
        )?;
        let executors_total = IntGaugeVec::new(
            Opts::new("dinvoke_executors_total", "Declared executor slots"),
            &["machine"],
        )?;
        let reconnects = IntCounterVec::new(
            Opts::new("dinvoke_reconnects_total", "Sockets (re)established by channels"),
            &["peer"],
        )?;
        let queue_depth = IntGauge::new("dinvoke_queue_depth", "Tasks waiting in the controller queue")?;
        let tasks_dispatched = IntCounterVec::new(
            Opts::new("dinvoke_tasks_dispatched_total", "Queued tasks handed to a machine"),
            &["machine"],
        )?;
        let tasks_executed = IntCounterVec::new(
            Opts::new("dinvoke_tasks_executed_total", "Tasks run by this worker"),
            &["kind", "outcome"],
        )?;
        let task_duration = HistogramVec::new(
            HistogramOpts::new("dinvoke_task_duration_seconds", "Task handler run time")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
            &["kind"],
        )?;

        registry.register(Box::new(invocations_started.clone()))?;
        registry.register(Box::new(invocations_completed.clone()))?;
        registry.register(Box::new(invocations_rejected.clone()))?;
        registry.register(Box::new(executors_busy.clone()))?;
        registry.register(Box::new(executors_total.clone()))?;
        registry.register(Box::new(reconnects.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(tasks_dispatched.clone()))?;
        registry.register(Box::new(tasks_executed.clone()))?;
        registry.register(Box::new(task_duration.clone()))?;

        Ok(Self {
            registry,
            invocations_started,
            invocations_completed,
            invocations_rejected,
            executors_busy,
            executors_total,
            reconnects,
            queue_depth,
            tasks_dispatched,
            tasks_executed,
            task_duration,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

fn outcome(ok: bool) -> &'static str {
    if ok { "ok" } else { "err" }
}

impl MetricsBackend for PrometheusMetrics {
    fn invocation_started(&self, machine: &str, _weight: u32) {
        self.invocations_started.with_label_values(&[machine]).inc();
    }

    fn invocation_completed(&self, machine: &str, ok: bool) {
        self.invocations_completed
            .with_label_values(&[machine, outcome(ok)])
            .inc();
    }

    fn invocation_rejected(&self, machine: &str) {
        self.invocations_rejected.with_label_values(&[machine]).inc();
    }

    fn capacity_changed(&self, machine: &str, busy: u32, total: u32) {
        self.executors_busy
            .with_label_values(&[machine])
            .set(i64::from(busy));
        self.executors_total
            .with_label_values(&[machine])
            .set(i64::from(total));
    }

    fn reconnected(&self, peer: &str) {
        self.reconnects.with_label_values(&[peer]).inc();
    }

    fn queue_depth(&self, depth: usize) {
        self.queue_depth.set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    fn task_dispatched(&self, machine: &str) {
        self.tasks_dispatched.with_label_values(&[machine]).inc();
    }

    fn task_executed(&self, kind: &str, ok: bool, duration: Duration) {
        self.tasks_executed
            .with_label_values(&[kind, outcome(ok)])
            .inc();
        self.task_duration
            .with_label_values(&[kind])
            .observe(duration.as_secs_f64());
    }
}
