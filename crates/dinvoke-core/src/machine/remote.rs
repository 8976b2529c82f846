use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use dinvoke_model::{LabelExpr, Outcome, TaskCall, normalize_weight};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::Machine;
use super::capacity::Capacity;
use crate::{ControllerChannel, InvokeError, MachineSpec, ResultHandle, RuntimeContext};

/// Handle to one worker: its channel, its reader task and its executor accounting.
///
/// The reader task runs until [`RemoteMachine::close`], drop, or a fatal channel error.
/// When it exits the machine is dead: outstanding requests complete with an error outcome
/// and further invocations fail with [`InvokeError::MachineDead`].
pub struct RemoteMachine {
    spec: MachineSpec,
    port: u16,
    labels: LabelExpr,
    capacity: Arc<Capacity>,
    channel: Arc<ControllerChannel>,
    alive: Arc<AtomicBool>,
    reader_cancel: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteMachine {
    /// Validate `spec`, connect to the worker and start the reader task.
    #[instrument(level = "debug", skip(spec, ctx), fields(machine = %spec.name))]
    pub async fn connect(spec: MachineSpec, ctx: &RuntimeContext) -> Result<Arc<Self>, InvokeError> {
        let port = spec.validate()?;
        let channel =
            Arc::new(ControllerChannel::connect(&spec.name, &spec.address, port, ctx).await?);

        let alive = Arc::new(AtomicBool::new(true));
        let reader_cancel = CancellationToken::new();
        let reader = tokio::spawn(read_loop(
            Arc::clone(&channel),
            Arc::clone(&alive),
            reader_cancel.clone(),
        ));

        info!(
            machine = %spec.name,
            peer = %channel.peer(),
            executors = spec.executors,
            labels = %spec.labels,
            "machine connected"
        );

        Ok(Arc::new(Self {
            labels: LabelExpr::parse(&spec.labels),
            capacity: Capacity::new(&spec.name, spec.executors, ctx.metrics.clone()),
            port,
            spec,
            channel,
            alive,
            reader_cancel,
            reader: Mutex::new(Some(reader)),
        }))
    }

    pub fn spec(&self) -> &MachineSpec {
        &self.spec
    }

    /// Requests sent and not yet answered.
    pub fn pending_requests(&self) -> usize {
        self.channel.pending_len()
    }

    /// Stop the reader task and close the channel. Safe to call more than once.
    pub async fn close(&self) {
        self.reader_cancel.cancel();
        self.channel.close().await;

        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            if let Err(e) = reader.await {
                warn!(machine = %self.spec.name, error = %e, "reader task did not exit cleanly");
            }
            info!(machine = %self.spec.name, "machine closed");
        }
    }
}

impl Drop for RemoteMachine {
    fn drop(&mut self) {
        self.reader_cancel.cancel();
    }
}

#[async_trait]
impl Machine for RemoteMachine {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn address(&self) -> &str {
        &self.spec.address
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn labels(&self) -> &LabelExpr {
        &self.labels
    }

    fn total_executors(&self) -> u32 {
        self.capacity.total()
    }

    fn busy_executors(&self) -> u32 {
        self.capacity.busy()
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    async fn invoke_async(
        &self,
        call: TaskCall,
        weight: i32,
        cancel: &CancellationToken,
    ) -> Result<ResultHandle<Outcome>, InvokeError> {
        if !self.is_alive() {
            return Err(InvokeError::MachineDead(self.spec.name.clone()));
        }

        let weight = normalize_weight(weight);
        let metrics = self.capacity.metrics();
        let reservation = self.capacity.reserve(weight).map_err(|available| {
            metrics.invocation_rejected(&self.spec.name);
            InvokeError::NotEnoughExecutors {
                machine: self.spec.name.clone(),
                requested: weight,
                available,
            }
        })?;

        let kind = call.kind.clone();

        // Dropping the reservation on error hands the slots back.
        let handle = self.channel.write_request(call, cancel).await?;
        metrics.invocation_started(&self.spec.name, weight);

        let (capacity, weight) = reservation.detach();
        handle.register_callback(move |outcome: &Outcome| {
            capacity.release(weight);
            capacity
                .metrics()
                .invocation_completed(capacity.machine(), outcome.is_ok());
        });

        debug!(machine = %self.spec.name, kind = %kind, weight, "task invoked");
        Ok(handle)
    }
}

async fn read_loop(
    channel: Arc<ControllerChannel>,
    alive: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let machine = channel.name().to_string();
    debug!(machine = %machine, "reader started");

    loop {
        match channel.read_response(&cancel).await {
            Ok(()) => {}
            Err(e) if e.is_recoverable() => {
                error!(machine = %machine, error = %e, kind = e.as_label(), "bad frame from worker");
            }
            Err(InvokeError::Interrupted | InvokeError::Closed) => {
                debug!(machine = %machine, "reader stopped");
                break;
            }
            Err(e) => {
                error!(machine = %machine, error = %e, "reader failed");
                break;
            }
        }
    }

    alive.store(false, Ordering::Release);
    channel.close().await;

    let drained = channel.drain_pending(&format!("connection to {machine} lost"));
    if drained > 0 {
        warn!(machine = %machine, drained, "outstanding requests failed");
    }
}

/// Connect to a worker with default runtime settings.
pub async fn connect_to_machine(
    name: impl Into<String>,
    address: impl Into<String>,
    port: i32,
    executors: u32,
    labels: &str,
) -> Result<Arc<RemoteMachine>, InvokeError> {
    let spec = MachineSpec::new(name, address, port, executors).with_labels(labels);
    RemoteMachine::connect(spec, &RuntimeContext::default()).await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;
    use crate::MetricsBackend;

    #[tokio::test]
    async fn rejects_invalid_port_before_connecting() {
        for port in [0, -5, 70_000] {
            let err = connect_to_machine("m", "127.0.0.1", port, 1, "").await.err();
            assert!(matches!(err, Some(InvokeError::InvalidPort(p)) if p == port));
        }
    }

    #[tokio::test]
    async fn oversized_weight_reserves_nothing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port() as i32;
        let m = connect_to_machine("m", "127.0.0.1", port, 2, "gpu !arm").await.unwrap();
        let cancel = CancellationToken::new();

        let err = m
            .invoke_async(TaskCall::new("echo", json!(null)), 10, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InvokeError::NotEnoughExecutors { requested: 10, available: 2, .. }
        ));
        assert_eq!(m.available_executors(), 2);
        assert!(m.labels().matches("gpu"));
        assert!(!m.labels().matches("arm"));

        m.close().await;
    }

    #[derive(Default)]
    struct Counting {
        started: AtomicUsize,
        completed: AtomicUsize,
    }

    impl MetricsBackend for Counting {
        fn invocation_started(&self, _machine: &str, _weight: u32) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn invocation_completed(&self, _machine: &str, _ok: bool) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn unsent_request_is_not_counted_as_started() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port() as i32;
        let counting = Arc::new(Counting::default());
        let ctx = RuntimeContext::default().with_metrics(counting.clone());
        let m = RemoteMachine::connect(MachineSpec::new("m", "127.0.0.1", port, 1), &ctx)
            .await
            .unwrap();
        let _peer = listener.accept().await.unwrap();

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let err = m
            .invoke_async(TaskCall::new("echo", json!(null)), 1, &cancelled)
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Interrupted));
        assert_eq!(m.available_executors(), 1);
        assert_eq!(m.pending_requests(), 0);

        let h = m
            .invoke_async(TaskCall::new("echo", json!(null)), 1, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(counting.started.load(Ordering::SeqCst), 1);

        m.close().await;
        assert!(h.is_set());
        assert_eq!(counting.completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_fails_outstanding_requests_and_kills_machine() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port() as i32;
        let m = connect_to_machine("m", "127.0.0.1", port, 2, "").await.unwrap();
        let _peer = listener.accept().await.unwrap();
        let cancel = CancellationToken::new();

        let h = m
            .invoke_async(TaskCall::new("sleep", json!(1000)), 0, &cancel)
            .await
            .unwrap();
        assert_eq!(m.busy_executors(), 1);

        m.close().await;
        m.close().await;

        let out = tokio::time::timeout(Duration::from_secs(1), h.wait_for_result(&cancel))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out, Outcome::Err("connection to m lost".into()));
        assert_eq!(m.available_executors(), 2);
        assert!(!m.is_alive());

        let err = m
            .invoke_async(TaskCall::new("echo", json!(null)), 1, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::MachineDead(_)));
    }
}
