//! Worker main loop.
//!
//! Reads frames from the controller, runs each task call on its own tokio task and writes the
//! outcome back under the request's correlation id. Frames that are not task calls, or name a
//! kind nobody registered, are answered with a frame-level error. Malformed input is logged and
//! skipped. A reply that cannot be written because the channel is closed or interrupted stops
//! the loop.

use std::any::Any;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use dinvoke_core::{InvokeError, MetricsHandle, RuntimeContext};
use dinvoke_model::{CorrelationId, Frame, ModelError, Outcome, Payload, TaskCall, TransportError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{ExecError, TaskHandler, TaskRegistry, WorkerChannel};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Upper bound on concurrently running tasks. `None` spawns one task per request.
    ///
    /// When the bound is reached the loop stops reading until a task finishes.
    pub max_in_flight: Option<usize>,
}

/// Running worker listener. Dropping it stops the loop.
pub struct WorkerListener {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerListener {
    /// Bind `addr` and start serving with `registry`.
    pub async fn start(
        addr: SocketAddr,
        registry: TaskRegistry,
        config: ListenerConfig,
        ctx: &RuntimeContext,
    ) -> Result<Self, InvokeError> {
        let channel =
            Arc::new(WorkerChannel::bind(addr, ctx.channel.clone(), ctx.metrics.clone()).await?);
        let local_addr = channel.local_addr();
        let cancel = CancellationToken::new();

        info!(
            addr = %local_addr,
            kinds = ?registry.kinds(),
            max_in_flight = ?config.max_in_flight,
            "worker listening"
        );

        let server = Server {
            channel,
            registry,
            metrics: ctx.metrics.clone(),
            limit: config.max_in_flight.map(|n| Arc::new(Semaphore::new(n.max(1)))),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(server.serve());

        Ok(Self {
            local_addr,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Address actually bound; useful when binding port 0.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signal the loop and its running tasks to stop. Returns immediately.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// [`WorkerListener::close`] and wait for the loop to exit.
    pub async fn shutdown(&self) {
        self.close();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(addr = %self.local_addr, error = %e, "listener task did not exit cleanly");
        }
    }
}

impl Drop for WorkerListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start a listener on `bind:port` with default settings.
pub async fn start_worker_listener(
    bind: IpAddr,
    port: u16,
    registry: TaskRegistry,
) -> Result<WorkerListener, InvokeError> {
    WorkerListener::start(
        SocketAddr::new(bind, port),
        registry,
        ListenerConfig::default(),
        &RuntimeContext::default(),
    )
    .await
}

struct Server {
    channel: Arc<WorkerChannel>,
    registry: TaskRegistry,
    metrics: MetricsHandle,
    limit: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
}

impl Server {
    async fn serve(self) {
        loop {
            let value = match self.channel.read_value(&self.cancel).await {
                Ok(value) => value,
                Err(e) if e.is_recoverable() => {
                    error!(channel = %self.channel.name(), error = %e, "malformed frame skipped");
                    continue;
                }
                Err(InvokeError::Interrupted | InvokeError::Closed) => break,
                Err(e) => {
                    error!(channel = %self.channel.name(), error = %e, "read failed");
                    break;
                }
            };

            let (id, payload) = match Frame::decode(value) {
                Ok(frame) => frame.into_parts(),
                Err(ModelError::UnknownPayload { id, reason }) => {
                    error!(id = %id, reason = %reason, "frame with unknown payload");
                    if !self.reject(id, format!("unknown payload: {reason}")).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    error!(channel = %self.channel.name(), error = %e, "malformed frame skipped");
                    continue;
                }
            };

            let call = match payload {
                Payload::Call(call) => call,
                other => {
                    warn!(id = %id, payload = other.type_name(), "frame is not a task call");
                    let msg = format!("expected a task call, got {}", other.type_name());
                    if !self.reject(id, msg).await {
                        break;
                    }
                    continue;
                }
            };

            let Some(handler) = self.registry.get(&call.kind) else {
                warn!(id = %id, kind = %call.kind, "unknown task kind");
                let msg = ExecError::UnknownKind(call.kind).to_string();
                if !self.reject(id, msg).await {
                    break;
                }
                continue;
            };

            let permit = match &self.limit {
                None => None,
                Some(limit) => tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    permit = Arc::clone(limit).acquire_owned() => permit.ok(),
                },
            };

            debug!(id = %id, kind = %call.kind, "task accepted");
            tokio::spawn(execute(
                Arc::clone(&self.channel),
                handler,
                id,
                call,
                self.metrics.clone(),
                self.cancel.clone(),
                permit,
            ));
        }

        if let Err(e) = self.channel.close().await {
            error!(error = %e, "closing worker channel");
        }
        info!(channel = %self.channel.name(), "worker stopped");
    }

    /// Answer `id` with a frame-level error. Returns `false` if the loop must stop.
    async fn reject(&self, id: CorrelationId, message: String) -> bool {
        let reply = Frame::with_id(Payload::Error(TransportError::new(message)), id);
        deliver(&self.channel, &reply, &self.cancel).await
    }
}

async fn execute(
    channel: Arc<WorkerChannel>,
    handler: Arc<dyn TaskHandler>,
    id: CorrelationId,
    call: TaskCall,
    metrics: MetricsHandle,
    cancel: CancellationToken,
    _permit: Option<OwnedSemaphorePermit>,
) {
    let started = Instant::now();
    let TaskCall { kind, params } = call;

    // Run in a separate task so a panicking handler only takes itself down.
    let task_cancel = cancel.child_token();
    let outcome = match tokio::spawn(async move { handler.call(params, task_cancel).await }).await {
        Ok(Ok(value)) => Outcome::Ok(value),
        Ok(Err(e)) => Outcome::Err(e.to_string()),
        Err(e) if e.is_panic() => {
            Outcome::Err(ExecError::Panicked(panic_message(e.into_panic())).to_string())
        }
        Err(_) => Outcome::Err(ExecError::Cancelled.to_string()),
    };

    let elapsed = started.elapsed();
    metrics.task_executed(&kind, outcome.is_ok(), elapsed);
    match outcome.error() {
        None => debug!(id = %id, kind = %kind, elapsed_ms = elapsed.as_millis() as u64, "task succeeded"),
        Some(e) => warn!(id = %id, kind = %kind, error = %e, "task failed"),
    }

    let reply = Frame::with_id(Payload::Result(outcome), id);
    deliver(&channel, &reply, &cancel).await;
}

/// Write `reply`; a closed or interrupted channel cancels the listener. Returns whether it was written.
async fn deliver(channel: &WorkerChannel, reply: &Frame<Payload>, cancel: &CancellationToken) -> bool {
    match channel.write_frame(reply, cancel).await {
        Ok(()) => true,
        Err(e @ (InvokeError::Interrupted | InvokeError::Closed)) => {
            debug!(id = %reply.id(), error = %e, "reply dropped, stopping listener");
            cancel.cancel();
            false
        }
        Err(e) => {
            error!(id = %reply.id(), error = %e, "reply not written");
            true
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
