//! Shared fixtures: a worker with a handful of demo handlers on a loopback port.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dinvoke_core::{ChannelConfig, MachineSpec, RemoteMachine, RuntimeContext};
use dinvoke_exec::{ExecError, ListenerConfig, TaskRegistry, WorkerListener, handler_fn, typed};
use serde_json::Value;

pub struct Worker {
    pub listener: WorkerListener,
    pub executed: Arc<AtomicUsize>,
}

impl Worker {
    pub fn port(&self) -> i32 {
        self.listener.local_addr().port() as i32
    }

    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }
}

pub fn ctx() -> RuntimeContext {
    RuntimeContext::default().with_channel(ChannelConfig {
        retry_delay_ms: 20,
        ..Default::default()
    })
}

pub fn registry(executed: Arc<AtomicUsize>) -> TaskRegistry {
    let registry = TaskRegistry::new();

    let count = executed.clone();
    registry.register(
        "echo",
        handler_fn(move |params: Value, _cancel| {
            count.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, ExecError>(params) }
        }),
    );

    let count = executed.clone();
    registry.register(
        "sleep",
        typed(move |millis: u64, cancel| {
            count.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => Err(ExecError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_millis(millis)) => Ok(millis),
                }
            }
        }),
    );

    registry.register(
        "fail",
        handler_fn(|_params, _cancel| async move { Err::<Value, _>(ExecError::failed("boom")) }),
    );

    registry.register(
        "panic",
        handler_fn(|_params, _cancel| async move {
            if true {
                panic!("handler exploded");
            }
            Ok::<Value, ExecError>(Value::Null)
        }),
    );

    registry
}

pub async fn start_worker(config: ListenerConfig) -> Worker {
    let executed = Arc::new(AtomicUsize::new(0));
    let listener = WorkerListener::start(
        "127.0.0.1:0".parse().unwrap(),
        registry(executed.clone()),
        config,
        &ctx(),
    )
    .await
    .unwrap();
    Worker { listener, executed }
}

pub async fn machine(worker: &Worker, name: &str, executors: u32, labels: &str) -> Arc<RemoteMachine> {
    let spec = MachineSpec::new(name, "127.0.0.1", worker.port(), executors).with_labels(labels);
    RemoteMachine::connect(spec, &ctx()).await.unwrap()
}
