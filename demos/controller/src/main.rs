use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use tracing::{info, warn};

use dinvoke_core::{
    AllOf, CapacityRule, LabelRule, Machine, MachineSpec, QueueConfig, RemoteMachine,
    RuntimeContext, TaskQueue, install_shutdown_handler,
};
use dinvoke_model::{QueuedTask, TaskCall};
use dinvoke_observe::{LoggerConfig, logger_init};
use dinvoke_prometheus::PrometheusMetrics;

/// `name=host:port/executors[/labels]`, e.g. `w1=127.0.0.1:9191/2/linux gpu`.
fn parse_machine(arg: &str) -> anyhow::Result<MachineSpec> {
    let (name, rest) = arg.split_once('=').context("expected name=host:port/executors")?;
    let mut parts = rest.splitn(3, '/');
    let addr = parts.next().context("missing host:port")?;
    let executors = parts
        .next()
        .context("missing executor count")?
        .parse()
        .context("executor count must be a number")?;
    let labels = parts.next().unwrap_or_default();

    let (host, port) = addr.rsplit_once(':').context("expected host:port")?;
    let port = port.parse().context("port must be a number")?;
    Ok(MachineSpec::new(name, host, port, executors).with_labels(labels))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1) Logger
    logger_init(&LoggerConfig::default())?;

    // 2) Metrics
    let metrics = PrometheusMetrics::new()?;
    let ctx = RuntimeContext::default().with_metrics(Arc::new(metrics.clone()));

    // 3) Machines
    let mut specs = std::env::args()
        .skip(1)
        .map(|arg| parse_machine(&arg))
        .collect::<anyhow::Result<Vec<_>>>()?;
    if specs.is_empty() {
        specs.push(MachineSpec::new("local", "127.0.0.1", 9191, 2));
    }

    let mut machines: Vec<Arc<dyn Machine>> = Vec::new();
    let mut remotes = Vec::new();
    for spec in specs {
        let machine = RemoteMachine::connect(spec, &ctx).await?;
        remotes.push(Arc::clone(&machine));
        machines.push(machine);
    }

    let shutdown = install_shutdown_handler()?;

    // 4) One direct call
    let first = &machines[0];
    let out = first
        .invoke(TaskCall::new("echo", json!("Hello There")), 1, &shutdown)
        .await?;
    info!(machine = %first.name(), outcome = ?out, "direct invoke");

    // 5) Queue a batch
    let queue = Arc::new(
        TaskQueue::builder()
            .machines(machines.clone())
            .dispatch_rule(AllOf::new().with(CapacityRule).with(LabelRule))
            .config(QueueConfig {
                idle_interval_ms: 1_000,
                ..Default::default()
            })
            .metrics(ctx.metrics.clone())
            .build()?,
    );
    for i in 0..10u64 {
        queue.enqueue(QueuedTask::new(TaskCall::new("sleep", json!(100 + i * 50))));
    }
    queue.enqueue(QueuedTask::new(TaskCall::new("add", json!({ "a": 2, "b": 40 }))));

    let runner = {
        let queue = Arc::clone(&queue);
        let cancel = shutdown.child_token();
        tokio::spawn(async move { queue.run(cancel).await })
    };

    info!("controller running, press Ctrl+C to stop");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(5)) => {
                let busy: u32 = machines.iter().map(|m| m.busy_executors()).sum();
                info!(queued = queue.len(), busy, "status");
            }
        }
    }

    if let Err(e) = runner.await {
        warn!(error = %e, "queue loop did not exit cleanly");
    }
    for machine in remotes {
        machine.close().await;
    }
    info!(metrics = %metrics.encode_text()?, "controller stopped");
    Ok(())
}
