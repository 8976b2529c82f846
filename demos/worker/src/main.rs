use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::{debug, info};

use dinvoke_core::{RuntimeContext, install_shutdown_handler};
use dinvoke_exec::{ExecError, ListenerConfig, TaskRegistry, WorkerListener, handler_fn, typed};
use dinvoke_observe::{LoggerConfig, logger_init};
use dinvoke_prometheus::PrometheusMetrics;

#[derive(Deserialize)]
struct Add {
    a: i64,
    b: i64,
}

fn registry() -> TaskRegistry {
    let registry = TaskRegistry::new();
    registry
        .register(
            "echo",
            handler_fn(|params, _cancel| async move { Ok::<_, ExecError>(params) }),
        )
        .register(
            "add",
            typed(|p: Add, _cancel| async move { Ok::<_, ExecError>(p.a + p.b) }),
        )
        .register(
            "sleep",
            typed(|millis: u64, cancel| async move {
                tokio::select! {
                    _ = cancel.cancelled() => Err(ExecError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_millis(millis)) => Ok(millis),
                }
            }),
        );
    registry
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1) Logger
    logger_init(&LoggerConfig::default())?;

    // 2) Metrics
    let metrics = PrometheusMetrics::new()?;
    let ctx = RuntimeContext::default().with_metrics(Arc::new(metrics.clone()));

    // 3) Listener
    let bind: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9191".to_string())
        .parse()
        .context("bind address must look like 127.0.0.1:9191")?;
    let listener = WorkerListener::start(bind, registry(), ListenerConfig::default(), &ctx).await?;
    info!(addr = %listener.local_addr(), "worker ready, press Ctrl+C to stop");

    // 4) Wait for a signal
    let shutdown = install_shutdown_handler()?;
    shutdown.cancelled().await;

    listener.shutdown().await;
    debug!(metrics = %metrics.encode_text()?, "final metrics");
    info!("worker stopped");
    Ok(())
}
