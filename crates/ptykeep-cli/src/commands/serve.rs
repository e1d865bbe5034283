//! `ptykeep serve` / `ptykeep sweep`: session garbage collection.

use super::print_json;
use anyhow::Result;
use ptykeep_server::SessionBinder;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Run the GC loop until SIGINT/SIGTERM.
///
/// Only records are swept. Processes belong to the `ptykeep run` that
/// spawned them, which stops its process once the record leaves the open
/// states.
pub async fn run_serve(binder: Arc<SessionBinder>) -> Result<()> {
    let interval = binder.lifecycle().config().gc.interval;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        interval_secs = interval.num_seconds(),
        "starting ptykeep gc"
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let gc = binder.lifecycle().clone().spawn_gc(shutdown_rx);

    shutdown_signal().await;
    info!("received shutdown signal");
    let _ = shutdown_tx.send(());
    if let Err(e) = gc.await {
        warn!(error = %e, "gc task ended abnormally");
    }
    info!("ptykeep gc stopped");
    Ok(())
}

/// One sweep, printed.
pub fn run_sweep(binder: &SessionBinder, json: bool) -> Result<()> {
    let report = binder.lifecycle().cleanup()?;
    if json {
        return print_json(&report);
    }
    println!(
        "detached (idle): {}\nterminated (detached ttl): {}\nterminated (max lifetime): {}\narchived: {}",
        report.detached_idle, report.terminated_detached, report.terminated_lifetime, report.archived
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
