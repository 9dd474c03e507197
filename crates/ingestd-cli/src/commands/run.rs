//! Run command implementation.

use anyhow::Result;
use ingestd_core::{Config, IngestDaemon};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Why the daemon stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stopped {
    /// SIGINT (Ctrl+C)
    Interrupted,
    /// SIGTERM or the loop ended on its own
    Terminated,
}

/// Run the ingest daemon until SIGINT or SIGTERM.
pub async fn run(config: Config) -> Result<Stopped> {
    info!(
        topics = ?config.topic_names(),
        group = %config.kafka.group_id,
        repo = %config.butler.repo,
        "Starting ingest daemon"
    );

    let daemon = IngestDaemon::new(config)?;
    let shutdown_tx = daemon.shutdown_signal();
    let interrupted = Arc::new(AtomicBool::new(false));

    // Spawn a task to handle shutdown signals (SIGINT and SIGTERM)
    let shutdown_signal = shutdown_tx.clone();
    let interrupt_flag = interrupted.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    return;
                }
            };

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), finishing current batch");
                    interrupt_flag.store(true, Ordering::SeqCst);
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, finishing current batch");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, finishing current batch");
            interrupt_flag.store(true, Ordering::SeqCst);
        }

        let _ = shutdown_signal.send(());
    });

    daemon.run().await?;

    info!("Ingest daemon stopped");
    Ok(if interrupted.load(Ordering::SeqCst) {
        Stopped::Interrupted
    } else {
        Stopped::Terminated
    })
}
