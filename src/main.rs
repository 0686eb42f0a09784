//! holdkey-daemon: detects hold gestures on a designated key
//!
//! The daemon runs a system-wide CGEventTap, feeds every keyboard event
//! through a hold-detector state machine, and broadcasts hold
//! notifications to IPC subscribers. A tap of the designated key is
//! replayed untouched; only a sustained, unmodified, un-chorded press is
//! consumed as a hold.

mod config;
mod detector;
mod events;
mod ipc;
mod lifecycle;
mod tap;

use anyhow::Result;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::events::DetectorEvent;
use crate::ipc::{DaemonStatus, Server};
use crate::lifecycle::ShutdownSignal;
use crate::tap::EventTap;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "holdkey-daemon starting"
    );

    // Load configuration
    let config = Config::load()?;
    config.ensure_dirs()?;
    info!(
        key = %config.key,
        hold_delay_ms = config.hold_delay.as_millis() as u64,
        "configuration loaded"
    );

    // Create shutdown signal handler
    let mut shutdown = ShutdownSignal::new()?;

    // Detector events fan out to the IPC server and the status sync loop
    let (event_tx, mut event_rx) = broadcast::channel::<DetectorEvent>(64);

    // Start the event tap (runs on a dedicated thread)
    let event_tap = EventTap::new(
        config.key_code,
        config.key.clone(),
        config.hold_delay,
        event_tx.clone(),
    );
    match event_tap.start() {
        Ok(()) => {
            info!("event tap started");
        }
        Err(e) => {
            error!(?e, "failed to start event tap");
            warn!("continuing without key interception - check Accessibility permissions");
        }
    }

    // Create IPC server with event fan-out to subscribers
    let status = DaemonStatus::new(&config.key, config.hold_delay.as_millis() as u64);
    let server = Server::new(&config.socket_path, status, event_tx.clone())?;
    server.set_tap_active(event_tap.is_running()).await;

    info!("daemon initialized, entering main loop");

    // Main event loop
    tokio::select! {
        // Run the IPC server (accepts client connections)
        result = server.run() => {
            if let Err(e) = result {
                error!(?e, "IPC server error");
            }
        }

        // Mirror detector events into the status the IPC server reports
        _ = async {
            loop {
                match event_rx.recv().await {
                    Ok(event) => {
                        info!(%event, "detector event");
                        server.apply_event(&event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "detector event receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        } => {
            info!("detector event loop exited");
        }

        // Wait for shutdown signal
        _ = shutdown.wait() => {
            info!("shutdown signal received");
        }
    }

    // Cleanup
    info!("shutting down...");

    event_tap.stop();
    server.shutdown().await;

    info!("holdkey-daemon stopped");

    Ok(())
}
