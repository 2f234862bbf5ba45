//! Ctrl+C handling for the pipeline
//!
//! # Design Principles (KISS)
//! - Single function to setup Ctrl+C handler with broadcast channel
//! - Returns (sender, receiver) so callers can also trigger shutdown

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Shutdown signal type (unit type, just signals "shutdown now")
pub type ShutdownSignal = ();

pub type ShutdownSender = broadcast::Sender<ShutdownSignal>;
pub type ShutdownReceiver = broadcast::Receiver<ShutdownSignal>;

/// Broadcast channel fired on Ctrl+C
///
/// ```ignore
/// let (_shutdown_tx, shutdown_rx) = setup_shutdown();
/// pipeline.run(source, shutdown_rx).await?;
/// ```
pub fn setup_shutdown() -> (ShutdownSender, ShutdownReceiver) {
    let (tx, rx) = broadcast::channel::<ShutdownSignal>(1);

    let tx_clone = tx.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl+C received, initiating shutdown");
                let _ = tx_clone.send(());
            }
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl+C"),
        }
    });

    (tx, rx)
}
