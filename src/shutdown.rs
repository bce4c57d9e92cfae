//! Cooperative shutdown for the replicator.
//!
//! A [`ShutdownToken`] is cloned into every long-running loop. Signal
//! handling lives in the binary; the library only observes the token.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{ReplicatorError, Result};

/// Cancellation flag shared between the signal handler and the listen loop.
#[derive(Clone)]
pub struct ShutdownToken {
    cancelled: Arc<AtomicBool>,
    watch_tx: Arc<watch::Sender<bool>>,
    watch_rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        let (watch_tx, watch_rx) = watch::channel(false);
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            watch_tx: Arc::new(watch_tx),
            watch_rx,
        }
    }

    /// Request shutdown. Idempotent.
    pub fn cancel(&self) {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("Shutdown requested");
            let _ = self.watch_tx.send(true);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.watch_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ShutdownToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl-C on non-unix targets).
#[cfg(unix)]
pub async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| ReplicatorError::Config(format!("Failed to install SIGTERM handler: {}", e)))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| ReplicatorError::Config(format!("Failed to install SIGINT handler: {}", e)))?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| ReplicatorError::Config(format!("Failed to listen for Ctrl-C: {}", e)))?;
    info!("Received Ctrl-C");
    Ok(())
}

/// Cancel `token` on the first signal, then resolve on the second.
///
/// The caller decides what a second signal means; the binary exits.
pub async fn cancel_on_signal<F, Fut>(token: &ShutdownToken, mut next_signal: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    next_signal().await?;
    token.cancel();
    next_signal().await?;
    warn!("Second signal received during shutdown");
    Ok(())
}
