//! Shutdown signalling and in-flight request draining.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::forwarder::PendingTable;

/// Flag shared with every handler; flipped once, never reset.
#[derive(Clone)]
pub struct ShutdownSignal {
    is_shutting_down: Arc<AtomicBool>,
    notify: broadcast::Sender<()>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(1);
        Self {
            is_shutting_down: Arc::new(AtomicBool::new(false)),
            notify,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    pub fn initiate(&self) {
        self.is_shutting_down.store(true, Ordering::SeqCst);
        let _ = self.notify.send(());
        info!("shutdown initiated");
    }

    /// Completes once shutdown has been initiated. Used as the graceful
    /// shutdown future for the axum servers.
    pub async fn wait(&self) {
        if self.is_shutting_down() {
            return;
        }
        let mut rx = self.notify.subscribe();
        let _ = rx.recv().await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Block until Ctrl+C or SIGTERM, then flip the signal.
pub async fn wait_for_signal(signal: &ShutdownSignal) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C");
        }
        _ = terminate => {
            info!("received SIGTERM");
        }
    }

    signal.initiate();
}

/// Wait for the pending table to drain, bounded by `limit`. Returns whether
/// it emptied in time.
pub async fn drain_pendings(pendings: &PendingTable, limit: Duration) -> bool {
    let drain = async {
        loop {
            let remaining = pendings.len();
            if remaining == 0 {
                return;
            }
            debug!(remaining, "waiting for in-flight requests");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };

    match timeout(limit, drain).await {
        Ok(()) => true,
        Err(_) => {
            warn!(
                remaining = pendings.len(),
                "drain timeout reached with requests still in flight"
            );
            false
        }
    }
}
