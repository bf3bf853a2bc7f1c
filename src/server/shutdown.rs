//! Graceful shutdown
//!
//! `main` waits for SIGTERM or SIGINT, marks the pod not ready and fires the
//! shutdown channel so the health server drains.

use tokio::sync::watch;
use tracing::{error, info};

/// Receiving side of the shutdown channel, cheap to clone
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolves once shutdown is triggered or the controller side is dropped
    pub async fn wait(&mut self) {
        while !*self.receiver.borrow() {
            if self.receiver.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }
}

pub struct ShutdownController {
    sender: watch::Sender<bool>,
}

impl ShutdownController {
    pub fn shutdown(&self) {
        let _ = self.sender.send(true);
        info!("Shutdown signal sent");
    }
}

pub fn shutdown_channel() -> (ShutdownController, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownController { sender }, ShutdownSignal { receiver })
}

/// Waits for SIGTERM or SIGINT and returns the signal name
///
/// When SIGTERM cannot be registered only SIGINT (Ctrl+C) is awaited.
#[cfg(unix)]
pub async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to register SIGTERM handler");
            return wait_for_ctrl_c().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
            "SIGTERM"
        }
        name = wait_for_ctrl_c() => name,
    }
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> &'static str {
    wait_for_ctrl_c().await
}

async fn wait_for_ctrl_c() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Received SIGINT");
            "SIGINT"
        }
        Err(e) => {
            error!(error = %e, "Failed to wait for SIGINT");
            std::future::pending().await
        }
    }
}
