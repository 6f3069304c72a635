//! Cooperative shutdown shared by the discovery and reconciler tasks.

use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Requests shutdown. Clone is cheap and shares state.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

/// Observes shutdown. Each task holds its own.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

/// Create a connected trigger/signal pair.
pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (
        ShutdownTrigger { tx: Arc::new(tx) },
        ShutdownSignal { rx },
    )
}

impl ShutdownTrigger {
    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl ShutdownSignal {
    /// Check if shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested (or every trigger is gone).
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep for `duration` unless shutdown arrives first. Returns `false`
    /// on shutdown.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_shutdown(),
            _ = self.wait() => false,
        }
    }
}

/// Trigger shutdown on SIGINT/SIGTERM.
#[cfg(unix)]
pub fn install_signal_handlers(trigger: ShutdownTrigger) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!("Received signal {}, shutting down...", sig);
            trigger.trigger();
        }
    });
    Ok(())
}

/// Trigger shutdown on Ctrl+C.
#[cfg(windows)]
pub fn install_signal_handlers(trigger: ShutdownTrigger) -> Result<()> {
    ctrlc::set_handler(move || {
        info!("Received Ctrl+C, shutting down...");
        trigger.trigger();
    })
    .map_err(|e| crate::error::RelayError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
}
