//! Cooperative cancellation of walks and crawls.

use tokio::sync::watch;

/// Create a connected trigger and signal.
pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

/// Fires a [`ShutdownSignal`].
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Cancel everything listening on the paired signals.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// A new signal paired with this trigger.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observes a [`ShutdownTrigger`].
///
/// Dropping the trigger without firing it leaves the signal pending forever.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        ShutdownSignal { rx }
    }

    /// Whether the trigger has fired.
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the trigger fires.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let fired = rx.wait_for(|fired| *fired).await.is_ok();
        if !fired {
            // Trigger dropped without firing.
            std::future::pending::<()>().await;
        }
    }
}
