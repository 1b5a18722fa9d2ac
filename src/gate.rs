//! Visibility gate: suspends reconnect work while nobody is observing.

use std::sync::Arc;
use tokio::sync::watch;

/// Environment-facing half. Clone freely; flip the observed flag from UI
/// or lifecycle hooks.
#[derive(Debug, Clone)]
pub struct VisibilityHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl VisibilityHandle {
    pub fn set_observed(&self, observed: bool) {
        let _ = self.tx.send(observed);
    }

    pub fn is_observed(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Supervisor-facing half; owned by a single reconnect loop.
#[derive(Debug)]
pub struct VisibilityGate {
    rx: watch::Receiver<bool>,
}

pub fn visibility_gate(initially_observed: bool) -> (VisibilityHandle, VisibilityGate) {
    let (tx, rx) = watch::channel(initially_observed);
    (
        VisibilityHandle { tx: Arc::new(tx) },
        VisibilityGate { rx },
    )
}

impl VisibilityGate {
    pub fn is_open(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the gate is open. A dropped handle counts as open so
    /// the loop can never deadlock waiting on an abandoned gate.
    pub async fn wait_open(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Resolves once the gate closes; pends forever after the handle is
    /// dropped (an abandoned gate can never close again).
    pub async fn wait_closed(&mut self) {
        loop {
            if !*self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                futures_util::future::pending::<()>().await;
            }
        }
    }
}
