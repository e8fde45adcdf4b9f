//! Request-scoped cancellation built on a watch channel.
//!
//! The handler side keeps the [`CancelHandle`]; the execution side carries a
//! [`CancelScope`] inside the invocation. The handle is a pure drop guard:
//! when it goes away (the request future finished or was dropped), every
//! scope waiter wakes, so a child process can never outlive its request.

use tokio::sync::watch;

pub fn scope() -> (CancelHandle, CancelScope) {
    let (tx, rx) = watch::channel(());
    (CancelHandle { _tx: tx }, CancelScope { rx })
}

/// Keeps the scope alive; dropping it cancels.
#[derive(Debug)]
pub struct CancelHandle {
    _tx: watch::Sender<()>,
}

#[derive(Debug, Clone)]
pub struct CancelScope {
    rx: watch::Receiver<()>,
}

impl CancelScope {
    /// Resolves once the owning handle has been dropped.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while rx.changed().await.is_ok() {}
    }
}
