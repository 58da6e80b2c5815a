//! Stop signal shared by the background loops.

use tokio::sync::watch;

/// Held by `main`; flipping it asks every [`Shutdown`] listener to stop.
pub struct ShutdownTrigger(watch::Sender<bool>);

/// Cloneable listener handed to each long-running task.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(tx), Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        // send_replace never fails, even with no listeners left.
        self.0.send_replace(true);
    }
}

impl Shutdown {
    /// Resolves once shutdown has been requested. If the trigger is dropped
    /// without firing this never resolves.
    pub async fn recv(&mut self) {
        let requested = self.rx.wait_for(|stop| *stop).await.is_ok();
        if !requested {
            std::future::pending::<()>().await;
        }
    }
}
