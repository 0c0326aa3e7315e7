use std::sync::Arc;

use tokio::sync::watch::{Receiver, Sender};

/// Signals that the current batch should stop.
///
/// Cloning the handle is cheap and every clone triggers the same signal. Listeners created before
/// or after the signal is sent both observe it.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    sender: Arc<Sender<bool>>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self {
            sender: Arc::new(tokio::sync::watch::channel(false).0),
        }
    }

    pub fn shutdown(&self) {
        // `send_replace` succeeds even when no listener exists yet.
        let previous = self.sender.send_replace(true);
        if !previous {
            log::info!("Shutdown requested");
        }
    }

    pub fn new_listener(&self) -> ShutdownListener {
        ShutdownListener {
            receiver: self.sender.subscribe(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownListener {
    receiver: Receiver<bool>,
}

impl ShutdownListener {
    /// Point in time check of the shutdown signal.
    pub fn should_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait until the shutdown signal is sent.
    ///
    /// This is intended to be raced against other work with `tokio::select!` so that the other
    /// work is abandoned when a shutdown is requested. If the [ShutdownHandle] has been dropped
    /// without a shutdown being requested then this never completes.
    pub async fn wait_for_shutdown(&mut self) {
        if self.receiver.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
