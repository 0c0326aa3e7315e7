use spark_tunnel_core::prelude::ShutdownHandle;
use tokio::signal;

/// Trigger the returned handle when the user presses Ctrl-C.
pub(crate) fn start_shutdown_listener(runtime: &tokio::runtime::Runtime) -> ShutdownHandle {
    let handle = ShutdownHandle::default();

    let listener_handle = handle.clone();
    runtime.spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                println!("Received shutdown signal, tearing down the current deployment...");
                listener_handle.shutdown();
            }
            Err(e) => {
                log::error!("Failed to listen for Ctrl-C, the batch cannot be interrupted: {e}")
            }
        }
    });

    handle
}
