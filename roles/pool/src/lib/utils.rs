use tokio::sync::broadcast;

/// Broadcast to every long-running task when the pool stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMessage {
    ShutdownAll,
}

/// Resolves once a shutdown has been broadcast or every sender is gone.
pub async fn wait_for_shutdown(receiver: &mut broadcast::Receiver<ShutdownMessage>) {
    loop {
        match receiver.recv().await {
            Ok(ShutdownMessage::ShutdownAll) | Err(broadcast::error::RecvError::Closed) => return,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
        }
    }
}
