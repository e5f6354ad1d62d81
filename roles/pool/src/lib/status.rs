//! Status messages sent from pool components to the main loop.
//!
//! Components report a fatal condition by sending a [`Status`] on the shared
//! `async_channel`; the main loop in [`PoolWorker::start`](crate::PoolWorker::start)
//! reacts by broadcasting a shutdown.

use tracing::error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    /// The node stopped delivering templates.
    TemplateListenerShutdown(String),
    /// The stratum listener stopped accepting connections.
    StratumServerShutdown(String),
    /// A cashier loop hit an unrecoverable storage failure.
    CashierShutdown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub state: State,
}

/// Send a status update, logging if the main loop is already gone.
pub async fn send_status(sender: &async_channel::Sender<Status>, state: State) {
    if let Err(e) = sender.send(Status { state }).await {
        error!("Failed to send status update: {e}");
    }
}
