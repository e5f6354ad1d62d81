//! Per-connection miner state.
//!
//! A [`MiningSession`] is shared between the connection's read loop, its writer task and
//! the [`ClientRegistry`](crate::client_registry::ClientRegistry). Outbound messages go
//! through an unbounded channel drained by the writer task, so enqueueing never blocks
//! and messages reach the socket in the order they were sent.

use std::{
    fmt,
    net::SocketAddr,
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum SendError {
    /// The writer task is gone
    #[error("session disconnected")]
    Disconnected,

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Identity announced by the miner through subscribe and authorize.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    pub wallet: String,
    pub worker: String,
    pub remote_app: String,
}

/// Job delivery state, settled on the first job a session receives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MiningState {
    pub initialized: bool,
    pub use_big_job: bool,
}

pub struct MiningSession {
    id: i32,
    peer: SocketAddr,
    connected_at: Instant,
    info: Mutex<SessionInfo>,
    state: Mutex<MiningState>,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl MiningSession {
    pub fn new(id: i32, peer: SocketAddr, outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id,
            peer,
            connected_at: Instant::now(),
            info: Mutex::new(SessionInfo::default()),
            state: Mutex::new(MiningState::default()),
            outbound,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn info(&self) -> SessionInfo {
        self.lock_info().clone()
    }

    pub fn wallet(&self) -> String {
        self.lock_info().wallet.clone()
    }

    pub fn set_remote_app(&self, remote_app: &str) {
        self.lock_info().remote_app = remote_app.to_string();
    }

    /// Splits `wallet[.worker]` and stores both parts.
    pub fn authorize(&self, identity: &str) -> String {
        let (wallet, worker) = match identity.split_once('.') {
            Some((wallet, worker)) => (wallet, worker),
            None => (identity, ""),
        };
        let mut info = self.lock_info();
        info.wallet = wallet.trim().to_string();
        info.worker = worker.trim().to_string();
        info.wallet.clone()
    }

    pub fn mining_state(&self) -> MiningState {
        *self.lock_state()
    }

    /// Runs `f` on the mining state under its lock.
    pub fn update_mining_state<R>(&self, f: impl FnOnce(&mut MiningState) -> R) -> R {
        f(&mut self.lock_state())
    }

    /// Serializes `message` and queues it for the writer task.
    pub fn send<T: Serialize>(&self, message: &T) -> Result<(), SendError> {
        if self.cancel.is_cancelled() {
            return Err(SendError::Disconnected);
        }
        let line = serde_json::to_string(message)?;
        self.outbound
            .send(line)
            .map_err(|_| SendError::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled() && !self.outbound.is_closed()
    }

    /// Ask the connection tasks to stop.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    /// Completes once [`disconnect`](Self::disconnect) has been called.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn lock_info(&self) -> MutexGuard<'_, SessionInfo> {
        self.info.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_state(&self) -> MutexGuard<'_, MiningState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Display for MiningSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = self.lock_info();
        write!(
            f,
            "client {} ({}) {}.{} [{}]",
            self.id, self.peer, info.wallet, info.worker, info.remote_app
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session() -> (MiningSession, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MiningSession::new(1, "127.0.0.1:40000".parse().unwrap(), tx),
            rx,
        )
    }

    #[test]
    fn test_authorize_splits_worker() {
        let (session, _rx) = session();
        assert_eq!(session.authorize("kaspa:qq123.rig01"), "kaspa:qq123");
        assert_eq!(session.info().worker, "rig01");

        session.authorize("kaspa:qq456");
        assert_eq!(session.wallet(), "kaspa:qq456");
        assert_eq!(session.info().worker, "");
    }

    #[test]
    fn test_send_queues_lines_in_order() {
        let (session, mut rx) = session();
        session.send(&json!({"n": 1})).unwrap();
        session.send(&json!({"n": 2})).unwrap();
        assert_eq!(rx.try_recv().unwrap(), r#"{"n":1}"#);
        assert_eq!(rx.try_recv().unwrap(), r#"{"n":2}"#);
    }

    #[test]
    fn test_send_after_disconnect_fails() {
        let (session, _rx) = session();
        assert!(session.is_connected());
        session.disconnect();
        assert!(!session.is_connected());
        assert!(matches!(
            session.send(&json!(true)),
            Err(SendError::Disconnected)
        ));
        assert!(session.cancellation().is_cancelled());
    }

    #[test]
    fn test_closed_writer_is_disconnected() {
        let (session, rx) = session();
        drop(rx);
        assert!(!session.is_connected());
        assert!(matches!(
            session.send(&json!(true)),
            Err(SendError::Disconnected)
        ));
    }
}
