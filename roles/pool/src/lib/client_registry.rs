//! ## Client Registry
//!
//! Tracks live [`MiningSession`]s and fans new jobs out to them.
//!
//! The session map sits behind one mutex that [`ClientRegistry::broadcast`] holds for the
//! whole fan-out, so connects and disconnects never interleave with a broadcast. Each
//! delivery is a non-blocking enqueue onto the session's outbound channel: a slow socket
//! cannot stall the others and every session sees jobs in id order.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    job_manager::WorkJob,
    metrics::{ErrorShortCode, PoolMetrics},
    session::{MiningSession, SendError},
    stratum::messages::JsonRpcEvent,
};

/// Case-sensitive glob over a miner's announced client name. `*` matches any run of
/// characters; everything else matches literally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigJobMatcher {
    pattern: String,
}

impl BigJobMatcher {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_match(&self, remote_app: &str) -> bool {
        let parts: Vec<&str> = self.pattern.split('*').collect();
        if parts.len() == 1 {
            return self.pattern == remote_app;
        }

        let (first, rest) = (parts[0], &parts[1..]);
        let Some(mut remaining) = remote_app.strip_prefix(first) else {
            return false;
        };
        let (last, middle) = match rest.split_last() {
            Some((last, middle)) => (*last, middle),
            None => return true,
        };
        for part in middle {
            match remaining.find(part) {
                Some(pos) => remaining = &remaining[pos + part.len()..],
                None => return false,
            }
        }
        remaining.ends_with(last)
    }
}

pub struct ClientRegistry {
    clients: Mutex<HashMap<i32, Arc<MiningSession>>>,
    counter: AtomicI32,
    metrics: Arc<PoolMetrics>,
    difficulty: u64,
    big_job: BigJobMatcher,
    wallet_grace_period: Duration,
}

impl ClientRegistry {
    pub fn new(
        metrics: Arc<PoolMetrics>,
        difficulty: u64,
        big_job: BigJobMatcher,
        wallet_grace_period: Duration,
    ) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            counter: AtomicI32::new(0),
            metrics,
            difficulty,
            big_job,
            wallet_grace_period,
        }
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<i32, Arc<MiningSession>>> {
        self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Assigns the next session id and registers the session.
    pub fn on_connect(
        &self,
        peer: SocketAddr,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Arc<MiningSession> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        let session = Arc::new(MiningSession::new(id, peer, outbound));
        self.clients().insert(id, session.clone());
        info!(client_id = id, %peer, "Miner connected");
        session
    }

    pub fn on_disconnect(&self, session: &MiningSession) {
        session.disconnect();
        if self.clients().remove(&session.id()).is_some() {
            info!(client_id = session.id(), "Removed client");
            self.metrics.record_disconnect();
        }
    }

    pub fn len(&self) -> usize {
        self.clients().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: i32) -> Option<Arc<MiningSession>> {
        self.clients().get(&id).cloned()
    }

    /// Deliver `job` to every connected session.
    pub fn broadcast(&self, job: &WorkJob) {
        let clients = self.clients();
        debug!(job_id = job.id, clients = clients.len(), "Broadcasting job");
        for session in clients.values() {
            if !session.is_connected() {
                continue;
            }
            self.deliver(session, job);
        }
    }

    fn deliver(&self, session: &MiningSession, job: &WorkJob) {
        let wallet = session.wallet();
        if wallet.is_empty() {
            if session.connected_for() >= self.wallet_grace_period {
                warn!(
                    client_id = session.id(),
                    "Client {} misconfigured, no miner address specified - disconnecting",
                    session
                );
                self.metrics
                    .record_worker_error(&wallet, ErrorShortCode::NoMinerAddress);
                session.disconnect();
            }
            return;
        }

        let remote_app = session.info().remote_app;
        let first_job = session.update_mining_state(|state| {
            if state.initialized {
                return false;
            }
            state.initialized = true;
            state.use_big_job = self.big_job.is_match(&remote_app);
            true
        });
        if first_job {
            // difficulty is fixed, so it only goes out once per session
            if let Err(e) = session.send(&JsonRpcEvent::set_difficulty(self.difficulty)) {
                self.metrics
                    .record_worker_error(&wallet, ErrorShortCode::FailedSetDiff);
                error!(client_id = session.id(), error = %e, "Failed sending difficulty");
                return;
            }
        }

        let use_big_job = session.mining_state().use_big_job;
        let notify = JsonRpcEvent::notify(job.id, job.params(use_big_job).to_vec());
        match session.send(&notify) {
            Ok(()) => self.metrics.record_new_job(),
            Err(SendError::Disconnected) => {
                self.metrics
                    .record_worker_error(&wallet, ErrorShortCode::Disconnected);
            }
            Err(e) => {
                self.metrics
                    .record_worker_error(&wallet, ErrorShortCode::FailedSendWork);
                error!(
                    client_id = session.id(),
                    job_id = job.id,
                    error = %e,
                    "Failed sending work packet"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        job_manager::JobManager,
        node::{BlockTemplate, TemplateHeader},
    };
    use serde_json::Value;

    fn registry(grace: Duration) -> (ClientRegistry, Arc<PoolMetrics>) {
        let metrics = Arc::new(PoolMetrics::new());
        (
            ClientRegistry::new(metrics.clone(), 4, BigJobMatcher::new("*BzMiner*"), grace),
            metrics,
        )
    }

    fn job(jobs: &JobManager) -> Arc<WorkJob> {
        jobs.add_job(BlockTemplate {
            header: TemplateHeader {
                pre_pow_hash: [7u8; 32],
                timestamp_ms: 1,
                blue_score: 10,
                daa_score: 10,
                bits: 0,
            },
            body: Value::Null,
        })
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(line) = rx.try_recv() {
            out.push(serde_json::from_str(&line).unwrap());
        }
        out
    }

    #[test]
    fn test_glob_matcher() {
        let matcher = BigJobMatcher::new("*BzMiner*");
        assert!(matcher.is_match("BzMiner/v12.1"));
        assert!(matcher.is_match("my BzMiner"));
        assert!(!matcher.is_match("bzminer"));
        assert!(!matcher.is_match("lolMiner"));

        assert!(BigJobMatcher::new("Bz*v1?").is_match("BzMiner v1?"));
        assert!(!BigJobMatcher::new("Bz*v1").is_match("BzMiner v12"));
        assert!(BigJobMatcher::new("exact").is_match("exact"));
        assert!(!BigJobMatcher::new("exact").is_match("exactly"));
        assert!(BigJobMatcher::new("*").is_match(""));
    }

    #[test]
    fn test_first_job_sends_difficulty_then_notify() {
        let (registry, metrics) = registry(Duration::from_secs(20));
        let jobs = JobManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = registry.on_connect("127.0.0.1:1".parse().unwrap(), tx);
        session.authorize("kaspa:abc.rig");

        registry.broadcast(&job(&jobs));
        registry.broadcast(&job(&jobs));

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["method"], "mining.set_difficulty");
        assert_eq!(messages[0]["params"][0], 4);
        assert_eq!(messages[1]["method"], "mining.notify");
        assert_eq!(messages[1]["id"], 1);
        assert_eq!(messages[2]["id"], 2);
        assert_eq!(messages[1]["params"].as_array().unwrap().len(), 3);
        assert_eq!(metrics.snapshot().jobs_sent, 2);
    }

    #[test]
    fn test_big_job_encoding_selected_by_remote_app() {
        let (registry, _) = registry(Duration::from_secs(20));
        let jobs = JobManager::new();
        let (big_tx, mut big_rx) = mpsc::unbounded_channel();
        let big = registry.on_connect("127.0.0.1:1".parse().unwrap(), big_tx);
        big.set_remote_app("BzMiner-v14.0.2");
        big.authorize("kaspa:big");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let normal = registry.on_connect("127.0.0.1:2".parse().unwrap(), tx);
        normal.set_remote_app("lolMiner 1.8");
        normal.authorize("kaspa:normal");

        for _ in 0..3 {
            registry.broadcast(&job(&jobs));
        }

        let big_notifies: Vec<Value> = drain(&mut big_rx)
            .into_iter()
            .filter(|m| m["method"] == "mining.notify")
            .collect();
        assert_eq!(big_notifies.len(), 3);
        assert!(big_notifies
            .iter()
            .all(|m| m["params"].as_array().unwrap().len() == 2));

        let notifies: Vec<Value> = drain(&mut rx)
            .into_iter()
            .filter(|m| m["method"] == "mining.notify")
            .collect();
        assert_eq!(notifies.len(), 3);
        assert!(notifies
            .iter()
            .all(|m| m["params"].as_array().unwrap().len() == 3));
        assert!(big.mining_state().use_big_job);
        assert!(!normal.mining_state().use_big_job);
    }

    #[test]
    fn test_missing_wallet_disconnected_after_grace() {
        let (registry, metrics) = registry(Duration::ZERO);
        let jobs = JobManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = registry.on_connect("127.0.0.1:1".parse().unwrap(), tx);

        registry.broadcast(&job(&jobs));
        assert!(!session.is_connected());
        assert!(drain(&mut rx).is_empty());
        assert_eq!(metrics.worker_errors("", ErrorShortCode::NoMinerAddress), 1);

        registry.on_disconnect(&session);
        assert!(registry.is_empty());
        assert_eq!(metrics.snapshot().disconnects, 1);
    }

    #[test]
    fn test_missing_wallet_within_grace_is_skipped() {
        let (registry, _) = registry(Duration::from_secs(20));
        let jobs = JobManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = registry.on_connect("127.0.0.1:1".parse().unwrap(), tx);

        registry.broadcast(&job(&jobs));
        assert!(session.is_connected());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_dead_session_does_not_block_others() {
        let (registry, metrics) = registry(Duration::from_secs(20));
        let jobs = JobManager::new();
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        let dead = registry.on_connect("127.0.0.1:1".parse().unwrap(), dead_tx);
        dead.authorize("kaspa:dead");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let live = registry.on_connect("127.0.0.1:2".parse().unwrap(), tx);
        live.authorize("kaspa:live");
        drop(dead_rx);

        registry.broadcast(&job(&jobs));
        assert_eq!(drain(&mut rx).len(), 2);
        assert_eq!(registry.len(), 2);
        assert_eq!(metrics.snapshot().jobs_sent, 1);
    }
}
