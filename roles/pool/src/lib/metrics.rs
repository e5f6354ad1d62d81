//! Pool counters.
//!
//! A single [`PoolMetrics`] is created at startup and shared by the registry, the share
//! validator and the stratum server. Counters are plain atomics; the per-wallet worker
//! error table sits behind a mutex since it is only touched on failure paths.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use tracing::debug;

/// Short codes attached to worker errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorShortCode {
    NoMinerAddress,
    FailedSetDiff,
    Disconnected,
    FailedSendWork,
    BadDataFromMiner,
    MissingJob,
}

impl fmt::Display for ErrorShortCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            ErrorShortCode::NoMinerAddress => "err_no_miner_address",
            ErrorShortCode::FailedSetDiff => "err_failed_set_diff",
            ErrorShortCode::Disconnected => "err_worker_disconnected",
            ErrorShortCode::FailedSendWork => "err_failed_sending_work",
            ErrorShortCode::BadDataFromMiner => "err_bad_data_from_miner",
            ErrorShortCode::MissingJob => "err_missing_job",
        };
        f.write_str(code)
    }
}

#[derive(Debug, Default)]
pub struct PoolMetrics {
    shares_found: AtomicU64,
    stale_shares: AtomicU64,
    dupe_shares: AtomicU64,
    invalid_shares: AtomicU64,
    blocks_found: AtomicU64,
    disconnects: AtomicU64,
    jobs_sent: AtomicU64,
    worker_errors: Mutex<HashMap<(String, ErrorShortCode), u64>>,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub shares_found: u64,
    pub stale_shares: u64,
    pub dupe_shares: u64,
    pub invalid_shares: u64,
    pub blocks_found: u64,
    pub disconnects: u64,
    pub jobs_sent: u64,
    pub worker_errors: u64,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_share_found(&self, wallet: &str) {
        self.shares_found.fetch_add(1, Ordering::Relaxed);
        debug!(wallet, "share found");
    }

    pub fn record_stale_share(&self) {
        self.stale_shares.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dupe_share(&self) {
        self.dupe_shares.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid_share(&self) {
        self.invalid_shares.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_block_found(&self, wallet: &str, nonce: u64, blue_score: u64, hash: &str) {
        self.blocks_found.fetch_add(1, Ordering::Relaxed);
        debug!(wallet, nonce, blue_score, hash, "block found");
    }

    pub fn record_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_new_job(&self) {
        self.jobs_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_error(&self, wallet: &str, code: ErrorShortCode) {
        let mut errors = self
            .worker_errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *errors.entry((wallet.to_string(), code)).or_default() += 1;
    }

    pub fn worker_errors(&self, wallet: &str, code: ErrorShortCode) -> u64 {
        let errors = self
            .worker_errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        errors.get(&(wallet.to_string(), code)).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let worker_errors: u64 = self
            .worker_errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .sum();
        MetricsSnapshot {
            shares_found: self.shares_found.load(Ordering::Relaxed),
            stale_shares: self.stale_shares.load(Ordering::Relaxed),
            dupe_shares: self.dupe_shares.load(Ordering::Relaxed),
            invalid_shares: self.invalid_shares.load(Ordering::Relaxed),
            blocks_found: self.blocks_found.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            jobs_sent: self.jobs_sent.load(Ordering::Relaxed),
            worker_errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_errors_keyed_by_wallet_and_code() {
        let metrics = PoolMetrics::new();
        metrics.record_worker_error("a", ErrorShortCode::MissingJob);
        metrics.record_worker_error("a", ErrorShortCode::MissingJob);
        metrics.record_worker_error("b", ErrorShortCode::BadDataFromMiner);

        assert_eq!(metrics.worker_errors("a", ErrorShortCode::MissingJob), 2);
        assert_eq!(metrics.worker_errors("a", ErrorShortCode::BadDataFromMiner), 0);
        assert_eq!(metrics.snapshot().worker_errors, 3);
        assert_eq!(ErrorShortCode::Disconnected.to_string(), "err_worker_disconnected");
    }
}
