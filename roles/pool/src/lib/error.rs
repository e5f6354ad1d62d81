//! Error types for the pool worker and cashier.
//!
//! - `PoolError` - process-level failures (startup, configuration, task wiring)
//! - `ShareError` - why a single `mining.submit` was not credited
//! - `NodeError` / `WalletError` - failures reported by the external collaborators

use pplns_storage::StorageError;
use thiserror::Error;

pub type PoolResult<T> = Result<T, PoolError>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Configuration error: {0}")]
    Config(#[from] ext_config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Wallet error: {0}")]
    Wallet(#[from] WalletError),

    #[error("{0}")]
    Custom(String),
}

/// Errors returned by the blockchain node collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    /// The node already has this block (another submission won the race)
    #[error("block rejected: duplicate block")]
    DuplicateBlock,

    #[error("block rejected: {0}")]
    Rejected(String),
}

/// Errors returned by the wallet daemon collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WalletError {
    #[error("send of {amount} to {to} failed: {reason}")]
    SendFailed {
        to: String,
        amount: u64,
        reason: String,
    },
}

/// Reasons a share submission is rejected.
#[derive(Debug, Error)]
pub enum ShareError {
    /// Malformed submission
    #[error("bad data from miner: {0}")]
    BadDataFromMiner(String),

    /// Job id is unknown or was evicted from the ring buffer
    #[error("job {0} does not exist, stale?")]
    MissingJob(u32),

    #[error("stale share: job blue score {job_blue_score} vs tip {tip}")]
    StaleShare { job_blue_score: u64, tip: u64 },

    #[error("duplicate share")]
    DupeShare,

    #[error("no miner address specified")]
    NoMinerAddress,

    /// Block submission failed for a reason other than a duplicate block
    #[error("invalid share: {0}")]
    InvalidShare(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ShareError {
    /// Stratum error code and message returned to the miner.
    pub fn stratum_code(&self) -> (i64, &'static str) {
        match self {
            ShareError::StaleShare { .. } | ShareError::MissingJob(_) => (21, "Job not found"),
            ShareError::DupeShare => (22, "Duplicate share submitted"),
            ShareError::NoMinerAddress => (24, "Unauthorized worker"),
            _ => (20, "Unknown problem"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_error_display() {
        let err = ShareError::StaleShare {
            job_blue_score: 100,
            tip: 109,
        };
        assert_eq!(err.to_string(), "stale share: job blue score 100 vs tip 109");
        assert_eq!(ShareError::MissingJob(7).to_string(), "job 7 does not exist, stale?");
    }

    #[test]
    fn test_stratum_codes() {
        assert_eq!(ShareError::DupeShare.stratum_code().0, 22);
        assert_eq!(
            ShareError::StaleShare {
                job_blue_score: 1,
                tip: 10
            }
            .stratum_code()
            .0,
            21
        );
        assert_eq!(ShareError::MissingJob(1).stratum_code().0, 21);
        assert_eq!(ShareError::BadDataFromMiner("x".to_string()).stratum_code().0, 20);
        assert_eq!(
            ShareError::InvalidShare("bad pow".to_string()).stratum_code().0,
            20
        );
    }

    #[test]
    fn test_pool_error_from_storage() {
        let err: PoolError = StorageError::BackendUnavailable.into();
        assert_eq!(err.to_string(), "Storage error: Storage backend unavailable");
    }
}
