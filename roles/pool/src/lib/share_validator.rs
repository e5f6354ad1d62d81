//! ## Share Validator
//!
//! Runs every `mining.submit` through parse, job lookup, freshness, dedup and proof of
//! work. The dedup insert is the single point where a share becomes counted; the share is
//! persisted only after it succeeds, and a block is only submitted for a counted share.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use pplns_storage::{
    share_key, unix_now, PersistedShare, PoolStorage, ShareDedupStore, UnconfirmedBlock,
};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::{
    error::{NodeError, ShareError},
    job_manager::{JobManager, WorkJob},
    metrics::{ErrorShortCode, PoolMetrics},
    node::NodeApi,
    session::MiningSession,
};

/// Largest gap between the tip blue score and a job's blue score that is still accepted.
pub const WORK_WINDOW: u64 = 8;

/// Result of a credited share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareOutcome {
    Accepted,
    /// The share also met the network target and the node accepted the block.
    BlockFound { hash: String },
}

/// Parsed `mining.submit` params.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub job_id: u32,
    pub nonce: u64,
}

impl Submission {
    /// Expects `[worker, job_id, nonce_hex, ...]`. The nonce may carry a `0x` prefix.
    pub fn parse(params: &[Value]) -> Result<Self, ShareError> {
        if params.len() < 3 {
            return Err(ShareError::BadDataFromMiner(format!(
                "malformed event, expected at least 3 params, got {}",
                params.len()
            )));
        }
        let job_id = params[1]
            .as_str()
            .ok_or_else(|| ShareError::BadDataFromMiner("job id is not a string".to_string()))?
            .parse::<u32>()
            .map_err(|e| {
                ShareError::BadDataFromMiner(format!("job id is not parsable as a number: {}", e))
            })?;
        let nonce_str = params[2]
            .as_str()
            .ok_or_else(|| ShareError::BadDataFromMiner("nonce is not a string".to_string()))?;
        let nonce_hex = nonce_str.strip_prefix("0x").unwrap_or(nonce_str);
        let nonce = u64::from_str_radix(nonce_hex, 16).map_err(|e| {
            ShareError::BadDataFromMiner(format!("failed parsing nonce '{}': {}", nonce_str, e))
        })?;
        Ok(Self { job_id, nonce })
    }
}

pub struct ShareValidator {
    node: Arc<dyn NodeApi>,
    jobs: Arc<JobManager>,
    storage: Arc<dyn PoolStorage>,
    dedup: Arc<dyn ShareDedupStore>,
    metrics: Arc<PoolMetrics>,
    /// Highest blue score seen on a submitted job. Updated without coordination.
    tip_blue_score: AtomicU64,
    difficulty: u64,
    pool_wallet: String,
}

impl ShareValidator {
    pub fn new(
        node: Arc<dyn NodeApi>,
        jobs: Arc<JobManager>,
        storage: Arc<dyn PoolStorage>,
        dedup: Arc<dyn ShareDedupStore>,
        metrics: Arc<PoolMetrics>,
        difficulty: u64,
        pool_wallet: String,
    ) -> Self {
        Self {
            node,
            jobs,
            storage,
            dedup,
            metrics,
            tip_blue_score: AtomicU64::new(0),
            difficulty,
            pool_wallet,
        }
    }

    pub fn tip_blue_score(&self) -> u64 {
        self.tip_blue_score.load(Ordering::Relaxed)
    }

    pub async fn handle_submit(
        &self,
        session: &MiningSession,
        params: &[Value],
    ) -> Result<ShareOutcome, ShareError> {
        let wallet = session.wallet();
        if wallet.is_empty() {
            return Err(ShareError::NoMinerAddress);
        }

        let submission = Submission::parse(params).map_err(|e| {
            self.metrics
                .record_worker_error(&wallet, ErrorShortCode::BadDataFromMiner);
            e
        })?;
        let job = self.jobs.get_job(submission.job_id).ok_or_else(|| {
            self.metrics
                .record_worker_error(&wallet, ErrorShortCode::MissingJob);
            ShareError::MissingJob(submission.job_id)
        })?;
        debug!(
            client_id = session.id(),
            blue_score = job.blue_score(),
            nonce = submission.nonce,
            "submit"
        );

        if let Err(e) = self.check_fresh(&job) {
            self.metrics.record_stale_share();
            return Err(e);
        }
        self.record_share(&wallet, &job, submission.nonce).await?;

        let pow = self.node.compute_pow(&job.template.header, submission.nonce);
        if pow.meets_target() {
            return self.submit_block(session, &wallet, &job, submission.nonce).await;
        }

        self.metrics.record_share_found(&wallet);
        Ok(ShareOutcome::Accepted)
    }

    fn check_fresh(&self, job: &WorkJob) -> Result<(), ShareError> {
        let job_blue_score = job.blue_score();
        let tip = self.tip_blue_score.load(Ordering::Relaxed);
        if job_blue_score > tip {
            self.tip_blue_score.store(job_blue_score, Ordering::Relaxed);
        } else if tip - job_blue_score > WORK_WINDOW {
            return Err(ShareError::StaleShare { job_blue_score, tip });
        }
        Ok(())
    }

    async fn record_share(&self, wallet: &str, job: &WorkJob, nonce: u64) -> Result<(), ShareError> {
        let now = unix_now();
        let key = share_key(job.blue_score(), nonce);
        if !self.dedup.add_if_new(&key, now).await? {
            self.metrics.record_dupe_share();
            return Err(ShareError::DupeShare);
        }
        self.storage
            .put_share(&PersistedShare {
                wallet: wallet.to_string(),
                blue_score: job.blue_score(),
                nonce,
                difficulty: self.difficulty,
                timestamp: now,
            })
            .await?;
        Ok(())
    }

    async fn submit_block(
        &self,
        session: &MiningSession,
        wallet: &str,
        job: &WorkJob,
        nonce: u64,
    ) -> Result<ShareOutcome, ShareError> {
        let result = self.node.submit_block(&job.template, nonce).await;
        info!(client_id = session.id(), nonce, "Submitted block to node");

        let hash = match result {
            Ok(hash) => hash,
            Err(NodeError::DuplicateBlock) => {
                warn!(client_id = session.id(), "Block rejected, stale");
                self.metrics.record_stale_share();
                return Err(ShareError::StaleShare {
                    job_blue_score: job.blue_score(),
                    tip: self.tip_blue_score(),
                });
            }
            Err(e) => {
                warn!(client_id = session.id(), error = %e, "Block rejected, unknown issue");
                self.metrics.record_invalid_share();
                return Err(ShareError::InvalidShare(e.to_string()));
            }
        };

        info!(client_id = session.id(), hash = %hash, "Block accepted");
        self.metrics
            .record_block_found(wallet, nonce, job.blue_score(), &hash);

        let block = UnconfirmedBlock {
            hash: hash.clone(),
            miner: wallet.to_string(),
            payee: self.pool_wallet.clone(),
            block_json: json!({ "template": job.template, "nonce": nonce }).to_string(),
            blue_score: job.template.header.blue_score,
            daa_score: job.template.header.daa_score,
            timestamp: unix_now(),
        };
        if let Err(e) = self.storage.put_block(&block).await {
            error!(hash = %hash, error = %e, "Failed to record found block");
        }
        Ok(ShareOutcome::BlockFound { hash })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_submission() {
        let parsed = Submission::parse(&[json!("w"), json!("42"), json!("0x00ff")]).unwrap();
        assert_eq!(parsed, Submission { job_id: 42, nonce: 255 });

        let parsed = Submission::parse(&[json!("w"), json!("1"), json!("ffffffffffffffff")]).unwrap();
        assert_eq!(parsed.nonce, u64::MAX);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for params in [
            vec![json!("w"), json!("1")],
            vec![json!("w"), json!(1), json!("ff")],
            vec![json!("w"), json!("abc"), json!("ff")],
            vec![json!("w"), json!("1"), json!("zz")],
            vec![json!("w"), json!("1"), json!(255)],
            vec![json!("w"), json!("4294967296"), json!("ff")],
        ] {
            assert!(matches!(
                Submission::parse(&params),
                Err(ShareError::BadDataFromMiner(_))
            ));
        }
    }
}
