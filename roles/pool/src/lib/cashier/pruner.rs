//! Bounds share history and the dedup set.

use std::sync::Arc;

use pplns_storage::{unix_now, PoolStorage, ShareDedupStore};
use tracing::info;

use crate::error::PoolResult;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub shares: u64,
    pub dedup_keys: u64,
}

pub struct Pruner {
    storage: Arc<dyn PoolStorage>,
    dedup: Arc<dyn ShareDedupStore>,
    share_retention: u64,
    dedup_retention_secs: u64,
}

impl Pruner {
    pub fn new(
        storage: Arc<dyn PoolStorage>,
        dedup: Arc<dyn ShareDedupStore>,
        share_retention: u64,
        dedup_retention_secs: u64,
    ) -> Self {
        Self {
            storage,
            dedup,
            share_retention,
            dedup_retention_secs,
        }
    }

    pub async fn prune_once(&self) -> PoolResult<PruneReport> {
        self.prune_at(unix_now()).await
    }

    /// Keep the `share_retention` highest blue scores and dedup keys scored at or after
    /// `now - dedup_retention_secs`.
    pub async fn prune_at(&self, now: u64) -> PoolResult<PruneReport> {
        let shares = self.storage.prune_shares(self.share_retention).await?;

        let cutoff = now.saturating_sub(self.dedup_retention_secs);
        let dedup_keys = if cutoff > 0 {
            self.dedup.remove_by_score(0, cutoff - 1).await?
        } else {
            0
        };

        info!(shares, dedup_keys, "Pruned share history");
        Ok(PruneReport { shares, dedup_keys })
    }
}
