//! ## Settlement
//!
//! Turns each confirmed block into `owed` ledger entries, proportional to the PPLNS
//! effort recorded up to the block. Payouts are `floor(effort * reward / total)` in
//! integer arithmetic; the truncated remainder (at most one unit per wallet) stays with
//! the pool.

use std::sync::Arc;

use pplns_storage::{EffortMap, NewLedgerEntry, PoolStorage};
use tracing::{debug, error, info, warn};

use crate::error::PoolResult;

/// Split `reward` across `effort`. Wallets with zero effort are left out and entries are
/// sorted by wallet.
pub fn determine_payouts(reward: u64, daa_score: u64, effort: &EffortMap) -> Vec<NewLedgerEntry> {
    let total: u128 = effort.values().map(|v| *v as u128).sum();
    if total == 0 {
        return Vec::new();
    }

    let mut entries: Vec<NewLedgerEntry> = effort
        .iter()
        .filter(|(_, effort)| **effort > 0)
        .map(|(wallet, effort)| NewLedgerEntry {
            wallet: wallet.clone(),
            // effort <= total, so the quotient fits in u64
            amount: (*effort as u128 * reward as u128 / total) as u64,
            daa_score,
        })
        .collect();
    entries.sort_by(|a, b| a.wallet.cmp(&b.wallet));
    entries
}

pub struct Settlement {
    storage: Arc<dyn PoolStorage>,
    batch: usize,
    pplns_window: u64,
}

impl Settlement {
    pub fn new(storage: Arc<dyn PoolStorage>, batch: usize, pplns_window: u64) -> Self {
        Self {
            storage,
            batch,
            pplns_window,
        }
    }

    /// Write payouts for up to one batch of confirmed blocks. Returns the number of
    /// blocks moved to `payment_pending`.
    pub async fn settle_once(&self) -> PoolResult<usize> {
        let blocks = self.storage.get_confirmed_blocks(self.batch).await?;
        debug!("Fetched {} confirmed blocks for processing", blocks.len());

        let mut settled = 0;
        for confirmed in blocks {
            let block = &confirmed.block;
            let effort = match self
                .storage
                .get_effort_by_wallet(block.timestamp, self.pplns_window)
                .await
            {
                Ok(effort) => effort,
                Err(e) => {
                    error!(hash = %block.hash, error = %e, "Failed getting shares for block effort");
                    continue;
                }
            };

            let entries = determine_payouts(confirmed.coinbase.amount, block.daa_score, &effort);
            if entries.is_empty() {
                warn!(hash = %block.hash, "No share effort recorded before block, leaving it confirmed");
                continue;
            }

            match self.storage.commit_block_payouts(&block.hash, &entries).await {
                Ok(true) => {
                    let paid: u64 = entries.iter().map(|e| e.amount).sum();
                    info!(
                        hash = %block.hash,
                        wallets = entries.len(),
                        reward = confirmed.coinbase.amount,
                        paid,
                        "Wrote ledger entries for block"
                    );
                    settled += 1;
                }
                Ok(false) => debug!(hash = %block.hash, "Block already settled"),
                Err(e) => {
                    error!(hash = %block.hash, error = %e, "Failed to put payable entries to ledger")
                }
            }
        }
        Ok(settled)
    }
}
