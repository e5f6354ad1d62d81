//! Matches unconfirmed pool blocks to the coinbase payments that rewarded them.

use std::sync::Arc;

use pplns_storage::PoolStorage;
use tracing::{debug, info, warn};

use crate::error::PoolResult;

pub struct BlockResolver {
    storage: Arc<dyn PoolStorage>,
    batch: usize,
    /// A block's coinbase must land within this many DAA ticks after it.
    window: u64,
}

impl BlockResolver {
    pub fn new(storage: Arc<dyn PoolStorage>, batch: usize, window: u64) -> Self {
        Self {
            storage,
            batch,
            window,
        }
    }

    /// Resolve up to one batch of the oldest unconfirmed blocks. Returns how many moved to
    /// `confirmed`. Blocks without a payment in the window stay for the next cycle.
    pub async fn resolve_once(&self) -> PoolResult<usize> {
        let blocks = self.storage.get_unconfirmed_blocks(self.batch).await?;
        debug!("Fetched {} blocks to resolve", blocks.len());

        let mut resolved = 0;
        for block in blocks {
            let payment = match self
                .storage
                .find_coinbase_payment(&block.payee, block.daa_score, self.window)
                .await
            {
                Ok(Some(payment)) => payment,
                Ok(None) => {
                    debug!(hash = %block.hash, daa_score = block.daa_score, "No coinbase payment yet");
                    continue;
                }
                Err(e) => {
                    warn!(hash = %block.hash, error = %e, "Failed to resolve block");
                    continue;
                }
            };

            if self.storage.confirm_block(&block.hash, &payment.tx_id).await? {
                info!(
                    hash = %block.hash,
                    tx_id = %payment.tx_id,
                    daa_diff = payment.daa_score - block.daa_score,
                    "Resolved block"
                );
                resolved += 1;
            } else {
                debug!(hash = %block.hash, "Block already resolved");
            }
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pplns_storage::{backends::memory::MemoryStorage, BlockStatus, CoinbasePayment, UnconfirmedBlock};

    fn block(hash: &str, daa_score: u64, timestamp: u64) -> UnconfirmedBlock {
        UnconfirmedBlock {
            hash: hash.to_string(),
            miner: "miner".to_string(),
            payee: "pool".to_string(),
            block_json: "{}".to_string(),
            blue_score: daa_score,
            daa_score,
            timestamp,
        }
    }

    #[tokio::test]
    async fn test_resolves_only_blocks_with_payment_in_window() {
        let storage = Arc::new(MemoryStorage::new());
        storage.put_block(&block("near", 28554656, 1)).await.unwrap();
        storage.put_block(&block("far", 38554656, 2)).await.unwrap();
        storage
            .put_coinbase_payment(&CoinbasePayment {
                tx_id: "tx-near".to_string(),
                wallet: "pool".to_string(),
                amount: 1000,
                daa_score: 28554661,
            })
            .await
            .unwrap();
        storage
            .put_coinbase_payment(&CoinbasePayment {
                tx_id: "tx-far".to_string(),
                wallet: "pool".to_string(),
                amount: 1000,
                daa_score: 38554656 + 33,
            })
            .await
            .unwrap();

        let resolver = BlockResolver::new(storage.clone(), 10, 32);
        assert_eq!(resolver.resolve_once().await.unwrap(), 1);

        let near = storage.get_block("near").await.unwrap().unwrap();
        assert_eq!(near.status, BlockStatus::Confirmed);
        assert_eq!(near.coinbase_tx.as_deref(), Some("tx-near"));
        let far = storage.get_block("far").await.unwrap().unwrap();
        assert_eq!(far.status, BlockStatus::Unconfirmed);

        // second pass finds nothing new and leaves the resolved block alone
        assert_eq!(resolver.resolve_once().await.unwrap(), 0);
        let near = storage.get_block("near").await.unwrap().unwrap();
        assert_eq!(near.status, BlockStatus::Confirmed);
    }
}
