//! Pulls coinbase payments to the pool wallet from the node into storage.

use std::sync::Arc;

use pplns_storage::PoolStorage;
use tracing::{error, info};

use crate::{error::PoolResult, node::NodeApi};

pub struct CoinbaseLedger {
    node: Arc<dyn NodeApi>,
    storage: Arc<dyn PoolStorage>,
    pool_wallet: String,
}

impl CoinbaseLedger {
    pub fn new(node: Arc<dyn NodeApi>, storage: Arc<dyn PoolStorage>, pool_wallet: String) -> Self {
        Self {
            node,
            storage,
            pool_wallet,
        }
    }

    /// Fetch payments above the stored tip and record them. Returns how many were new.
    pub async fn ingest_once(&self) -> PoolResult<usize> {
        let tip = match self.storage.get_coinbase_tip(&self.pool_wallet).await? {
            Some(tip) => tip,
            None => {
                info!(wallet = %self.pool_wallet, "No coinbase entries for wallet, doing full fetch");
                0
            }
        };
        let payments = self
            .node
            .get_coinbase_payments(&self.pool_wallet, tip)
            .await?;

        let mut added = 0;
        for payment in payments {
            match self.storage.put_coinbase_payment(&payment).await {
                Ok(true) => {
                    info!(
                        tx_id = %payment.tx_id,
                        amount = payment.amount,
                        daa_score = payment.daa_score,
                        "Added coinbase payment"
                    );
                    added += 1;
                }
                Ok(false) => {}
                Err(e) => error!(tx_id = %payment.tx_id, error = %e, "Failed writing coinbase payment"),
            }
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{DevNode, DevNodeConfig};
    use pplns_storage::backends::memory::MemoryStorage;

    #[tokio::test]
    async fn test_ingests_matured_payments_once() {
        let node = Arc::new(DevNode::new(DevNodeConfig::default()));
        let storage = Arc::new(MemoryStorage::new());
        let ledger = CoinbaseLedger::new(node.clone(), storage.clone(), "pool".to_string());

        let template = node.get_block_template("pool").await.unwrap();
        let nonce = node.find_nonce(&template.header, 0, true);
        node.submit_block(&template, nonce).await.unwrap();
        assert_eq!(ledger.ingest_once().await.unwrap(), 0);

        for _ in 0..5 {
            node.advance();
        }
        assert_eq!(ledger.ingest_once().await.unwrap(), 1);
        assert_eq!(ledger.ingest_once().await.unwrap(), 0);
        assert_eq!(
            storage.get_coinbase_tip("pool").await.unwrap(),
            Some(template.header.daa_score + 5)
        );
    }
}
