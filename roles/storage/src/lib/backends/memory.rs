//! In-memory storage backend for testing and development.
//!
//! All tables live behind a single lock so that multi-row commits are atomic. Data is
//! lost when the process stops.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::{
    dedup::{MemoryShareSet, ShareDedupStore},
    error::{StorageError, StorageResult},
    pool_storage::{PoolStorage, StorageHealth},
    types::{
        BlockRecord, BlockStatus, CoinbasePayment, ConfirmedBlock, EffortMap, LedgerEntry,
        LedgerEntryStatus, NewLedgerEntry, PersistedShare, UnconfirmedBlock,
    },
    unix_now,
};

#[derive(Default)]
struct Tables {
    shares: Vec<PersistedShare>,
    blocks: HashMap<String, BlockRecord>,
    coinbase_payments: Vec<CoinbasePayment>,
    ledger: Vec<LedgerEntry>,
    next_ledger_id: u64,
    closed: bool,
}

/// In-memory implementation of [`PoolStorage`] and [`ShareDedupStore`].
pub struct MemoryStorage {
    tables: RwLock<Tables>,
    share_buffer: MemoryShareSet,
    last_operation_timestamp: RwLock<Option<u64>>,
}

impl MemoryStorage {
    /// Create a new MemoryStorage instance
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables {
                next_ledger_id: 1,
                ..Default::default()
            }),
            share_buffer: MemoryShareSet::new(),
            last_operation_timestamp: RwLock::new(None),
        }
    }

    async fn update_last_operation_timestamp(&self) {
        *self.last_operation_timestamp.write().await = Some(unix_now());
    }

    fn ensure_open(tables: &Tables) -> StorageResult<()> {
        if tables.closed {
            return Err(StorageError::BackendUnavailable);
        }
        Ok(())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PoolStorage for MemoryStorage {
    async fn initialize(&mut self) -> StorageResult<()> {
        tracing::info!("Initializing memory storage backend");
        self.tables.write().await.closed = false;
        self.update_last_operation_timestamp().await;
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        tracing::info!("Closing memory storage backend");
        let mut tables = self.tables.write().await;
        *tables = Tables {
            closed: true,
            next_ledger_id: 1,
            ..Default::default()
        };
        Ok(())
    }

    async fn put_share(&self, share: &PersistedShare) -> StorageResult<()> {
        {
            let mut tables = self.tables.write().await;
            Self::ensure_open(&tables)?;
            tables.shares.push(share.clone());
        }
        self.update_last_operation_timestamp().await;
        Ok(())
    }

    async fn get_effort_by_wallet(&self, before: u64, window: u64) -> StorageResult<EffortMap> {
        let tables = self.tables.read().await;
        Self::ensure_open(&tables)?;

        let mut eligible: Vec<&PersistedShare> = tables
            .shares
            .iter()
            .filter(|share| share.timestamp <= before)
            .collect();
        // stable: equal timestamps keep insertion order
        eligible.sort_by_key(|share| share.timestamp);

        let mut effort = EffortMap::new();
        for share in eligible.into_iter().rev().take(window as usize) {
            *effort.entry(share.wallet.clone()).or_default() += share.difficulty;
        }
        Ok(effort)
    }

    async fn prune_shares(&self, keep: u64) -> StorageResult<u64> {
        let mut tables = self.tables.write().await;
        Self::ensure_open(&tables)?;

        if keep == 0 || tables.shares.len() as u64 <= keep {
            return Ok(0);
        }
        let mut scores: Vec<u64> = tables.shares.iter().map(|s| s.blue_score).collect();
        scores.sort_unstable_by(|a, b| b.cmp(a));
        let floor = scores[keep as usize - 1];

        let before = tables.shares.len();
        tables.shares.retain(|share| share.blue_score >= floor);
        Ok((before - tables.shares.len()) as u64)
    }

    async fn put_block(&self, block: &UnconfirmedBlock) -> StorageResult<()> {
        {
            let mut tables = self.tables.write().await;
            Self::ensure_open(&tables)?;
            if tables.blocks.contains_key(&block.hash) {
                return Err(StorageError::InvalidData(format!(
                    "block {} already recorded",
                    block.hash
                )));
            }
            tables.blocks.insert(
                block.hash.clone(),
                BlockRecord {
                    block: block.clone(),
                    status: BlockStatus::Unconfirmed,
                    coinbase_tx: None,
                },
            );
        }
        self.update_last_operation_timestamp().await;
        Ok(())
    }

    async fn get_block(&self, hash: &str) -> StorageResult<Option<BlockRecord>> {
        let tables = self.tables.read().await;
        Self::ensure_open(&tables)?;
        Ok(tables.blocks.get(hash).cloned())
    }

    async fn get_unconfirmed_blocks(&self, limit: usize) -> StorageResult<Vec<UnconfirmedBlock>> {
        let tables = self.tables.read().await;
        Self::ensure_open(&tables)?;

        let mut blocks: Vec<&BlockRecord> = tables
            .blocks
            .values()
            .filter(|record| record.status == BlockStatus::Unconfirmed)
            .collect();
        blocks.sort_by(|a, b| {
            a.block
                .timestamp
                .cmp(&b.block.timestamp)
                .then_with(|| a.block.daa_score.cmp(&b.block.daa_score))
        });
        Ok(blocks
            .into_iter()
            .take(limit)
            .map(|record| record.block.clone())
            .collect())
    }

    async fn get_confirmed_blocks(&self, limit: usize) -> StorageResult<Vec<ConfirmedBlock>> {
        let tables = self.tables.read().await;
        Self::ensure_open(&tables)?;

        let mut blocks: Vec<&BlockRecord> = tables
            .blocks
            .values()
            .filter(|record| record.status == BlockStatus::Confirmed)
            .collect();
        blocks.sort_by(|a, b| {
            a.block
                .timestamp
                .cmp(&b.block.timestamp)
                .then_with(|| a.block.daa_score.cmp(&b.block.daa_score))
        });

        let mut confirmed = Vec::new();
        for record in blocks {
            if confirmed.len() >= limit {
                break;
            }
            // inner join: a block whose coinbase row is missing is skipped
            let payment = record.coinbase_tx.as_ref().and_then(|tx| {
                tables
                    .coinbase_payments
                    .iter()
                    .find(|payment| &payment.tx_id == tx)
            });
            if let Some(payment) = payment {
                confirmed.push(ConfirmedBlock {
                    block: record.block.clone(),
                    coinbase: payment.clone(),
                });
            }
        }
        Ok(confirmed)
    }

    async fn confirm_block(&self, hash: &str, coinbase_tx: &str) -> StorageResult<bool> {
        let updated = {
            let mut tables = self.tables.write().await;
            Self::ensure_open(&tables)?;
            match tables.blocks.get_mut(hash) {
                Some(record) if record.status == BlockStatus::Unconfirmed => {
                    record.status = BlockStatus::Confirmed;
                    record.coinbase_tx = Some(coinbase_tx.to_string());
                    true
                }
                _ => false,
            }
        };
        self.update_last_operation_timestamp().await;
        Ok(updated)
    }

    async fn put_coinbase_payment(&self, payment: &CoinbasePayment) -> StorageResult<bool> {
        let inserted = {
            let mut tables = self.tables.write().await;
            Self::ensure_open(&tables)?;
            let exists = tables.coinbase_payments.iter().any(|existing| {
                existing.wallet == payment.wallet
                    && existing.daa_score == payment.daa_score
                    && existing.tx_id == payment.tx_id
            });
            if !exists {
                tables.coinbase_payments.push(payment.clone());
            }
            !exists
        };
        self.update_last_operation_timestamp().await;
        Ok(inserted)
    }

    async fn find_coinbase_payment(
        &self,
        wallet: &str,
        daa_score: u64,
        window: u64,
    ) -> StorageResult<Option<CoinbasePayment>> {
        let tables = self.tables.read().await;
        Self::ensure_open(&tables)?;

        let upper = daa_score.saturating_add(window);
        Ok(tables
            .coinbase_payments
            .iter()
            .filter(|p| p.wallet == wallet && p.daa_score > daa_score && p.daa_score <= upper)
            .min_by_key(|p| p.daa_score)
            .cloned())
    }

    async fn get_coinbase_tip(&self, wallet: &str) -> StorageResult<Option<u64>> {
        let tables = self.tables.read().await;
        Self::ensure_open(&tables)?;
        Ok(tables
            .coinbase_payments
            .iter()
            .filter(|p| p.wallet == wallet)
            .map(|p| p.daa_score)
            .max())
    }

    async fn commit_block_payouts(
        &self,
        block_hash: &str,
        entries: &[NewLedgerEntry],
    ) -> StorageResult<bool> {
        let committed = {
            let mut tables = self.tables.write().await;
            Self::ensure_open(&tables)?;

            let confirmed = matches!(
                tables.blocks.get(block_hash),
                Some(record) if record.status == BlockStatus::Confirmed
            );
            if !confirmed {
                return Ok(false);
            }

            for entry in entries {
                let id = tables.next_ledger_id;
                tables.next_ledger_id += 1;
                tables.ledger.push(LedgerEntry {
                    id,
                    wallet: entry.wallet.clone(),
                    amount: entry.amount,
                    daa_score: entry.daa_score,
                    block_hash: block_hash.to_string(),
                    status: LedgerEntryStatus::Owed,
                    tx_id: None,
                });
            }
            if let Some(record) = tables.blocks.get_mut(block_hash) {
                record.status = BlockStatus::PaymentPending;
            }
            true
        };
        self.update_last_operation_timestamp().await;
        Ok(committed)
    }

    async fn get_ledger_entries_by_status(
        &self,
        status: LedgerEntryStatus,
        limit: usize,
    ) -> StorageResult<Vec<LedgerEntry>> {
        let tables = self.tables.read().await;
        Self::ensure_open(&tables)?;
        Ok(tables
            .ledger
            .iter()
            .filter(|entry| entry.status == status)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_ledger_entry(
        &self,
        id: u64,
        status: LedgerEntryStatus,
        tx_id: Option<&str>,
    ) -> StorageResult<()> {
        {
            let mut tables = self.tables.write().await;
            Self::ensure_open(&tables)?;
            let entry = tables
                .ledger
                .iter_mut()
                .find(|entry| entry.id == id)
                .ok_or_else(|| StorageError::NotFound(format!("ledger entry {}", id)))?;
            entry.status = status;
            if let Some(tx_id) = tx_id {
                entry.tx_id = Some(tx_id.to_string());
            }
        }
        self.update_last_operation_timestamp().await;
        Ok(())
    }

    async fn health_check(&self) -> StorageResult<StorageHealth> {
        let last_operation = *self.last_operation_timestamp.read().await;
        let closed = self.tables.read().await.closed;

        Ok(StorageHealth {
            is_healthy: !closed,
            backend_type: "memory".to_string(),
            connection_status: if closed { "closed" } else { "connected" }.to_string(),
            last_operation_timestamp: last_operation,
            error_message: None,
        })
    }
}

#[async_trait]
impl ShareDedupStore for MemoryStorage {
    async fn add_if_new(&self, member: &str, score: u64) -> StorageResult<bool> {
        self.share_buffer.add_if_new(member, score).await
    }

    async fn range_by_score(&self, min: u64, max: u64) -> StorageResult<Vec<String>> {
        self.share_buffer.range_by_score(min, max).await
    }

    async fn count(&self) -> StorageResult<u64> {
        self.share_buffer.count().await
    }

    async fn remove_by_score(&self, min: u64, max: u64) -> StorageResult<u64> {
        self.share_buffer.remove_by_score(min, max).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn share(wallet: &str, blue_score: u64, timestamp: u64, difficulty: u64) -> PersistedShare {
        PersistedShare {
            wallet: wallet.to_string(),
            blue_score,
            nonce: blue_score * 31 + timestamp,
            difficulty,
            timestamp,
        }
    }

    fn block(hash: &str, daa_score: u64, timestamp: u64) -> UnconfirmedBlock {
        UnconfirmedBlock {
            hash: hash.to_string(),
            miner: "miner".to_string(),
            payee: "pool".to_string(),
            block_json: "{}".to_string(),
            blue_score: daa_score - 100,
            daa_score,
            timestamp,
        }
    }

    fn payment(tx: &str, wallet: &str, amount: u64, daa_score: u64) -> CoinbasePayment {
        CoinbasePayment {
            tx_id: tx.to_string(),
            wallet: wallet.to_string(),
            amount,
            daa_score,
        }
    }

    async fn storage() -> MemoryStorage {
        let mut storage = MemoryStorage::new();
        storage.initialize().await.unwrap();
        storage
    }

    #[tokio::test]
    async fn test_effort_respects_cutoff_and_window() {
        let storage = storage().await;
        storage.put_share(&share("a", 1, 100, 4)).await.unwrap();
        storage.put_share(&share("b", 2, 101, 4)).await.unwrap();
        storage.put_share(&share("a", 3, 102, 4)).await.unwrap();
        storage.put_share(&share("c", 4, 200, 4)).await.unwrap();

        let effort = storage.get_effort_by_wallet(150, 100).await.unwrap();
        assert_eq!(effort.get("a"), Some(&8));
        assert_eq!(effort.get("b"), Some(&4));
        assert!(effort.get("c").is_none());

        // window counts back from the cutoff
        let effort = storage.get_effort_by_wallet(150, 2).await.unwrap();
        assert_eq!(effort.get("a"), Some(&4));
        assert_eq!(effort.get("b"), Some(&4));
        let effort = storage.get_effort_by_wallet(150, 1).await.unwrap();
        assert_eq!(effort.get("a"), Some(&4));
        assert!(effort.get("b").is_none());
    }

    #[tokio::test]
    async fn test_prune_keeps_highest_blue_scores() {
        let storage = storage().await;
        for score in 1..=10 {
            storage.put_share(&share("a", score, score, 1)).await.unwrap();
        }
        assert_eq!(storage.prune_shares(0).await.unwrap(), 0);
        assert_eq!(storage.prune_shares(20).await.unwrap(), 0);
        assert_eq!(storage.prune_shares(4).await.unwrap(), 6);

        let effort = storage.get_effort_by_wallet(u64::MAX, 100).await.unwrap();
        assert_eq!(effort.get("a"), Some(&4));
    }

    #[tokio::test]
    async fn test_confirm_block_only_from_unconfirmed() {
        let storage = storage().await;
        storage.put_block(&block("h1", 1000, 10)).await.unwrap();
        assert!(storage.put_block(&block("h1", 1000, 10)).await.is_err());

        assert!(storage.confirm_block("h1", "tx1").await.unwrap());
        assert!(!storage.confirm_block("h1", "tx2").await.unwrap());

        let record = storage.get_block("h1").await.unwrap().unwrap();
        assert_eq!(record.status, BlockStatus::Confirmed);
        assert_eq!(record.coinbase_tx.as_deref(), Some("tx1"));
        assert!(storage.get_unconfirmed_blocks(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_coinbase_payment_picks_closest_in_window() {
        let storage = storage().await;
        storage.put_coinbase_payment(&payment("far", "pool", 5, 1030)).await.unwrap();
        storage.put_coinbase_payment(&payment("near", "pool", 5, 1003)).await.unwrap();
        storage.put_coinbase_payment(&payment("other", "x", 5, 1001)).await.unwrap();
        storage.put_coinbase_payment(&payment("same", "pool", 5, 1000)).await.unwrap();

        let found = storage.find_coinbase_payment("pool", 1000, 32).await.unwrap();
        assert_eq!(found.unwrap().tx_id, "near");
        assert!(storage
            .find_coinbase_payment("pool", 1030, 32)
            .await
            .unwrap()
            .is_none());
        assert_eq!(storage.get_coinbase_tip("pool").await.unwrap(), Some(1030));
        assert!(!storage
            .put_coinbase_payment(&payment("near", "pool", 5, 1003))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_commit_block_payouts_requires_confirmed() {
        let storage = storage().await;
        storage.put_block(&block("h1", 1000, 10)).await.unwrap();
        storage.put_coinbase_payment(&payment("tx1", "pool", 1000, 1004)).await.unwrap();

        let entries = vec![NewLedgerEntry {
            wallet: "a".to_string(),
            amount: 1000,
            daa_score: 1000,
        }];
        assert!(!storage.commit_block_payouts("h1", &entries).await.unwrap());
        assert!(storage
            .get_ledger_entries_by_status(LedgerEntryStatus::Owed, 10)
            .await
            .unwrap()
            .is_empty());

        storage.confirm_block("h1", "tx1").await.unwrap();
        let confirmed = storage.get_confirmed_blocks(10).await.unwrap();
        assert_eq!(confirmed.len(), 1);
        assert_eq!(confirmed[0].coinbase.amount, 1000);

        assert!(storage.commit_block_payouts("h1", &entries).await.unwrap());
        assert!(!storage.commit_block_payouts("h1", &entries).await.unwrap());

        let owed = storage
            .get_ledger_entries_by_status(LedgerEntryStatus::Owed, 10)
            .await
            .unwrap();
        assert_eq!(owed.len(), 1);
        assert_eq!(owed[0].block_hash, "h1");
        let record = storage.get_block("h1").await.unwrap().unwrap();
        assert_eq!(record.status, BlockStatus::PaymentPending);

        storage
            .update_ledger_entry(owed[0].id, LedgerEntryStatus::Submitted, Some("payout-tx"))
            .await
            .unwrap();
        let submitted = storage
            .get_ledger_entries_by_status(LedgerEntryStatus::Submitted, 10)
            .await
            .unwrap();
        assert_eq!(submitted[0].tx_id.as_deref(), Some("payout-tx"));
    }

    #[tokio::test]
    async fn test_closed_backend_is_unavailable() {
        let storage = storage().await;
        storage.close().await.unwrap();
        assert!(matches!(
            storage.put_share(&share("a", 1, 1, 1)).await,
            Err(StorageError::BackendUnavailable)
        ));
        assert!(!storage.health_check().await.unwrap().is_healthy);
    }
}
