//! Trait interface for the pool's system of record.

use async_trait::async_trait;

use crate::{
    error::StorageResult,
    types::{
        BlockRecord, CoinbasePayment, ConfirmedBlock, EffortMap, LedgerEntry, LedgerEntryStatus,
        NewLedgerEntry, PersistedShare, UnconfirmedBlock,
    },
};

/// Persistence for shares, mined blocks, coinbase payments and the payout ledger.
///
/// Writers and readers share one instance behind an `Arc`, so every operation after
/// [`PoolStorage::initialize`] takes `&self` and backends provide their own locking or
/// transactions.
#[async_trait]
pub trait PoolStorage: Send + Sync {
    /// Initialize the storage backend (create tables, directories, etc.)
    async fn initialize(&mut self) -> StorageResult<()>;

    /// Release backend resources. Further calls fail with `BackendUnavailable`.
    async fn close(&self) -> StorageResult<()>;

    // === Shares ===

    async fn put_share(&self, share: &PersistedShare) -> StorageResult<()>;

    /// Sum share difficulty per wallet over the `window` most recent shares with
    /// `timestamp <= before`.
    async fn get_effort_by_wallet(&self, before: u64, window: u64) -> StorageResult<EffortMap>;

    /// Delete every share whose blue score is below the lowest blue score among the
    /// `keep` highest-scored shares. Returns the number of deleted rows.
    async fn prune_shares(&self, keep: u64) -> StorageResult<u64>;

    // === Blocks ===

    /// Record a block accepted by the node with status `unconfirmed`.
    async fn put_block(&self, block: &UnconfirmedBlock) -> StorageResult<()>;

    async fn get_block(&self, hash: &str) -> StorageResult<Option<BlockRecord>>;

    /// Unconfirmed blocks, oldest first.
    async fn get_unconfirmed_blocks(&self, limit: usize) -> StorageResult<Vec<UnconfirmedBlock>>;

    /// Confirmed blocks joined with their coinbase payment, oldest first.
    async fn get_confirmed_blocks(&self, limit: usize) -> StorageResult<Vec<ConfirmedBlock>>;

    /// Stamp a block with its coinbase transaction and move it to `confirmed`.
    ///
    /// Only applies while the block is still `unconfirmed`; returns whether it did.
    async fn confirm_block(&self, hash: &str, coinbase_tx: &str) -> StorageResult<bool>;

    // === Coinbase payments ===

    /// Returns `false` when the payment was already recorded.
    async fn put_coinbase_payment(&self, payment: &CoinbasePayment) -> StorageResult<bool>;

    /// Closest payment to `wallet` with `daa_score < d <= daa_score + window`.
    async fn find_coinbase_payment(
        &self,
        wallet: &str,
        daa_score: u64,
        window: u64,
    ) -> StorageResult<Option<CoinbasePayment>>;

    /// Highest daa score ingested for `wallet`.
    async fn get_coinbase_tip(&self, wallet: &str) -> StorageResult<Option<u64>>;

    // === Ledger ===

    /// Write `entries` as `owed` and advance the block from `confirmed` to
    /// `payment_pending` in one transaction.
    ///
    /// Returns `false` without writing anything when the block is not `confirmed`.
    async fn commit_block_payouts(
        &self,
        block_hash: &str,
        entries: &[NewLedgerEntry],
    ) -> StorageResult<bool>;

    async fn get_ledger_entries_by_status(
        &self,
        status: LedgerEntryStatus,
        limit: usize,
    ) -> StorageResult<Vec<LedgerEntry>>;

    async fn update_ledger_entry(
        &self,
        id: u64,
        status: LedgerEntryStatus,
        tx_id: Option<&str>,
    ) -> StorageResult<()>;

    /// Health check for the storage backend
    async fn health_check(&self) -> StorageResult<StorageHealth>;
}

/// Storage backend health information
#[derive(Debug, Clone)]
pub struct StorageHealth {
    pub is_healthy: bool,
    pub backend_type: String,
    pub connection_status: String,
    pub last_operation_timestamp: Option<u64>,
    pub error_message: Option<String>,
}
